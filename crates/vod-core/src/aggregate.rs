//! Grouping of search results by title, ranked by measured latency.
//!
//! Everything here is a pure function of its input. Groups are rebuilt from
//! the current source set on every change instead of being patched.

use std::collections::HashMap;

use vod_proto::config::SearchDisplayMode;
use vod_proto::protocol::{SourceGroup, VideoSource};

/// Group `videos` by normalized title. Groups appear in order of their first
/// member in the input; members are ranked by latency with unmeasured
/// sources last, ties keeping input order.
pub fn group(videos: &[VideoSource]) -> Vec<SourceGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<SourceGroup> = Vec::new();

    for video in videos {
        let key = video.group_key();
        match index.get(&key) {
            Some(&i) => groups[i].members.push(video.clone()),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push(SourceGroup {
                    key,
                    members: vec![video.clone()],
                });
            }
        }
    }

    for group in &mut groups {
        rank(&mut group.members);
    }
    groups
}

/// Stable latency sort, unmeasured last.
pub fn rank(members: &mut [VideoSource]) {
    members.sort_by_key(|v| (v.latency_ms.is_none(), v.latency_ms.unwrap_or(0)));
}

/// Copy of `videos` with the latest known latency folded in. Sources without
/// a sample keep whatever latency they arrived with.
pub fn annotate(videos: &[VideoSource], latencies: &HashMap<String, u64>) -> Vec<VideoSource> {
    videos
        .iter()
        .map(|v| {
            let mut v = v.clone();
            if let Some(&ms) = latencies.get(&v.id) {
                v.latency_ms = Some(ms);
            }
            v
        })
        .collect()
}

/// Shape results for display: real groups in grouped mode, one singleton
/// group per result otherwise.
pub fn arrange(videos: &[VideoSource], mode: SearchDisplayMode) -> Vec<SourceGroup> {
    match mode {
        SearchDisplayMode::Grouped => group(videos),
        SearchDisplayMode::Normal => videos
            .iter()
            .map(|v| SourceGroup {
                key: v.group_key(),
                members: vec![v.clone()],
            })
            .collect(),
    }
}
