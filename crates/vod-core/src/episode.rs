use vod_proto::protocol::{Direction, Episode};

use crate::error::NavError;

/// Active position inside one video's episode list.
///
/// `current` is always a valid index into `episodes`, or `None` when the list
/// is empty.
#[derive(Debug, Clone, Default)]
pub struct EpisodeNavigator {
    episodes: Vec<Episode>,
    current: Option<usize>,
}

/// Parse a raw requested-episode parameter. Anything that is not a plain
/// non-negative integer yields `None`.
pub fn parse_requested_episode(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok()
}

impl EpisodeNavigator {
    pub fn new(episodes: Vec<Episode>) -> Self {
        Self {
            episodes,
            current: None,
        }
    }

    pub fn episodes(&self) -> &[Episode] {
        &self.episodes
    }

    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn play_url(&self) -> Option<&str> {
        self.current.map(|i| self.episodes[i].url.as_str())
    }

    pub fn select_episode(&mut self, index: usize) -> Result<&Episode, NavError> {
        if index >= self.episodes.len() {
            return Err(NavError::OutOfRange {
                index,
                len: self.episodes.len(),
            });
        }
        self.current = Some(index);
        Ok(&self.episodes[index])
    }

    /// The requested index when valid, otherwise the first episode for
    /// forward traversal or the last one for reversed traversal. `None` only
    /// for an empty list.
    pub fn resolve_initial_index(
        &self,
        requested: Option<usize>,
        direction: Direction,
    ) -> Option<usize> {
        let len = self.episodes.len();
        if len == 0 {
            return None;
        }
        match requested {
            Some(i) if i < len => Some(i),
            _ => Some(match direction {
                Direction::Forward => 0,
                Direction::Reversed => len - 1,
            }),
        }
    }

    /// Index the next step in `direction` would land on, if it exists.
    pub fn peek_next(&self, direction: Direction) -> Option<usize> {
        let current = self.current?;
        match direction {
            Direction::Forward => Some(current + 1).filter(|&i| i < self.episodes.len()),
            Direction::Reversed => current.checked_sub(1),
        }
    }

    pub fn has_next(&self, direction: Direction) -> bool {
        self.peek_next(direction).is_some()
    }

    /// Step once in `direction`. At the end of the list this is a no-op and
    /// returns `None`.
    pub fn next(&mut self, direction: Direction) -> Option<&Episode> {
        let target = self.peek_next(direction)?;
        self.current = Some(target);
        Some(&self.episodes[target])
    }
}
