//! Detail lookup collaborator: resolves a video id on a source into its
//! metadata and episode list.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;
use vod_proto::protocol::{DetailResponse, SourceRef, VideoDetail};

use crate::error::SessionError;

#[async_trait]
pub trait DetailLookup: Send + Sync {
    async fn fetch(&self, video_id: &str, source: &SourceRef) -> Result<VideoDetail, SessionError>;
}

/// Talks to the detail endpoint over HTTP. Configured sources are POSTed with
/// their full config; bare ids go as query parameters.
pub struct HttpDetailClient {
    client: reqwest::Client,
    endpoint: String,
    timeout: Duration,
}

impl HttpDetailClient {
    pub fn new(client: reqwest::Client, endpoint: String, timeout: Duration) -> Self {
        Self {
            client,
            endpoint,
            timeout,
        }
    }
}

#[async_trait]
impl DetailLookup for HttpDetailClient {
    async fn fetch(&self, video_id: &str, source: &SourceRef) -> Result<VideoDetail, SessionError> {
        let request = match source {
            SourceRef::Configured(cfg) => self
                .client
                .post(&self.endpoint)
                .json(&json!({ "id": video_id, "source": cfg })),
            SourceRef::Bare { id } => self
                .client
                .get(&self.endpoint)
                .query(&[("id", video_id), ("source", id.as_str())]),
        };

        debug!("detail: {} on {}", video_id, source.id());
        let resp = request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SessionError::DetailError(e.to_string()))?;

        let status = resp.status().as_u16();
        let body = resp.json::<DetailResponse>().await.ok();
        interpret_response(status, body)
    }
}

/// Map an HTTP status and (possibly unparseable) body onto the session
/// error taxonomy.
pub fn interpret_response(
    status: u16,
    body: Option<DetailResponse>,
) -> Result<VideoDetail, SessionError> {
    let upstream_error = body.as_ref().and_then(|b| b.error.clone());

    if status == 404 {
        return Err(SessionError::DetailUnavailable(upstream_error.unwrap_or_else(|| {
            "this video source is not available, try another source".to_string()
        })));
    }
    if !(200..300).contains(&status) {
        return Err(SessionError::DetailError(
            upstream_error.unwrap_or_else(|| format!("HTTP {status}")),
        ));
    }

    match body {
        Some(DetailResponse {
            success: true,
            data: Some(data),
            ..
        }) => Ok(data),
        _ => Err(SessionError::DetailError(
            upstream_error.unwrap_or_else(|| "invalid response from detail API".to_string()),
        )),
    }
}
