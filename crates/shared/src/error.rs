use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Optional error body returned by REST endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiErrorBody {
    /// Extracts a non-blank `message` from a raw response body, if any.
    pub fn server_message(raw: &[u8]) -> Option<String> {
        let body: ApiErrorBody = serde_json::from_slice(raw).ok()?;
        body.message
            .map(|message| message.trim().to_string())
            .filter(|message| !message.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid realtime frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),
}
