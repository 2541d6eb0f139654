use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Reference to a produced artifact.
///
/// This is *not* the artifact itself. It is an opaque pointer (storage URI,
/// CDN path, provider asset id) that higher layers can persist or display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Where the artifact lives (provider/storage specific).
    pub uri: String,

    /// Free-form metadata (model name, seed, timings, etc).
    pub metadata: JsonValue,
}

impl ArtifactRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            metadata: JsonValue::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: JsonValue) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Failure of the generation capability for a single request.
///
/// These are per-item failures: the batch subsystem records them against the
/// item and keeps going.
#[derive(Debug, Error)]
pub enum GenError {
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    #[error("generation failed: {0}")]
    Failed(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GenError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
