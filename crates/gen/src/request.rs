use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// One unit of generation work, as handed to a [`crate::Generator`].
///
/// The `spec` body is opaque to the batch subsystem: it is stored, passed
/// through, and never interpreted. Only the `label` is surfaced in progress
/// snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenRequest {
    /// Short human-readable label (shown in progress reporting).
    pub label: String,

    /// Opaque generation parameters (prompt, model hints, sizes, ...).
    pub spec: JsonValue,
}

impl GenRequest {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            spec: JsonValue::Null,
        }
    }

    pub fn with_spec(mut self, spec: JsonValue) -> Self {
        self.spec = spec;
        self
    }
}
