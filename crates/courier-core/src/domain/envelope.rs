use serde::{Deserialize, Serialize};

/// What a task carries: a group tag, the serialized payload, and a
/// correlation id.
///
/// The payload is opaque bytes (typically a JSON array produced by a
/// [`crate::payload::PayloadBuilder`]); the queue and dispatcher never look
/// inside it. The correlation id exists only so operators can trace one
/// source event through enqueue, attempts, and the final outcome in the logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    group: String,
    payload: Vec<u8>,
    correlation_id: String,
}

impl TaskEnvelope {
    pub fn new(
        group: impl Into<String>,
        payload: Vec<u8>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            payload,
            correlation_id: correlation_id.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}
