//! Submission facade: the one entry point the scraping pipeline calls when a
//! product has fresh data.

use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{TaskEnvelope, TaskId};
use crate::error::CourierError;
use crate::payload::{BuildRules, PayloadBuilder, SourceProduct};
use crate::queue::Queue;

/// Builds a payload for a source product and enqueues it for delivery.
///
/// Submission is decoupled from delivery: this returns as soon as the task is
/// durable, and the dispatcher sends it in the background. A disabled service
/// or an empty payload is a silent skip, never an error.
pub struct CourierService {
    queue: Arc<dyn Queue>,
    builder: Arc<dyn PayloadBuilder>,
    rules: BuildRules,
    group: String,
    enabled: bool,
}

impl CourierService {
    pub fn new(
        queue: Arc<dyn Queue>,
        builder: Arc<dyn PayloadBuilder>,
        rules: BuildRules,
        group: impl Into<String>,
        enabled: bool,
    ) -> Self {
        Self {
            queue,
            builder,
            rules,
            group: group.into(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enqueue a delivery for `source`. Returns the task id, or `None` when
    /// the integration is disabled or the builder declined.
    pub async fn submit(&self, source: &SourceProduct) -> Result<Option<TaskId>, CourierError> {
        if !self.enabled {
            debug!(product_id = source.id, "integration disabled, skipping");
            return Ok(None);
        }

        let Some(payload) = self.builder.build(source, &self.rules) else {
            debug!(product_id = source.id, "nothing to send, skipping");
            return Ok(None);
        };

        let correlation_id = format!("product-{}", source.id);
        let id = self
            .queue
            .enqueue(TaskEnvelope::new(&self.group, payload, &correlation_id))
            .await?;
        info!(task_id = %id, correlation_id = %correlation_id, "delivery queued");
        Ok(Some(id))
    }
}
