use thiserror::Error;

use crate::domain::TaskId;

/// Errors surfaced by the queue and wiring layers.
///
/// Delivery failures are *not* represented here: a non-2xx response or a
/// connection error is an ordinary [`crate::domain::DeliveryOutcome`] that the
/// dispatcher feeds back into the queue. Only faults that require the caller
/// (or an operator) to act become errors.
#[derive(Debug, Error)]
pub enum CourierError {
    /// The persistence layer failed. Fatal to the operation that hit it,
    /// never silently swallowed.
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("unknown task {0}")]
    TaskNotFound(TaskId),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
