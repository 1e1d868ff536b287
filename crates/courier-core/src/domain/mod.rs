//! Domain model: identifiers, the delivery envelope, and delivery outcomes.

mod envelope;
mod ids;
mod outcome;

pub use envelope::TaskEnvelope;
pub use ids::TaskId;
pub use outcome::{DeliveryOutcome, Disposition};
