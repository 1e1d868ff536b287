//! courier-core
//!
//! Durable at-least-once webhook delivery for scraped product data.
//!
//! # Module layout
//! - **domain**: value types (ids, envelope, outcome)
//! - **payload**: source snapshots and the payload builder
//! - **queue**: task state machine, retry policy, queue port + in-memory and
//!   SQLite implementations
//! - **client**: delivery port and the reqwest-backed webhook sink
//! - **dispatcher**: worker group draining the queue
//! - **service**: submission facade called by the scraping pipeline
//! - **config**: operator-facing settings and glue
//! - **clock**, **error**: shared plumbing

pub mod client;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod payload;
pub mod queue;
pub mod service;

pub use client::{DeliverySink, WebhookClient, WebhookConfig};
pub use clock::{Clock, SystemClock};
pub use config::CourierConfig;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use domain::{DeliveryOutcome, TaskEnvelope, TaskId};
pub use error::CourierError;
pub use payload::{BuildRules, PayloadBuilder, SourceProduct, SourceVariant, VariationPayloadBuilder};
pub use queue::{MemoryQueue, Queue, QueueCounts, RetryPolicy, SqliteQueue, TaskRecord, TaskState};
pub use service::CourierService;
