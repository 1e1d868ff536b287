//! Delivery outcome model.
//!
//! A delivery attempt always produces a [`DeliveryOutcome`] value; a non-2xx
//! response is data, not an error. Retry is a decision derived from that data
//! by [`DeliveryOutcome::disposition`], never exception-style control flow.

use serde::{Deserialize, Serialize};

/// Result of one HTTP delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The request never completed: connect failure, DNS, timeout.
    Transport { error: String },

    /// The sink answered with an HTTP status and (possibly empty) body.
    Status { code: u16, body: String },
}

/// What the dispatcher should do with an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 2xx: acknowledge and finish the task.
    Success,

    /// Worth another attempt after backoff (transport error, 429, 5xx, and
    /// by default any other non-2xx status).
    Retry,

    /// Client error under the fast-fail policy: dead-letter immediately.
    FastFail,
}

impl DeliveryOutcome {
    pub fn transport(error: impl Into<String>) -> Self {
        Self::Transport {
            error: error.into(),
        }
    }

    pub fn status(code: u16, body: impl Into<String>) -> Self {
        Self::Status {
            code,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Status { code, .. } if (200..300).contains(code))
    }

    /// Classify the outcome.
    ///
    /// `fast_fail_client_errors` controls statuses in [300, 500) except 429:
    /// by default they are retried up to the attempt budget (the sink may be
    /// transiently misconfigured); when set, one such response dead-letters
    /// the task.
    pub fn disposition(&self, fast_fail_client_errors: bool) -> Disposition {
        match self {
            Self::Transport { .. } => Disposition::Retry,
            Self::Status { code, .. } => match *code {
                200..=299 => Disposition::Success,
                429 => Disposition::Retry,
                c if c >= 500 => Disposition::Retry,
                _ if fast_fail_client_errors => Disposition::FastFail,
                _ => Disposition::Retry,
            },
        }
    }

    /// One-line description for `last_error` and log fields.
    pub fn describe(&self) -> String {
        match self {
            Self::Transport { error } => format!("transport error: {error}"),
            Self::Status { code, body } if body.is_empty() => {
                format!("sink returned status {code}")
            }
            Self::Status { code, body } => format!("sink returned status {code}: {body}"),
        }
    }
}
