//! Task identifiers.
//!
//! ULID-based: sortable by creation time, generatable without coordination,
//! UUID-sized. Assigned by the queue at enqueue time.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::Clock;

#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(Ulid);

impl TaskId {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Generate a fresh id with the ULID timestamp taken from `clock`.
    pub fn generate(clock: &dyn Clock) -> Self {
        let timestamp_ms = clock.now().timestamp_millis() as u64;
        Self(Ulid::from_parts(timestamp_ms, rand::random()))
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for TaskId {
    fn from(ulid: Ulid) -> Self {
        Self(ulid)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}
