//! The status value reported by checkers and returned by aggregation.

use serde::{Deserialize, Serialize};

/// Everything is running.
pub const STATUS_OK: i32 = 0;
/// No report has been received (or the last one expired).
pub const STATUS_UNDEFINED: i32 = 16;
/// The object has no members to aggregate over.
pub const STATUS_EMPTY: i32 = 32;

/// Reserved outer key under which a host's overall status is stored.
pub const ALL_HOSTS: i64 = 100_001;

/// A single status value.
///
/// `status` is passed through from producers as-is: `0` is up, `16`
/// undefined, `32` empty, any other nonzero is down or degraded. `counter`
/// is an internal revision incremented on every overwrite of a store slot;
/// it never reaches the wire and exists so a scheduled eviction can tell
/// whether the slot was refreshed after the eviction was armed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Status {
    #[serde(default)]
    pub status: i32,
    #[serde(skip)]
    pub counter: u64,
}

impl Status {
    /// A fresh value with revision zero.
    #[must_use]
    pub const fn new(status: i32) -> Self {
        Self { status, counter: 0 }
    }

    /// The sentinel returned for slots that hold no report.
    #[must_use]
    pub const fn undefined() -> Self {
        Self {
            status: STATUS_UNDEFINED,
            counter: 0,
        }
    }

    /// Whether the numeric status spells "up" on the wire.
    #[must_use]
    pub const fn is_up(&self) -> bool {
        self.status == STATUS_OK
    }
}
