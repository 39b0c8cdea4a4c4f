//! Maintenance-mode exclusions.
//!
//! Objects under maintenance are skipped by aggregation, not demoted: their
//! reports simply stop participating in roll-ups. The sets are small and
//! replaced wholesale by the management platform, so membership is a linear
//! scan over a mutex-guarded snapshot.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// The wire shape of the maintenance set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaintenanceObjects {
    #[serde(default)]
    pub hosts: Vec<i64>,
    #[serde(default)]
    pub services: Vec<i64>,
    #[serde(default)]
    pub components: Vec<i64>,
}

/// Mutex-guarded maintenance snapshot.
#[derive(Debug, Default)]
pub struct MaintenanceSet {
    data: Mutex<MaintenanceObjects>,
}

impl MaintenanceSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole snapshot.
    pub fn replace(&self, objects: MaintenanceObjects) {
        *self.data.lock() = objects;
    }

    /// Clone the current snapshot, for reads and for aggregation passes
    /// that want one consistent view.
    #[must_use]
    pub fn snapshot(&self) -> MaintenanceObjects {
        self.data.lock().clone()
    }
}
