//! Runtime-adjustable log level.
//!
//! The initial level comes from `STATUS_LOG_LEVEL` (falling back to
//! `LOG_LEVEL`, then to `ERROR`), and the level endpoint can change it
//! while the process runs through a reload handle into the subscriber
//! stack. `CRITICAL` is accepted and reported but filters like `ERROR`;
//! tracing has no separate level for it.

use parking_lot::Mutex;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{Registry, reload};

/// Translate a platform level name into a tracing filter and the canonical
/// spelling reported back on the wire.
#[must_use]
pub fn decode_level(name: &str) -> Option<(LevelFilter, &'static str)> {
    match name.to_ascii_uppercase().as_str() {
        "DEBUG" => Some((LevelFilter::DEBUG, "DEBUG")),
        "INFO" => Some((LevelFilter::INFO, "INFO")),
        "WARNING" => Some((LevelFilter::WARN, "WARNING")),
        "ERROR" => Some((LevelFilter::ERROR, "ERROR")),
        "CRITICAL" => Some((LevelFilter::ERROR, "CRITICAL")),
        _ => None,
    }
}

/// Pick the startup level from the environment.
#[must_use]
pub fn level_from_env() -> (LevelFilter, &'static str) {
    std::env::var("STATUS_LOG_LEVEL")
        .or_else(|_| std::env::var("LOG_LEVEL"))
        .ok()
        .and_then(|name| decode_level(&name))
        .unwrap_or((LevelFilter::ERROR, "ERROR"))
}

/// Shared handle behind `GET`/`POST /api/v1/log/`.
pub struct LogControl {
    level: Mutex<&'static str>,
    reload: Option<reload::Handle<LevelFilter, Registry>>,
}

impl LogControl {
    #[must_use]
    pub fn new(level: &'static str, reload: reload::Handle<LevelFilter, Registry>) -> Self {
        Self {
            level: Mutex::new(level),
            reload: Some(reload),
        }
    }

    /// A control without a subscriber stack attached; level changes are
    /// remembered but filter nothing. Used by tests.
    #[must_use]
    pub fn detached(level: &'static str) -> Self {
        Self {
            level: Mutex::new(level),
            reload: None,
        }
    }

    /// The currently reported level name.
    #[must_use]
    pub fn current(&self) -> &'static str {
        *self.level.lock()
    }

    /// Apply a new level by its platform name.
    ///
    /// Returns `false` for names outside the accepted set.
    pub fn set(&self, name: &str) -> bool {
        let Some((filter, canonical)) = decode_level(name) else {
            return false;
        };
        if let Some(handle) = &self.reload {
            if let Err(err) = handle.reload(filter) {
                tracing::error!("failed to reload log level: {err}");
                return false;
            }
        }
        *self.level.lock() = canonical;
        true
    }
}
