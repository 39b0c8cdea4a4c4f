//! In-memory status aggregation engine for a cluster management platform.
//!
//! External checker agents report fine-grained liveness ("host X component C
//! is up/down"). The engine records those reports in serialized TTL stores,
//! rolls them up along the cluster topology while honoring maintenance-mode
//! exclusions, and publishes a change notification whenever a recomputed
//! aggregate differs from the last one seen.

pub mod aggregate;
pub mod events;
pub mod hub;
pub mod maintenance;
pub mod status;
pub mod store;
pub mod topology;

use thiserror::Error;

/// Failure of a serialized worker component.
///
/// Every store, the topology registry and the broadcast hub run as a single
/// worker task behind a request channel. The only way a call can fail is the
/// worker being gone, which happens during shutdown.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The worker task behind the request channel has terminated.
    #[error("{0} worker has shut down")]
    WorkerGone(&'static str),
}
