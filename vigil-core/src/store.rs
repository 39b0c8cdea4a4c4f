//! Serialized two-level keyed store with per-entry TTL eviction.
//!
//! All operations are executed one at a time by a single worker task
//! consuming a request channel; callers block on a oneshot reply. That
//! serialization removes per-key locking and gives a total order on
//! mutations, which the eviction protocol relies on.
//!
//! Eviction protocol: after applying a write, the worker captures the slot's
//! revision counter and schedules a `clear` for that (outer, inner, counter)
//! back onto its own input channel once the TTL elapses. When the clear
//! runs, the slot is removed only if its counter still matches the captured
//! one; a slot refreshed in the interim keeps the newer value and the clear
//! is a no-op. An entry is therefore evicted iff it was not refreshed within
//! the TTL window.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::CoreError;
use crate::status::Status;

/// Outcome of a `set`, surfaced to producers as the HTTP response code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetCode {
    /// The slot already existed and was overwritten.
    Updated,
    /// The slot was created.
    Created,
}

/// An entry that was actually removed by TTL eviction.
///
/// No notification is produced for clears that lost the counter race: the
/// slot still holds a fresh value, so nothing observable changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evicted {
    pub outer: i64,
    pub inner: i64,
}

enum Request {
    Set {
        outer: i64,
        inner: i64,
        value: Status,
        reply: oneshot::Sender<SetCode>,
    },
    Get {
        outer: i64,
        inner: i64,
        reply: oneshot::Sender<(Status, bool)>,
    },
    GetAll {
        outer: i64,
        reply: oneshot::Sender<(HashMap<i64, Status>, bool)>,
    },
    Clear {
        outer: i64,
        inner: i64,
        counter: u64,
    },
    Purge {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a serialized status store.
#[derive(Clone)]
pub struct StatusStore {
    name: &'static str,
    tx: mpsc::Sender<Request>,
}

impl StatusStore {
    /// Spawn the worker task and return the store handle together with the
    /// stream of effective evictions.
    #[must_use]
    pub fn spawn(name: &'static str, ttl: Duration) -> (Self, mpsc::UnboundedReceiver<Evicted>) {
        let (tx, rx) = mpsc::channel(64);
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            name,
            ttl,
            tx: tx.clone(),
            evictions: evict_tx,
            slots: HashMap::new(),
        };
        tokio::spawn(worker.run(rx));
        (Self { name, tx }, evict_rx)
    }

    /// Write a value and arm its TTL eviction.
    ///
    /// Returns [`SetCode::Updated`] when the slot existed, [`SetCode::Created`]
    /// otherwise. The incoming value's counter is ignored; the slot's own
    /// revision advances on overwrite and starts at zero on creation.
    pub async fn set(&self, outer: i64, inner: i64, value: Status) -> Result<SetCode, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Set {
            outer,
            inner,
            value,
            reply,
        })
        .await?;
        rx.await.map_err(|_| CoreError::WorkerGone(self.name))
    }

    /// Read one slot. A missing slot yields the undefined sentinel and `false`.
    pub async fn get(&self, outer: i64, inner: i64) -> Result<(Status, bool), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Get { outer, inner, reply }).await?;
        rx.await.map_err(|_| CoreError::WorkerGone(self.name))
    }

    /// Read every inner slot under an outer key.
    pub async fn get_all(&self, outer: i64) -> Result<(HashMap<i64, Status>, bool), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::GetAll { outer, reply }).await?;
        rx.await.map_err(|_| CoreError::WorkerGone(self.name))
    }

    /// Replace the backing store with an empty one.
    pub async fn purge(&self) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Purge { reply }).await?;
        rx.await.map_err(|_| CoreError::WorkerGone(self.name))
    }

    async fn send(&self, req: Request) -> Result<(), CoreError> {
        self.tx
            .send(req)
            .await
            .map_err(|_| CoreError::WorkerGone(self.name))
    }
}

struct Worker {
    name: &'static str,
    ttl: Duration,
    tx: mpsc::Sender<Request>,
    evictions: mpsc::UnboundedSender<Evicted>,
    slots: HashMap<i64, HashMap<i64, Status>>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Request>) {
        while let Some(req) = rx.recv().await {
            match req {
                Request::Set {
                    outer,
                    inner,
                    value,
                    reply,
                } => {
                    let (code, counter) = self.apply_set(outer, inner, value);
                    self.schedule_clear(outer, inner, counter);
                    let _ = reply.send(code);
                }
                Request::Get { outer, inner, reply } => {
                    let slot = self.slots.get(&outer).and_then(|m| m.get(&inner));
                    let _ = reply.send(match slot {
                        Some(val) => (*val, true),
                        None => (Status::undefined(), false),
                    });
                }
                Request::GetAll { outer, reply } => {
                    let _ = reply.send(match self.slots.get(&outer) {
                        Some(m) => (m.clone(), true),
                        None => (HashMap::new(), false),
                    });
                }
                Request::Clear {
                    outer,
                    inner,
                    counter,
                } => self.apply_clear(outer, inner, counter),
                Request::Purge { reply } => {
                    self.slots = HashMap::new();
                    let _ = reply.send(());
                }
            }
        }
    }

    fn apply_set(&mut self, outer: i64, inner: i64, mut value: Status) -> (SetCode, u64) {
        let slot = self.slots.entry(outer).or_default();
        let code = match slot.get(&inner) {
            Some(old) => {
                value.counter = old.counter + 1;
                SetCode::Updated
            }
            None => {
                value.counter = 0;
                SetCode::Created
            }
        };
        slot.insert(inner, value);
        (code, value.counter)
    }

    fn schedule_clear(&self, outer: i64, inner: i64, counter: u64) {
        let tx = self.tx.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let _ = tx
                .send(Request::Clear {
                    outer,
                    inner,
                    counter,
                })
                .await;
        });
    }

    fn apply_clear(&mut self, outer: i64, inner: i64, counter: u64) {
        let Some(slot) = self.slots.get_mut(&outer) else {
            return;
        };
        // Only evict if the slot was not refreshed after this clear was armed.
        if slot.get(&inner).map(|v| v.counter) != Some(counter) {
            return;
        }
        slot.remove(&inner);
        if slot.is_empty() {
            self.slots.remove(&outer);
        }
        debug!("{}: evicted ({outer}, {inner})", self.name);
        let _ = self.evictions.send(Evicted { outer, inner });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::STATUS_UNDEFINED;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn set_reports_created_then_updated() {
        let (store, _evictions) = StatusStore::spawn("test", TTL);
        assert_eq!(store.set(1, 2, Status::new(0)).await.unwrap(), SetCode::Created);
        assert_eq!(store.set(1, 2, Status::new(4)).await.unwrap(), SetCode::Updated);
        let (val, found) = store.get(1, 2).await.unwrap();
        assert!(found);
        assert_eq!(val.status, 4);
        assert_eq!(val.counter, 1);
    }

    #[tokio::test]
    async fn missing_slot_yields_undefined_sentinel() {
        let (store, _evictions) = StatusStore::spawn("test", TTL);
        let (val, found) = store.get(7, 8).await.unwrap();
        assert!(!found);
        assert_eq!(val.status, STATUS_UNDEFINED);

        let (all, found) = store.get_all(7).await.unwrap();
        assert!(!found);
        assert!(all.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unrefreshed_entry_is_evicted_exactly_once() {
        let (store, mut evictions) = StatusStore::spawn("test", TTL);
        store.set(1, 2, Status::new(0)).await.unwrap();

        tokio::time::sleep(TTL + Duration::from_secs(1)).await;
        let (val, found) = store.get(1, 2).await.unwrap();
        assert!(!found);
        assert_eq!(val.status, STATUS_UNDEFINED);

        assert_eq!(evictions.recv().await, Some(Evicted { outer: 1, inner: 2 }));
        assert!(evictions.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_within_ttl_defers_eviction() {
        let (store, mut evictions) = StatusStore::spawn("test", TTL);
        store.set(1, 2, Status::new(0)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        store.set(1, 2, Status::new(4)).await.unwrap();

        // The first timer fires here and must lose the counter race.
        tokio::time::sleep(Duration::from_secs(40)).await;
        let (val, found) = store.get(1, 2).await.unwrap();
        assert!(found);
        assert_eq!(val.status, 4);
        assert!(evictions.try_recv().is_err());

        // A full TTL after the refresh the slot goes away.
        tokio::time::sleep(Duration::from_secs(25)).await;
        let (_, found) = store.get(1, 2).await.unwrap();
        assert!(!found);
        assert_eq!(evictions.recv().await, Some(Evicted { outer: 1, inner: 2 }));
    }

    #[tokio::test]
    async fn purge_drops_everything() {
        let (store, _evictions) = StatusStore::spawn("test", TTL);
        store.set(1, 2, Status::new(0)).await.unwrap();
        store.set(3, 4, Status::new(8)).await.unwrap();
        store.purge().await.unwrap();
        assert!(!store.get(1, 2).await.unwrap().1);
        assert!(!store.get(3, 4).await.unwrap().1);
    }
}
