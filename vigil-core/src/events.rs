//! Differential change events.
//!
//! Every status write goes through a save → write → check round-trip: the
//! aggregates that the write can influence are snapshotted before the store
//! is touched, recomputed afterwards, and a push event is emitted for each
//! one whose numeric value actually changed. The previous-aggregate map is
//! also refreshed when a TTL eviction fires, so an expiring report produces
//! the same kind of notification as an explicit one.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::CoreError;
use crate::aggregate::StatusSources;
use crate::hub::EventHub;
use crate::status::{ALL_HOSTS, STATUS_OK};
use crate::topology::{ClusterService, placement_key};

/// The kinds of object a push event can describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Component,
    Service,
    Cluster,
    Host,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Component => "component",
            Self::Service => "service",
            Self::Cluster => "cluster",
            Self::Host => "host",
        })
    }
}

/// Wire spelling of an up/down transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatusChanges {
    #[serde(default)]
    pub status: String,
}

/// The object half of a push event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventObject {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub changes: StatusChanges,
}

/// One push event, sent to subscribers as a single JSON text frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventMessage {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub object: EventObject,
}

impl EventMessage {
    /// Build an `update_<kind>` event for the given numeric status.
    #[must_use]
    pub fn update(kind: EventKind, id: i64, status: i32) -> Self {
        Self {
            event: format!("update_{kind}"),
            object: EventObject {
                id,
                changes: StatusChanges {
                    status: if status == STATUS_OK { "up" } else { "down" }.to_string(),
                },
            },
        }
    }
}

/// Last observed aggregates for one synthetic key.
#[derive(Debug, Clone, Copy, Default)]
struct AggregateSnapshot {
    cluster: i32,
    service: i32,
    component: i32,
    host: i32,
}

fn hc_key(host: i64, component: i64) -> String {
    format!("hc.{}", placement_key(host, component))
}

fn host_key(host: i64) -> String {
    format!("host.{host}")
}

fn cluster_key(cluster: i64) -> String {
    format!("cluster.{cluster}")
}

/// The differential emitter.
///
/// The previous-aggregate map is shared by every handler and the eviction
/// listeners; each synthetic key is read and written atomically under the
/// lock, while the aggregate recomputation happens outside it.
pub struct StatusEvents {
    previous: Mutex<HashMap<String, AggregateSnapshot>>,
    hub: EventHub,
}

impl StatusEvents {
    #[must_use]
    pub fn new(hub: EventHub) -> Self {
        Self {
            previous: Mutex::new(HashMap::new()),
            hub,
        }
    }

    /// Snapshot the aggregates a host-component write can change. Call
    /// immediately before the store write.
    pub async fn save_hc(
        &self,
        sources: &StatusSources,
        host: i64,
        component: i64,
        link: ClusterService,
    ) -> Result<(), CoreError> {
        let (comp_agg, _) = sources.component_status(component).await?;
        let service_agg = sources.service_status(link.cluster, link.service).await?.status;
        let cluster_agg = sources.cluster_status(link.cluster).await?;

        let mut previous = self.previous.lock();
        let entry = previous.entry(hc_key(host, component)).or_default();
        entry.component = comp_agg;
        entry.service = service_agg;
        previous.entry(cluster_key(link.cluster)).or_default().cluster = cluster_agg;
        Ok(())
    }

    /// Recompute the aggregates after a host-component write (or eviction)
    /// and emit an event for each one that differs from the saved value.
    pub async fn check_hc(
        &self,
        sources: &StatusSources,
        host: i64,
        component: i64,
        link: ClusterService,
    ) -> Result<(), CoreError> {
        let (comp_agg, _) = sources.component_status(component).await?;
        let service_agg = sources.service_status(link.cluster, link.service).await?.status;
        let cluster_agg = sources.cluster_status(link.cluster).await?;

        let (component_changed, service_changed, cluster_changed) = {
            let mut previous = self.previous.lock();
            let entry = previous.entry(hc_key(host, component)).or_default();
            let component_changed = entry.component != comp_agg;
            let service_changed = entry.service != service_agg;
            entry.component = comp_agg;
            entry.service = service_agg;
            let cluster_entry = previous.entry(cluster_key(link.cluster)).or_default();
            let cluster_changed = cluster_entry.cluster != cluster_agg;
            cluster_entry.cluster = cluster_agg;
            (component_changed, service_changed, cluster_changed)
        };

        if component_changed {
            self.hub
                .publish(EventMessage::update(EventKind::Component, component, comp_agg))
                .await;
        }
        if service_changed {
            self.hub
                .publish(EventMessage::update(EventKind::Service, link.service, service_agg))
                .await;
        }
        if cluster_changed {
            self.hub
                .publish(EventMessage::update(EventKind::Cluster, link.cluster, cluster_agg))
                .await;
        }
        Ok(())
    }

    /// Snapshot the aggregates a host write can change.
    pub async fn save_host(
        &self,
        sources: &StatusSources,
        host: i64,
        cluster: i64,
    ) -> Result<(), CoreError> {
        let (raw, _) = sources.hosts.get(ALL_HOSTS, host).await?;
        let cluster_agg = sources.cluster_status(cluster).await?;

        let mut previous = self.previous.lock();
        previous.entry(host_key(host)).or_default().host = raw.status;
        previous.entry(cluster_key(cluster)).or_default().cluster = cluster_agg;
        Ok(())
    }

    /// Recompute after a host write (or eviction) and emit what changed.
    pub async fn check_host(
        &self,
        sources: &StatusSources,
        host: i64,
        cluster: i64,
    ) -> Result<(), CoreError> {
        let (raw, _) = sources.hosts.get(ALL_HOSTS, host).await?;
        let cluster_agg = sources.cluster_status(cluster).await?;

        let (host_changed, cluster_changed) = {
            let mut previous = self.previous.lock();
            let entry = previous.entry(host_key(host)).or_default();
            let host_changed = entry.host != raw.status;
            entry.host = raw.status;
            let cluster_entry = previous.entry(cluster_key(cluster)).or_default();
            let cluster_changed = cluster_entry.cluster != cluster_agg;
            cluster_entry.cluster = cluster_agg;
            (host_changed, cluster_changed)
        };

        if host_changed {
            self.hub
                .publish(EventMessage::update(EventKind::Host, host, raw.status))
                .await;
        }
        if cluster_changed {
            self.hub
                .publish(EventMessage::update(EventKind::Cluster, cluster, cluster_agg))
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::MaintenanceSet;
    use crate::status::Status;
    use crate::store::StatusStore;
    use crate::topology::{ServiceMaps, Topology};
    use std::sync::Arc;
    use std::time::Duration;

    async fn fixture() -> (StatusSources, StatusEvents, crate::hub::Subscription, EventHub) {
        let (host_components, _) = StatusStore::spawn("host-component", Duration::from_secs(300));
        let (hosts, _) = StatusStore::spawn("host", Duration::from_secs(60));
        let topology = Topology::spawn();
        let maps: ServiceMaps = serde_json::from_value(serde_json::json!({
            "host": {"1": [10, 20]},
            "service": {"1": [100]},
            "component": {"1": {"100": ["10.1000", "20.1000"]}},
            "hostservice": {
                "10.1000": {"cluster": 1, "service": 100},
                "20.1000": {"cluster": 1, "service": 100}
            }
        }))
        .unwrap();
        topology.init(maps).await.unwrap();
        let sources = StatusSources {
            host_components,
            hosts,
            topology,
            maintenance: Arc::new(MaintenanceSet::new()),
        };
        let hub = EventHub::spawn(32);
        let subscription = hub.subscribe().await.unwrap();
        (sources, StatusEvents::new(hub.clone()), subscription, hub)
    }

    const LINK: ClusterService = ClusterService {
        cluster: 1,
        service: 100,
    };

    const MARKER_ID: i64 = -1;

    /// Push a marker through the hub and drain up to it, so every earlier
    /// broadcast is known to have reached the subscriber queue.
    async fn drain(hub: &EventHub, sub: &mut crate::hub::Subscription) -> Vec<EventMessage> {
        hub.publish(EventMessage::update(EventKind::Host, MARKER_ID, 0)).await;
        let mut seen = Vec::new();
        loop {
            let message = sub.events.recv().await.unwrap();
            if message.object.id == MARKER_ID {
                return seen;
            }
            seen.push(message);
        }
    }

    async fn round_trip_hc(
        sources: &StatusSources,
        events: &StatusEvents,
        host: i64,
        status: i32,
    ) {
        events.save_hc(sources, host, 1000, LINK).await.unwrap();
        sources
            .host_components
            .set(host, 1000, Status::new(status))
            .await
            .unwrap();
        events.check_hc(sources, host, 1000, LINK).await.unwrap();
    }

    /// Bring both placements up and drain the resulting transitions.
    async fn all_up(
        sources: &StatusSources,
        events: &StatusEvents,
        hub: &EventHub,
        sub: &mut crate::hub::Subscription,
    ) {
        round_trip_hc(sources, events, 10, 0).await;
        round_trip_hc(sources, events, 20, 0).await;
        drain(hub, sub).await;
    }

    #[tokio::test]
    async fn changed_aggregates_emit_exactly_once() {
        let (sources, events, mut sub, hub) = fixture().await;
        all_up(&sources, &events, &hub, &mut sub).await;

        round_trip_hc(&sources, &events, 10, 4).await;
        let emitted = drain(&hub, &mut sub).await;
        let summary: Vec<(&str, i64, &str)> = emitted
            .iter()
            .map(|m| {
                (
                    m.event.as_str(),
                    m.object.id,
                    m.object.changes.status.as_str(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("update_component", 1000, "down"),
                ("update_service", 100, "down"),
                ("update_cluster", 1, "down"),
            ]
        );
    }

    #[tokio::test]
    async fn one_unreported_placement_keeps_aggregates_undefined() {
        let (sources, events, mut sub, hub) = fixture().await;

        // Host 20 never reported, so the roll-ups stay at undefined (16)
        // and the first degraded report changes nothing.
        round_trip_hc(&sources, &events, 10, 4).await;
        assert!(drain(&hub, &mut sub).await.is_empty());
    }

    #[tokio::test]
    async fn unchanged_aggregates_stay_silent() {
        let (sources, events, mut sub, hub) = fixture().await;
        all_up(&sources, &events, &hub, &mut sub).await;

        round_trip_hc(&sources, &events, 10, 4).await;
        drain(&hub, &mut sub).await;

        // A second degraded report with the same value leaves every
        // aggregate where it was.
        round_trip_hc(&sources, &events, 20, 4).await;
        assert!(drain(&hub, &mut sub).await.is_empty());

        // Re-reporting is silent too.
        round_trip_hc(&sources, &events, 10, 4).await;
        assert!(drain(&hub, &mut sub).await.is_empty());
    }

    #[tokio::test]
    async fn host_write_emits_host_transition() {
        let (sources, events, mut sub, hub) = fixture().await;

        events.save_host(&sources, 10, 1).await.unwrap();
        sources.hosts.set(ALL_HOSTS, 10, Status::new(2)).await.unwrap();
        events.check_host(&sources, 10, 1).await.unwrap();

        // The cluster aggregate stays at undefined (the service side still
        // reads 16), so only the host event fires.
        let emitted = drain(&hub, &mut sub).await;
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].event, "update_host");
        assert_eq!(emitted[0].object.id, 10);
        assert_eq!(emitted[0].object.changes.status, "down");
    }

    #[tokio::test]
    async fn recovery_emits_up_transition() {
        let (sources, events, mut sub, hub) = fixture().await;
        all_up(&sources, &events, &hub, &mut sub).await;
        round_trip_hc(&sources, &events, 10, 4).await;
        drain(&hub, &mut sub).await;

        round_trip_hc(&sources, &events, 10, 0).await;
        let emitted = drain(&hub, &mut sub).await;
        assert_eq!(emitted[0].event, "update_component");
        assert_eq!(emitted[0].object.changes.status, "up");
    }
}
