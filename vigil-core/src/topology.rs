//! Serialized registry of the cluster / service / component / host graph.
//!
//! The snapshot is replaced wholesale by `init` (the management platform
//! pushes a fresh map on every change) and read through the same worker,
//! so a reader that observes one snapshot is guaranteed every earlier
//! `init` has fully taken effect.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::CoreError;

/// Where a host-component placement belongs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterService {
    pub cluster: i64,
    pub service: i64,
}

/// The topology snapshot as pushed by the management platform.
///
/// `"H.C"` strings key a host-component placement; that spelling is
/// wire-stable and used verbatim as the placement identifier. Integer-keyed
/// maps travel as JSON objects with stringified keys. `hostcluster` is
/// derived from `host` on init and included when the snapshot is read back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceMaps {
    /// cluster id → host ids
    #[serde(default)]
    pub host: HashMap<i64, Vec<i64>>,
    /// cluster id → service ids
    #[serde(default)]
    pub service: HashMap<i64, Vec<i64>>,
    /// cluster id → service id → placement keys
    #[serde(default)]
    pub component: HashMap<i64, HashMap<i64, Vec<String>>>,
    /// placement key → owning cluster and service
    #[serde(default)]
    pub hostservice: HashMap<String, ClusterService>,
    /// host id → cluster id, derived from `host`
    #[serde(default)]
    pub hostcluster: HashMap<i64, i64>,
}

impl ServiceMaps {
    fn rebuild_host_cluster(&mut self) {
        self.hostcluster.clear();
        for (cluster, hosts) in &self.host {
            for host in hosts {
                self.hostcluster.insert(*host, *cluster);
            }
        }
    }
}

/// Build the wire-stable placement key for a host-component pair.
#[must_use]
pub fn placement_key(host: i64, component: i64) -> String {
    format!("{host}.{component}")
}

/// Split a placement key back into its host and component ids.
#[must_use]
pub fn split_placement(key: &str) -> Option<(i64, i64)> {
    let (host, component) = key.split_once('.')?;
    Some((host.parse().ok()?, component.parse().ok()?))
}

enum Request {
    Init {
        maps: ServiceMaps,
        reply: oneshot::Sender<()>,
    },
    GetMap {
        reply: oneshot::Sender<ServiceMaps>,
    },
    GetHosts {
        cluster: i64,
        reply: oneshot::Sender<Vec<i64>>,
    },
    GetHostCluster {
        host: i64,
        reply: oneshot::Sender<Option<i64>>,
    },
    GetClusters {
        reply: oneshot::Sender<Vec<i64>>,
    },
    GetAllHosts {
        reply: oneshot::Sender<Vec<i64>>,
    },
    GetServices {
        cluster: i64,
        reply: oneshot::Sender<Vec<i64>>,
    },
    GetPlacements {
        cluster: i64,
        service: i64,
        reply: oneshot::Sender<Vec<String>>,
    },
    GetHostComponent {
        key: String,
        reply: oneshot::Sender<Option<ClusterService>>,
    },
    GetComponentHosts {
        component: i64,
        reply: oneshot::Sender<Vec<i64>>,
    },
}

/// Handle to the serialized topology worker.
#[derive(Clone)]
pub struct Topology {
    tx: mpsc::Sender<Request>,
}

const NAME: &str = "topology";

impl Topology {
    /// Spawn the registry worker with an empty snapshot.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut maps = ServiceMaps::default();
            while let Some(req) = rx.recv().await {
                handle(&mut maps, req);
            }
        });
        Self { tx }
    }

    /// Replace the snapshot and rederive the host → cluster index.
    pub async fn init(&self, maps: ServiceMaps) -> Result<(), CoreError> {
        self.call(|reply| Request::Init { maps, reply }).await
    }

    /// The full snapshot, including the derived `hostcluster` map.
    pub async fn get_map(&self) -> Result<ServiceMaps, CoreError> {
        self.call(|reply| Request::GetMap { reply }).await
    }

    pub async fn get_hosts(&self, cluster: i64) -> Result<Vec<i64>, CoreError> {
        self.call(|reply| Request::GetHosts { cluster, reply }).await
    }

    pub async fn get_host_cluster(&self, host: i64) -> Result<Option<i64>, CoreError> {
        self.call(|reply| Request::GetHostCluster { host, reply }).await
    }

    pub async fn get_clusters(&self) -> Result<Vec<i64>, CoreError> {
        self.call(|reply| Request::GetClusters { reply }).await
    }

    pub async fn get_all_hosts(&self) -> Result<Vec<i64>, CoreError> {
        self.call(|reply| Request::GetAllHosts { reply }).await
    }

    pub async fn get_services(&self, cluster: i64) -> Result<Vec<i64>, CoreError> {
        self.call(|reply| Request::GetServices { cluster, reply }).await
    }

    /// Placement keys of one service.
    pub async fn get_placements(&self, cluster: i64, service: i64) -> Result<Vec<String>, CoreError> {
        self.call(|reply| Request::GetPlacements {
            cluster,
            service,
            reply,
        })
        .await
    }

    /// Resolve a placement key to its owning cluster and service.
    pub async fn get_host_component(&self, key: &str) -> Result<Option<ClusterService>, CoreError> {
        let key = key.to_owned();
        self.call(|reply| Request::GetHostComponent { key, reply }).await
    }

    /// Hosts that carry the given component, in any cluster.
    ///
    /// Linear in the number of placements; only component-detail reads use it.
    pub async fn get_component_hosts(&self, component: i64) -> Result<Vec<i64>, CoreError> {
        self.call(|reply| Request::GetComponentHosts { component, reply })
            .await
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> Result<T, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CoreError::WorkerGone(NAME))?;
        rx.await.map_err(|_| CoreError::WorkerGone(NAME))
    }
}

fn handle(maps: &mut ServiceMaps, req: Request) {
    match req {
        Request::Init { maps: mut next, reply } => {
            next.rebuild_host_cluster();
            debug!(
                "topology replaced: {} clusters, {} placements",
                next.host.len(),
                next.hostservice.len()
            );
            *maps = next;
            let _ = reply.send(());
        }
        Request::GetMap { reply } => {
            let _ = reply.send(maps.clone());
        }
        Request::GetHosts { cluster, reply } => {
            let _ = reply.send(maps.host.get(&cluster).cloned().unwrap_or_default());
        }
        Request::GetHostCluster { host, reply } => {
            let _ = reply.send(maps.hostcluster.get(&host).copied());
        }
        Request::GetClusters { reply } => {
            let _ = reply.send(maps.host.keys().copied().collect());
        }
        Request::GetAllHosts { reply } => {
            let _ = reply.send(maps.hostcluster.keys().copied().collect());
        }
        Request::GetServices { cluster, reply } => {
            let _ = reply.send(maps.service.get(&cluster).cloned().unwrap_or_default());
        }
        Request::GetPlacements {
            cluster,
            service,
            reply,
        } => {
            let placements = maps
                .component
                .get(&cluster)
                .and_then(|services| services.get(&service))
                .cloned()
                .unwrap_or_default();
            let _ = reply.send(placements);
        }
        Request::GetHostComponent { key, reply } => {
            let _ = reply.send(maps.hostservice.get(&key).copied());
        }
        Request::GetComponentHosts { component, reply } => {
            let mut hosts: Vec<i64> = maps
                .hostservice
                .keys()
                .filter_map(|key| split_placement(key))
                .filter(|(_, comp)| *comp == component)
                .map(|(host, _)| host)
                .collect();
            hosts.sort_unstable();
            let _ = reply.send(hosts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ServiceMaps {
        serde_json::from_value(serde_json::json!({
            "host": {"1": [10, 20]},
            "service": {"1": [100]},
            "component": {"1": {"100": ["10.1000", "20.1000"]}},
            "hostservice": {
                "10.1000": {"cluster": 1, "service": 100},
                "20.1000": {"cluster": 1, "service": 100}
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn init_derives_host_cluster() {
        let topology = Topology::spawn();
        topology.init(sample()).await.unwrap();

        assert_eq!(topology.get_host_cluster(10).await.unwrap(), Some(1));
        assert_eq!(topology.get_host_cluster(20).await.unwrap(), Some(1));
        assert_eq!(topology.get_host_cluster(999).await.unwrap(), None);

        let map = topology.get_map().await.unwrap();
        assert_eq!(map.hostcluster.len(), 2);
    }

    #[tokio::test]
    async fn lookups_follow_the_snapshot() {
        let topology = Topology::spawn();
        topology.init(sample()).await.unwrap();

        let mut hosts = topology.get_hosts(1).await.unwrap();
        hosts.sort_unstable();
        assert_eq!(hosts, vec![10, 20]);
        assert_eq!(topology.get_services(1).await.unwrap(), vec![100]);
        assert_eq!(
            topology.get_placements(1, 100).await.unwrap(),
            vec!["10.1000".to_string(), "20.1000".to_string()]
        );
        assert_eq!(
            topology.get_host_component("10.1000").await.unwrap(),
            Some(ClusterService {
                cluster: 1,
                service: 100
            })
        );
        assert_eq!(topology.get_host_component("10.9").await.unwrap(), None);
    }

    #[tokio::test]
    async fn component_hosts_scans_placements() {
        let topology = Topology::spawn();
        topology.init(sample()).await.unwrap();

        assert_eq!(topology.get_component_hosts(1000).await.unwrap(), vec![10, 20]);
        assert!(topology.get_component_hosts(2000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reinit_replaces_wholesale() {
        let topology = Topology::spawn();
        topology.init(sample()).await.unwrap();

        let mut next = ServiceMaps::default();
        next.host.insert(2, vec![30]);
        topology.init(next).await.unwrap();

        assert_eq!(topology.get_host_cluster(10).await.unwrap(), None);
        assert_eq!(topology.get_host_cluster(30).await.unwrap(), Some(2));
        assert!(topology.get_placements(1, 100).await.unwrap().is_empty());
    }

    #[test]
    fn placement_key_round_trip() {
        assert_eq!(split_placement(&placement_key(10, 1000)), Some((10, 1000)));
        assert_eq!(split_placement("garbage"), None);
        assert_eq!(split_placement("1.x"), None);
    }

    #[test]
    fn integer_map_keys_travel_as_strings() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json["host"].get("1").is_some());
        let back: ServiceMaps = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample());
    }
}
