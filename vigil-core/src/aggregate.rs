//! Roll-up of raw host-component and host reports into service, component
//! and cluster statuses.
//!
//! Aggregation is stateless: every call reads fresh snapshots from the
//! topology registry, the maintenance set and the stores. Where several
//! members report nonzero the last one encountered wins; the contract is
//! only that *some* nonzero value surfaces whenever any input is nonzero,
//! so no ordering is imposed on the underlying collections.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::CoreError;
use crate::maintenance::MaintenanceSet;
use crate::status::{ALL_HOSTS, STATUS_EMPTY, STATUS_OK, Status};
use crate::store::StatusStore;
use crate::topology::{Topology, split_placement};

/// One host-component row in a service detail listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCompStatus {
    pub host: i64,
    pub component: i64,
    pub status: i32,
}

/// A service's rolled-up status with its per-placement details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub status: i32,
    pub details: Vec<HostCompStatus>,
}

/// The read side of the world: every input aggregation consults.
#[derive(Clone)]
pub struct StatusSources {
    /// (host, component) → last reported status.
    pub host_components: StatusStore,
    /// (`ALL_HOSTS`, host) → last reported overall host status.
    pub hosts: StatusStore,
    pub topology: Topology,
    pub maintenance: Arc<MaintenanceSet>,
}

impl StatusSources {
    /// Status of one service: its placements' reports, maintenance objects
    /// excluded, missing reports read as undefined.
    pub async fn service_status(
        &self,
        cluster: i64,
        service: i64,
    ) -> Result<ServiceStatus, CoreError> {
        let masked = self.maintenance.snapshot();
        let placements = self.topology.get_placements(cluster, service).await?;
        let mut out = ServiceStatus {
            status: STATUS_OK,
            details: Vec::with_capacity(placements.len()),
        };
        for key in &placements {
            let Some((host, component)) = split_placement(key) else {
                continue;
            };
            if masked.hosts.contains(&host) || masked.components.contains(&component) {
                continue;
            }
            let (val, _) = self.host_components.get(host, component).await?;
            out.details.push(HostCompStatus {
                host,
                component,
                status: val.status,
            });
            if val.status != STATUS_OK {
                out.status = val.status;
            }
        }
        Ok(out)
    }

    /// Standalone status of one component across every host carrying it.
    ///
    /// No carrying hosts reads as empty; a component under maintenance
    /// reads as up with no details (the empty check wins when both apply).
    pub async fn component_status(
        &self,
        component: i64,
    ) -> Result<(i32, HashMap<i64, Status>), CoreError> {
        let hosts = self.topology.get_component_hosts(component).await?;
        if hosts.is_empty() {
            return Ok((STATUS_EMPTY, HashMap::new()));
        }
        let masked = self.maintenance.snapshot();
        if masked.components.contains(&component) {
            return Ok((STATUS_OK, HashMap::new()));
        }
        let mut agg = STATUS_OK;
        let mut out = HashMap::new();
        for host in hosts {
            if masked.hosts.contains(&host) {
                continue;
            }
            let (val, _) = self.host_components.get(host, component).await?;
            out.insert(host, val);
            if val.status != STATUS_OK {
                agg = val.status;
            }
        }
        Ok((agg, out))
    }

    /// Host-side status of a cluster: each member host's overall report.
    pub async fn cluster_host_status(
        &self,
        cluster: i64,
    ) -> Result<(i32, HashMap<i64, Status>), CoreError> {
        let hosts = self.topology.get_hosts(cluster).await?;
        if hosts.is_empty() {
            return Ok((STATUS_EMPTY, HashMap::new()));
        }
        let masked = self.maintenance.snapshot();
        let mut agg = STATUS_OK;
        let mut out = HashMap::new();
        for host in hosts {
            if masked.hosts.contains(&host) {
                continue;
            }
            let (val, _) = self.hosts.get(ALL_HOSTS, host).await?;
            out.insert(host, val);
            if val.status != STATUS_OK {
                agg = val.status;
            }
        }
        Ok((agg, out))
    }

    /// Service-side status of a cluster: every member service rolled up,
    /// services under maintenance excluded.
    pub async fn cluster_service_status(
        &self,
        cluster: i64,
    ) -> Result<(i32, HashMap<i64, ServiceStatus>), CoreError> {
        let services = self.topology.get_services(cluster).await?;
        if services.is_empty() {
            return Ok((STATUS_EMPTY, HashMap::new()));
        }
        let masked = self.maintenance.snapshot();
        let mut agg = STATUS_OK;
        let mut out = HashMap::new();
        for service in services {
            if masked.services.contains(&service) {
                continue;
            }
            let status = self.service_status(cluster, service).await?;
            if status.status != STATUS_OK {
                agg = status.status;
            }
            out.insert(service, status);
        }
        Ok((agg, out))
    }

    /// The cluster roll-up of both sides.
    pub async fn cluster_status(&self, cluster: i64) -> Result<i32, CoreError> {
        let (services, _) = self.cluster_service_status(cluster).await?;
        let (hosts, _) = self.cluster_host_status(cluster).await?;
        Ok(cook_cluster_status(services, hosts))
    }
}

/// Compose the two sides of a cluster status. Service-side problems
/// dominate host-side ones.
#[must_use]
pub const fn cook_cluster_status(services: i32, hosts: i32) -> i32 {
    if services != STATUS_OK {
        services
    } else if hosts != STATUS_OK {
        hosts
    } else {
        STATUS_OK
    }
}
