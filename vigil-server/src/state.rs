//! Shared application state: the engine components plus edge concerns.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::warn;

use vigil_core::aggregate::StatusSources;
use vigil_core::events::StatusEvents;
use vigil_core::hub::EventHub;
use vigil_core::maintenance::MaintenanceSet;
use vigil_core::store::{Evicted, StatusStore};
use vigil_core::topology::{Topology, placement_key};

use crate::auth::TokenCache;
use crate::config::{PushSection, ServerConfig};
use crate::log::LogControl;
use crate::secrets::Secrets;
use crate::upstream::UpstreamApi;

/// Everything the handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct ApiState {
    pub sources: StatusSources,
    pub events: Arc<StatusEvents>,
    pub hub: EventHub,
    pub upstream: Arc<UpstreamApi>,
    pub secrets: Arc<Secrets>,
    pub tokens: Arc<TokenCache>,
    pub log: Arc<LogControl>,
    pub push: PushSection,
}

impl ApiState {
    /// Wire up the engine and edge components and start the background
    /// listeners that turn TTL evictions into differential checks.
    pub fn build(config: &ServerConfig, secrets: Secrets, log: Arc<LogControl>) -> Result<Self> {
        let (host_components, hc_evictions) =
            StatusStore::spawn("host-component", config.storage.component_ttl());
        let (hosts, host_evictions) = StatusStore::spawn("host", config.storage.host_ttl());
        let topology = Topology::spawn();
        let sources = StatusSources {
            host_components,
            hosts,
            topology,
            maintenance: Arc::new(MaintenanceSet::new()),
        };

        let hub = EventHub::spawn(config.push.queue_capacity);
        let events = Arc::new(StatusEvents::new(hub.clone()));
        let secrets = Arc::new(secrets);
        let upstream = Arc::new(UpstreamApi::new(
            &config.upstream.url,
            config.upstream.timeout(),
            Arc::clone(&secrets),
        )?);
        let tokens = Arc::new(TokenCache::new(config.upstream.token_cache_ttl()));

        let state = Self {
            sources,
            events,
            hub,
            upstream,
            secrets,
            tokens,
            log,
            push: config.push.clone(),
        };
        state.spawn_eviction_listeners(hc_evictions, host_evictions);
        Ok(state)
    }

    /// An expiring report must notify subscribers the same way an explicit
    /// one does, so each store's eviction stream feeds the differential
    /// check for the slot that went away.
    fn spawn_eviction_listeners(
        &self,
        mut hc_evictions: mpsc::UnboundedReceiver<Evicted>,
        mut host_evictions: mpsc::UnboundedReceiver<Evicted>,
    ) {
        let sources = self.sources.clone();
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            while let Some(evicted) = hc_evictions.recv().await {
                let key = placement_key(evicted.outer, evicted.inner);
                match sources.topology.get_host_component(&key).await {
                    Ok(Some(link)) => {
                        if let Err(err) = events
                            .check_hc(&sources, evicted.outer, evicted.inner, link)
                            .await
                        {
                            warn!("post-eviction check for {key} failed: {err}");
                        }
                    }
                    // The placement left the topology while the report aged out.
                    Ok(None) => {}
                    Err(_) => break,
                }
            }
        });

        let sources = self.sources.clone();
        let events = Arc::clone(&self.events);
        tokio::spawn(async move {
            while let Some(evicted) = host_evictions.recv().await {
                let host = evicted.inner;
                match sources.topology.get_host_cluster(host).await {
                    Ok(Some(cluster)) => {
                        if let Err(err) = events.check_host(&sources, host, cluster).await {
                            warn!("post-eviction check for host {host} failed: {err}");
                        }
                    }
                    Ok(None) => {}
                    Err(_) => break,
                }
            }
        });
    }
}
