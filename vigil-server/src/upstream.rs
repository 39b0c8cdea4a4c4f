//! REST client for the management platform.
//!
//! The platform is consulted for three things: a service token for our own
//! calls, validation of user credentials (bearer tokens and session
//! cookies), and the topology snapshot pulled at bootstrap or on an
//! explicit reload. Every call carries a short timeout; the service treats
//! the platform as optional at runtime and degrades to "auth failed" /
//! "reload failed" when it is unreachable.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use vigil_core::topology::{ServiceMaps, Topology};

use crate::secrets::Secrets;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Client handle; cheap to share behind an `Arc`.
pub struct UpstreamApi {
    client: reqwest::Client,
    base: String,
    secrets: Arc<Secrets>,
    token: Mutex<Option<String>>,
}

impl UpstreamApi {
    pub fn new(base: &str, timeout: Duration, secrets: Arc<Secrets>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building upstream HTTP client")?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            secrets,
            token: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Our own service token, logging in on first use.
    async fn service_token(&self) -> Option<String> {
        let mut token = self.token.lock().await;
        if let Some(token) = token.as_ref() {
            return Some(token.clone());
        }
        let response = self
            .client
            .post(self.url("/api/v1/token/"))
            .json(&serde_json::json!({
                "username": self.secrets.adcmuser.user,
                "password": self.secrets.adcmuser.password,
            }))
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<TokenResponse>().await {
                    Ok(body) => {
                        *token = Some(body.token.clone());
                        Some(body.token)
                    }
                    Err(err) => {
                        warn!("platform token response unreadable: {err}");
                        None
                    }
                }
            }
            Ok(response) => {
                warn!("platform login failed: {}", response.status());
                None
            }
            Err(err) => {
                warn!("platform login failed: {err}");
                None
            }
        }
    }

    /// Whether a user bearer token is valid on the platform.
    pub async fn check_auth(&self, token: &str) -> bool {
        let response = self
            .client
            .get(self.url("/api/v1/rbac/me/"))
            .header("Authorization", format!("Token {token}"))
            .send()
            .await;
        match response {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!("user token check failed: {err}");
                false
            }
        }
    }

    /// Whether a session cookie is valid on the platform.
    pub async fn check_session(&self, session_id: &str) -> bool {
        let response = self
            .client
            .get(self.url("/api/v1/stack/"))
            .header("Cookie", format!("sessionid={session_id}"))
            .send()
            .await;
        match response {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!("session check failed: {err}");
                false
            }
        }
    }

    /// Pull the topology snapshot and install it into the registry.
    pub async fn load_service_map(&self, topology: &Topology) -> bool {
        let Some(token) = self.service_token().await else {
            return false;
        };
        let response = self
            .client
            .get(self.url("/api/v1/servicemap/"))
            .header("Authorization", format!("Token {token}"))
            .send()
            .await;
        let maps: ServiceMaps = match response {
            Ok(response) if response.status().is_success() => match response.json().await {
                Ok(maps) => maps,
                Err(err) => {
                    warn!("service map response unreadable: {err}");
                    return false;
                }
            },
            Ok(response) => {
                warn!("service map pull failed: {}", response.status());
                // The token may have expired; log in again next time.
                *self.token.lock().await = None;
                return false;
            }
            Err(err) => {
                warn!("service map pull failed: {err}");
                return false;
            }
        };
        if topology.init(maps).await.is_err() {
            return false;
        }
        info!("service map loaded from platform");
        true
    }
}

/// Keep pulling the topology until one attempt succeeds.
///
/// The cadence is flat; the task ends on the first successful load.
pub fn spawn_map_bootstrap(upstream: Arc<UpstreamApi>, topology: Topology, interval: Duration) {
    tokio::spawn(async move {
        loop {
            if upstream.load_service_map(&topology).await {
                break;
            }
            warn!("topology bootstrap failed, retrying in {}s", interval.as_secs());
            tokio::time::sleep(interval).await;
        }
    });
}
