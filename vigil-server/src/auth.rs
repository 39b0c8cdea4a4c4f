//! Request authentication.
//!
//! Three caller kinds exist: the platform itself (`internal`, a shared
//! service token), status checkers (`checker`, a shared probe token), and
//! human users (`user`, a platform-issued bearer token or a session
//! cookie). Routes declare which kinds they accept; the check runs at the
//! top of each handler since several paths accept different kinds per
//! method.
//!
//! Validated user tokens are cached per token for a fixed TTL. There is no
//! global reset: a token revoked on the platform stays trusted here until
//! its cache entry expires.

use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE, SEC_WEBSOCKET_PROTOCOL};
use dashmap::DashMap;

use crate::error::ApiError;
use crate::state::ApiState;

/// Who a route admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Platform service calls only.
    Internal,
    /// Status checkers or the platform.
    Checker,
    /// Users or the platform.
    Viewer,
    /// Checkers, the platform, or users.
    StatusReader,
}

/// Per-token cache of upstream validation results.
pub struct TokenCache {
    entries: DashMap<String, Instant>,
    ttl: Duration,
}

impl TokenCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn contains(&self, token: &str) -> bool {
        match self.entries.get(token) {
            Some(expiry) => *expiry > Instant::now(),
            None => false,
        }
    }

    fn store(&self, token: &str) {
        self.entries
            .insert(token.to_string(), Instant::now() + self.ttl);
    }
}

/// The bearer token out of `Authorization: Token <value>`.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Token ").map(str::trim)
}

/// The session id out of the cookie header, if any.
fn session_id(headers: &HeaderMap) -> Option<&str> {
    let cookies = headers.get(COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|cookie| {
        let (name, value) = cookie.trim().split_once('=')?;
        (name == "sessionid").then_some(value)
    })
}

/// The token smuggled through the WebSocket subprotocol list, spelled
/// `adcm, <token>`.
fn subprotocol_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;
    let mut parts = value.splitn(2, ',');
    (parts.next()?.trim() == "adcm").then(|| parts.next().map(str::trim))?
}

async fn user_token_valid(state: &ApiState, token: &str) -> bool {
    if state.tokens.contains(token) {
        return true;
    }
    if state.upstream.check_auth(token).await {
        state.tokens.store(token);
        return true;
    }
    false
}

async fn session_valid(state: &ApiState, headers: &HeaderMap) -> bool {
    match session_id(headers) {
        Some(id) => state.upstream.check_session(id).await,
        None => false,
    }
}

/// Check a request against the route's admitted caller kinds.
pub async fn check(state: &ApiState, headers: &HeaderMap, access: Access) -> Result<(), ApiError> {
    let token = bearer_token(headers);

    if let Some(token) = token {
        if token == state.secrets.adcm_internal_token {
            return Ok(());
        }
        match access {
            Access::Checker | Access::StatusReader if token == state.secrets.token => {
                return Ok(());
            }
            _ => {}
        }
        match access {
            Access::Viewer | Access::StatusReader if user_token_valid(state, token).await => {
                return Ok(());
            }
            _ => {}
        }
    }

    let session_allowed = matches!(access, Access::Viewer | Access::StatusReader);
    if session_allowed && session_valid(state, headers).await {
        return Ok(());
    }

    Err(ApiError::Auth("authentication failed".to_string()))
}

/// Check a WebSocket upgrade request: users only, with the token taken
/// from the authorization header or the subprotocol list, or a session
/// cookie.
pub async fn check_push(state: &ApiState, headers: &HeaderMap) -> Result<(), ApiError> {
    let token = bearer_token(headers).or_else(|| subprotocol_token(headers));
    if let Some(token) = token {
        if token == state.secrets.adcm_internal_token
            || user_token_valid(state, token).await
        {
            return Ok(());
        }
    }
    if session_valid(state, headers).await {
        return Ok(());
    }
    Err(ApiError::Auth("authentication failed".to_string()))
}
