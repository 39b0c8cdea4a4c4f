//! The HTTP surface: path routing and JSON marshalling over the engine.
//!
//! Handlers are thin: authenticate, parse, call into the stores and the
//! aggregation reads, marshal. Status writes run the save → write → check
//! round-trip so subscribers hear about every aggregate that actually
//! moved.

use std::collections::HashMap;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::header::{ALLOW, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{any, get, post};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, warn};

use vigil_core::aggregate::ServiceStatus;
use vigil_core::events::EventMessage;
use vigil_core::maintenance::MaintenanceObjects;
use vigil_core::status::{ALL_HOSTS, Status};
use vigil_core::store::SetCode;
use vigil_core::topology::{ServiceMaps, placement_key};

use crate::auth::{self, Access};
use crate::error::ApiError;
use crate::state::ApiState;
use crate::ws;

/// POST and PUT bodies are capped at 10 MiB.
pub const MAX_POST_SIZE: usize = 10 * 1024 * 1024;

/// Assemble the full route table.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/v1/", get(api_root))
        .route("/api/v1/all/", get(show_all))
        .route("/api/v1/cluster/", get(cluster_list))
        .route("/api/v1/cluster/{cluster_id}/", get(show_cluster))
        .route(
            "/api/v1/cluster/{cluster_id}/service/{service_id}/",
            get(show_service),
        )
        .route(
            "/api/v1/cluster/{cluster_id}/service/{service_id}/component/{component_id}/",
            get(show_service_component),
        )
        .route("/api/v1/component/{component_id}/", get(show_component))
        .route("/api/v1/host/", get(host_list))
        .route("/api/v1/host/{host_id}/", get(show_host).post(set_host))
        .route(
            "/api/v1/host/{host_id}/component/{component_id}/",
            get(show_host_component).post(set_host_component),
        )
        .route(
            "/api/v1/servicemap/",
            get(show_service_map).post(post_service_map),
        )
        .route("/api/v1/servicemap/reload/", post(reload_service_map))
        .route(
            "/api/v1/object/mm/",
            get(show_maintenance).post(post_maintenance),
        )
        .route("/api/v1/event/", post(post_event))
        .route("/api/v1/log/", get(show_log_level).post(post_log_level))
        .route("/ws/event/", any(ws::event_push))
        .fallback(page_not_found)
        .layer(DefaultBodyLimit::max(MAX_POST_SIZE))
        .layer(middleware::from_fn(access_log))
        .with_state(state)
}

async fn access_log(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let response = next.run(request).await;
    info!("{method} {path} {}", response.status().as_u16());
    response
}

// Marshalling helpers

fn json_response<T: serde::Serialize>(allow: &'static str, value: &T) -> Response {
    let mut response = axum::Json(value).into_response();
    response
        .headers_mut()
        .insert(ALLOW, HeaderValue::from_static(allow));
    response
}

/// An empty JSON-typed body with the store's outcome as the HTTP code:
/// 200 for an overwritten slot, 201 for a fresh one.
fn set_code_response(allow: &'static str, code: SetCode) -> Response {
    let status = match code {
        SetCode::Updated => StatusCode::OK,
        SetCode::Created => StatusCode::CREATED,
    };
    (
        status,
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/json")),
            (ALLOW, HeaderValue::from_static(allow)),
        ],
    )
        .into_response()
}

fn empty_response(allow: &'static str) -> Response {
    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, HeaderValue::from_static("application/json")),
            (ALLOW, HeaderValue::from_static(allow)),
        ],
    )
        .into_response()
}

/// Strict decode: unknown fields are rejected, the whole body must parse.
fn decode_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|err| {
        warn!("POST body rejected: {err}");
        ApiError::Json(err.to_string())
    })
}

fn parse_id(name: &str, value: &str) -> Result<i64, ApiError> {
    value.parse().map_err(|_| {
        ApiError::WrongInputType(format!(
            "'{name}' path parameter should be integer, not '{value}'"
        ))
    })
}

fn host_of(headers: &HeaderMap) -> &str {
    headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost")
}

#[derive(Debug, Deserialize)]
struct ViewQuery {
    view: Option<String>,
}

impl ViewQuery {
    fn is_ui(&self) -> bool {
        self.view.as_deref() == Some("interface")
    }
}

// Handlers

async fn index() -> Html<&'static str> {
    Html("<a href=\"api/v1/\">Status Server API</a>\n")
}

async fn api_root(headers: HeaderMap) -> Response {
    let base = format!("http://{}/api/v1/", host_of(&headers));
    json_response(
        "GET",
        &json!({
            "event": format!("{base}event/"),
            "log": format!("{base}log/"),
            "cluster": format!("{base}cluster/"),
            "host": format!("{base}host/"),
            "servicemap": format!("{base}servicemap/"),
        }),
    )
}

async fn page_not_found() -> ApiError {
    ApiError::PageNotFound("page not found".to_string())
}

#[derive(serde::Serialize)]
struct ClusterDetails {
    status: i32,
    services: HashMap<i64, ServiceStatus>,
    hosts: HashMap<i64, Status>,
}

async fn cluster_details(state: &ApiState, cluster: i64) -> Result<ClusterDetails, ApiError> {
    let (service_agg, services) = state.sources.cluster_service_status(cluster).await?;
    let (host_agg, hosts) = state.sources.cluster_host_status(cluster).await?;
    Ok(ClusterDetails {
        status: vigil_core::aggregate::cook_cluster_status(service_agg, host_agg),
        services,
        hosts,
    })
}

async fn show_all(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Viewer).await?;
    let mut clusters = HashMap::new();
    for cluster in state.sources.topology.get_clusters().await? {
        clusters.insert(cluster, cluster_details(&state, cluster).await?);
    }
    let mut hosts = HashMap::new();
    for host in state.sources.topology.get_all_hosts().await? {
        let (value, _) = state.sources.hosts.get(ALL_HOSTS, host).await?;
        hosts.insert(host, value);
    }
    Ok(json_response(
        "GET",
        &json!({"clusters": clusters, "hosts": hosts}),
    ))
}

async fn cluster_list(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Viewer).await?;
    let base = format!("http://{}/api/v1/cluster/", host_of(&headers));
    let clusters: Vec<_> = state
        .sources
        .topology
        .get_clusters()
        .await?
        .into_iter()
        .map(|id| json!({"url": format!("{base}{id}/")}))
        .collect();
    Ok(json_response("GET", &clusters))
}

async fn host_list(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Viewer).await?;
    let base = format!("http://{}/api/v1/host/", host_of(&headers));
    let hosts: Vec<_> = state
        .sources
        .topology
        .get_all_hosts()
        .await?
        .into_iter()
        .map(|id| json!({"url": format!("{base}{id}/")}))
        .collect();
    Ok(json_response("GET", &hosts))
}

async fn show_cluster(
    State(state): State<ApiState>,
    Path(cluster_id): Path<String>,
    Query(view): Query<ViewQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Viewer).await?;
    let cluster = parse_id("clusterid", &cluster_id)?;
    let details = cluster_details(&state, cluster).await?;
    if view.is_ui() {
        Ok(json_response("GET", &details))
    } else {
        Ok(json_response("GET", &json!({"status": details.status})))
    }
}

async fn show_service(
    State(state): State<ApiState>,
    Path((cluster_id, service_id)): Path<(String, String)>,
    Query(view): Query<ViewQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Viewer).await?;
    let cluster = parse_id("clusterid", &cluster_id)?;
    let service = parse_id("serviceid", &service_id)?;
    let status = state.sources.service_status(cluster, service).await?;
    if view.is_ui() {
        Ok(json_response(
            "GET",
            &json!({"components": status.details, "status": status.status}),
        ))
    } else {
        Ok(json_response("GET", &status))
    }
}

async fn component_response(
    state: &ApiState,
    component: i64,
    view: &ViewQuery,
) -> Result<Response, ApiError> {
    let (status, hosts) = state.sources.component_status(component).await?;
    if view.is_ui() {
        Ok(json_response(
            "GET",
            &json!({"status": status, "hosts": hosts}),
        ))
    } else {
        Ok(json_response("GET", &json!({"status": status})))
    }
}

async fn show_component(
    State(state): State<ApiState>,
    Path(component_id): Path<String>,
    Query(view): Query<ViewQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Viewer).await?;
    let component = parse_id("compid", &component_id)?;
    component_response(&state, component, &view).await
}

async fn show_service_component(
    State(state): State<ApiState>,
    Path((cluster_id, service_id, component_id)): Path<(String, String, String)>,
    Query(view): Query<ViewQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Viewer).await?;
    parse_id("clusterid", &cluster_id)?;
    parse_id("serviceid", &service_id)?;
    let component = parse_id("compid", &component_id)?;
    component_response(&state, component, &view).await
}

async fn show_host(
    State(state): State<ApiState>,
    Path(host_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::StatusReader).await?;
    let host = parse_id("hostid", &host_id)?;
    if state.sources.topology.get_host_cluster(host).await?.is_none() {
        return Err(ApiError::HostNotFound("unknown host".to_string()));
    }
    let (value, _) = state.sources.hosts.get(ALL_HOSTS, host).await?;
    Ok(json_response("GET, POST", &value))
}

async fn set_host(
    State(state): State<ApiState>,
    Path(host_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Checker).await?;
    let host = parse_id("hostid", &host_id)?;
    let value: Status = decode_body(&body)?;
    let Some(cluster) = state.sources.topology.get_host_cluster(host).await? else {
        return Err(ApiError::HostNotFound("unknown host".to_string()));
    };
    state.events.save_host(&state.sources, host, cluster).await?;
    let code = state.sources.hosts.set(ALL_HOSTS, host, value).await?;
    state.events.check_host(&state.sources, host, cluster).await?;
    Ok(set_code_response("GET, POST", code))
}

async fn show_host_component(
    State(state): State<ApiState>,
    Path((host_id, component_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::StatusReader).await?;
    let host = parse_id("hostid", &host_id)?;
    let component = parse_id("compid", &component_id)?;
    let (value, _) = state.sources.host_components.get(host, component).await?;
    Ok(json_response("GET, POST", &value))
}

async fn set_host_component(
    State(state): State<ApiState>,
    Path((host_id, component_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Checker).await?;
    let host = parse_id("hostid", &host_id)?;
    let component = parse_id("compid", &component_id)?;
    let value: Status = decode_body(&body)?;
    let key = placement_key(host, component);
    let Some(link) = state.sources.topology.get_host_component(&key).await? else {
        return Err(ApiError::HcNotFound(format!(
            "Component #{component} is not present on host #{host}"
        )));
    };
    state
        .events
        .save_hc(&state.sources, host, component, link)
        .await?;
    let code = state.sources.host_components.set(host, component, value).await?;
    state
        .events
        .check_hc(&state.sources, host, component, link)
        .await?;
    Ok(set_code_response("GET, POST", code))
}

async fn show_service_map(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Internal).await?;
    let maps = state.sources.topology.get_map().await?;
    Ok(json_response("GET, POST", &maps))
}

async fn post_service_map(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Internal).await?;
    let maps: ServiceMaps = decode_body(&body)?;
    debug!("service map replaced: {maps:?}");
    if maps.hostservice.is_empty() {
        warn!("INPUT_WARNING no hostservice in servicemap post");
    }
    if maps.component.is_empty() {
        warn!("INPUT_WARNING no component in servicemap post");
    }
    state.sources.topology.init(maps).await?;
    Ok(empty_response("GET, POST"))
}

async fn reload_service_map(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Internal).await?;
    let ok = state
        .upstream
        .load_service_map(&state.sources.topology)
        .await;
    Ok(json_response("POST", &json!({"ok": ok})))
}

async fn show_maintenance(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Internal).await?;
    Ok(json_response(
        "GET, POST",
        &state.sources.maintenance.snapshot(),
    ))
}

async fn post_maintenance(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Internal).await?;
    let objects: MaintenanceObjects = decode_body(&body)?;
    state.sources.maintenance.replace(objects);
    Ok(empty_response("GET, POST"))
}

async fn post_event(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Internal).await?;
    let event: EventMessage = decode_body(&body)?;
    debug!("injected event: {event:?}");
    if event.event.is_empty() {
        return Err(ApiError::FieldRequired(
            "field \"event\" is required".to_string(),
        ));
    }
    if event.object.id == 0 {
        return Err(ApiError::FieldRequired(
            "field \"object.id\" is required".to_string(),
        ));
    }
    state.hub.publish(event).await;
    Ok(empty_response("POST"))
}

async fn show_log_level(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Internal).await?;
    Ok(json_response("GET, POST", &json!({"level": state.log.current()})))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogLevelBody {
    #[serde(default)]
    level: String,
}

async fn post_log_level(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    auth::check(&state, &headers, Access::Internal).await?;
    let body: LogLevelBody = decode_body(&body)?;
    if !state.log.set(&body.level) {
        return Err(ApiError::Log(format!("unknown log level '{}'", body.level)));
    }
    Ok(empty_response("GET, POST"))
}
