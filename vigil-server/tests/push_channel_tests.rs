//! Tests for the push channel: upgrade auth, origin checking, and event
//! delivery over a live socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use vigil_server::api::build_router;
use vigil_server::config::ServerConfig;
use vigil_server::log::LogControl;
use vigil_server::secrets::{PlatformUser, Secrets};
use vigil_server::state::ApiState;

const INTERNAL: &str = "Token internal-secret";
const CHECKER: &str = "Token checker-secret";

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn test_secrets() -> Secrets {
    Secrets {
        adcmuser: PlatformUser {
            user: "status".to_string(),
            password: "pw".to_string(),
        },
        token: "checker-secret".to_string(),
        adcm_internal_token: "internal-secret".to_string(),
    }
}

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A stand-in platform that accepts any user token or session.
async fn serve_upstream_stub() -> SocketAddr {
    let router = Router::new()
        .route("/api/v1/rbac/me/", get(|| async { "{}" }))
        .route("/api/v1/stack/", get(|| async { "{}" }));
    serve(router).await
}

async fn start_service(configure: impl FnOnce(&mut ServerConfig)) -> SocketAddr {
    let upstream = serve_upstream_stub().await;
    let mut config = ServerConfig::default();
    config.upstream.url = format!("http://{upstream}");
    configure(&mut config);
    let state = ApiState::build(
        &config,
        test_secrets(),
        Arc::new(LogControl::detached("ERROR")),
    )
    .unwrap();
    serve(build_router(state)).await
}

async fn install_map(client: &reqwest::Client, addr: SocketAddr) {
    let response = client
        .post(format!("http://{addr}/api/v1/servicemap/"))
        .header("Authorization", INTERNAL)
        .json(&json!({
            "host": {"1": [10, 20]},
            "service": {"1": [100]},
            "component": {"1": {"100": ["10.1000", "20.1000"]}},
            "hostservice": {
                "10.1000": {"cluster": 1, "service": 100},
                "20.1000": {"cluster": 1, "service": 100}
            }
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}

async fn post_status(client: &reqwest::Client, addr: SocketAddr, path: &str, status: i32) {
    let response = client
        .post(format!("http://{addr}{path}"))
        .header("Authorization", CHECKER)
        .json(&json!({"status": status}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}

async fn inject_event(client: &reqwest::Client, addr: SocketAddr, id: i64) {
    let response = client
        .post(format!("http://{addr}/api/v1/event/"))
        .header("Authorization", INTERNAL)
        .json(&json!({
            "event": "sync",
            "object": {"id": id, "changes": {"status": "up"}}
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
}

async fn next_event(socket: &mut WsClient) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame within deadline")
            .expect("socket open")
            .expect("clean frame");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Registration happens just after the handshake response, so probe with
/// marker events until one comes back, then drain up to a final barrier.
async fn sync_subscription(client: &reqwest::Client, addr: SocketAddr, socket: &mut WsClient) {
    let mut marker = 1_000_000;
    loop {
        marker += 1;
        inject_event(client, addr, marker).await;
        match timeout(Duration::from_millis(100), socket.next()).await {
            Ok(Some(Ok(Message::Text(_)))) => break,
            _ => {}
        }
    }
    let barrier = 2_000_000;
    inject_event(client, addr, barrier).await;
    loop {
        let event = next_event(socket).await;
        if event["object"]["id"] == barrier {
            return;
        }
    }
}

#[tokio::test]
async fn authenticated_subscriber_receives_differential_events() {
    let addr = start_service(|_| {}).await;
    let client = reqwest::Client::new();
    install_map(&client, addr).await;

    let mut request = format!("ws://{addr}/ws/event/")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Token a-user-token".parse().unwrap());
    let (mut socket, _) = connect_async(request).await.unwrap();
    sync_subscription(&client, addr, &mut socket).await;

    post_status(&client, addr, "/api/v1/host/10/component/1000/", 0).await;
    post_status(&client, addr, "/api/v1/host/20/component/1000/", 0).await;

    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "update_component");
    assert_eq!(event["object"]["id"], 1000);
    assert_eq!(event["object"]["changes"]["status"], "up");

    let event = next_event(&mut socket).await;
    assert_eq!(event["event"], "update_service");
    assert_eq!(event["object"]["id"], 100);
}

#[tokio::test]
async fn token_can_ride_the_subprotocol_header() {
    let addr = start_service(|_| {}).await;

    let mut request = format!("ws://{addr}/ws/event/")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", "adcm, a-user-token".parse().unwrap());
    let (_socket, response) = connect_async(request).await.unwrap();
    assert_eq!(
        response.headers().get("Sec-WebSocket-Protocol").unwrap(),
        "adcm"
    );
}

#[tokio::test]
async fn session_cookie_authenticates_the_upgrade() {
    let addr = start_service(|_| {}).await;

    let mut request = format!("ws://{addr}/ws/event/")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Cookie", "sessionid=some-session".parse().unwrap());
    assert!(connect_async(request).await.is_ok());
}

#[tokio::test]
async fn unauthenticated_upgrade_is_refused() {
    let addr = start_service(|_| {}).await;

    let request = format!("ws://{addr}/ws/event/")
        .into_client_request()
        .unwrap();
    match connect_async(request).await {
        Err(Error::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("expected an HTTP 401 refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn cross_origin_upgrade_is_refused() {
    let addr = start_service(|_| {}).await;

    let mut request = format!("ws://{addr}/ws/event/")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Token a-user-token".parse().unwrap());
    request
        .headers_mut()
        .insert("Origin", "http://evil.example.net".parse().unwrap());
    match connect_async(request).await {
        Err(Error::Http(response)) => assert_eq!(response.status().as_u16(), 403),
        other => panic!("expected an HTTP 403 refusal, got {other:?}"),
    }
}

#[tokio::test]
async fn server_pings_for_liveness() {
    let addr = start_service(|config| {
        config.push.ping_interval_seconds = 1;
    })
    .await;

    let mut request = format!("ws://{addr}/ws/event/")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Token a-user-token".parse().unwrap());
    let (mut socket, _) = connect_async(request).await.unwrap();

    let deadline = Duration::from_secs(5);
    loop {
        let frame = timeout(deadline, socket.next())
            .await
            .expect("a ping within the interval")
            .expect("socket open")
            .expect("clean frame");
        if matches!(frame, Message::Ping(_)) {
            return;
        }
    }
}
