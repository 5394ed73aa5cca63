use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use geotrack_agent::{DeliveryClient, HttpTransport, LocationTransport, TransportError};
use geotrack_core::{LocationPayload, LocationSample};

#[derive(Clone)]
struct Ingest {
    status: Arc<AtomicU16>,
    delay: Duration,
    seen: Arc<Mutex<Vec<(serde_json::Value, Option<String>)>>>,
}

impl Ingest {
    fn new(status: u16) -> Self {
        Self {
            status: Arc::new(AtomicU16::new(status)),
            delay: Duration::ZERO,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

async fn ingest(
    State(state): State<Ingest>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.seen.lock().unwrap().push((body, auth));
    StatusCode::from_u16(state.status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn serve(state: Ingest) -> String {
    let app = Router::new()
        .route("/api/ubicaciones", post(ingest))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn payload() -> LocationPayload {
    LocationSample::new("42", -12.04, -77.04, 1_700_000_000_000).payload()
}

#[tokio::test]
async fn posts_json_body_with_bearer_token() {
    let state = Ingest::new(200);
    let base = serve(state.clone()).await;
    let transport = HttpTransport::new(&base, "/api/ubicaciones", Duration::from_secs(5)).unwrap();
    assert_eq!(transport.url(), format!("{base}/api/ubicaciones"));

    let status = transport.post_location(&payload(), Some("tok")).await.unwrap();
    assert_eq!(status, 200);

    let seen = state.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].0,
        serde_json::json!({"hijo_id": "42", "latitud": -12.04, "longitud": -77.04})
    );
    assert_eq!(seen[0].1.as_deref(), Some("Bearer tok"));
}

#[tokio::test]
async fn no_token_means_no_authorization_header() {
    let state = Ingest::new(201);
    let base = serve(state.clone()).await;
    let transport = HttpTransport::new(&base, "api/ubicaciones", Duration::from_secs(5)).unwrap();

    assert_eq!(transport.post_location(&payload(), None).await.unwrap(), 201);
    assert_eq!(state.seen.lock().unwrap()[0].1, None);
}

#[tokio::test]
async fn client_classifies_server_statuses() {
    let state = Ingest::new(200);
    let base = serve(state.clone()).await;
    let transport = HttpTransport::new(&base, "/api/ubicaciones", Duration::from_secs(5)).unwrap();
    let client = DeliveryClient::new(Arc::new(transport), Duration::from_secs(5));
    let sample = LocationSample::new("42", -12.04, -77.04, 1_700_000_000_000);

    assert!(client.send(&sample).await);
    state.status.store(500, Ordering::SeqCst);
    assert!(!client.send(&sample).await);
    state.status.store(404, Ordering::SeqCst);
    assert!(!client.send(&sample).await);
}

#[tokio::test]
async fn slow_server_times_out() {
    let mut state = Ingest::new(200);
    state.delay = Duration::from_secs(2);
    let base = serve(state).await;
    let transport =
        HttpTransport::new(&base, "/api/ubicaciones", Duration::from_millis(200)).unwrap();

    let err = transport.post_location(&payload(), None).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)), "got {err:?}");
}

#[tokio::test]
async fn unreachable_endpoint_is_a_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let transport = HttpTransport::new(
        &format!("http://{addr}"),
        "/api/ubicaciones",
        Duration::from_secs(5),
    )
    .unwrap();
    let err = transport.post_location(&payload(), None).await.unwrap_err();
    assert!(matches!(err, TransportError::Network(_)), "got {err:?}");
}
