//! Retry behavior of the transport layer: attempt counting, `Retry-After`,
//! backoff-and-recover, and query-value redaction in surfaced errors.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use common::*;
use oci_rangefetch::{FetchError, RetryClient, RetryConfig};

/// Serves a scripted status sequence, recording arrival times.
#[derive(Clone)]
struct Script {
    statuses: Arc<Vec<(StatusCode, Option<&'static str>)>>,
    hits: Arc<AtomicUsize>,
    times: Arc<Mutex<Vec<Instant>>>,
}

impl Script {
    fn new(statuses: Vec<(StatusCode, Option<&'static str>)>) -> Self {
        Script {
            statuses: Arc::new(statuses),
            hits: Arc::new(AtomicUsize::new(0)),
            times: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/flaky", get(script_handler))
            .with_state(self.clone())
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn gap(&self, from: usize, to: usize) -> Duration {
        let times = self.times.lock().unwrap();
        times[to].duration_since(times[from])
    }
}

async fn script_handler(State(state): State<Script>) -> Response {
    let n = state.hits.fetch_add(1, Ordering::SeqCst);
    state.times.lock().unwrap().push(Instant::now());
    let (status, retry_after) = state
        .statuses
        .get(n)
        .copied()
        .unwrap_or((StatusCode::OK, None));
    let mut headers = HeaderMap::new();
    if let Some(value) = retry_after {
        headers.insert("Retry-After", value.parse().unwrap());
    }
    (status, headers, "body").into_response()
}

fn get_request(url: &str) -> reqwest::Request {
    reqwest::Request::new(reqwest::Method::GET, url.parse().unwrap())
}

#[tokio::test]
async fn zero_max_retries_means_exactly_one_attempt() {
    let state = Script::new(vec![(StatusCode::SERVICE_UNAVAILABLE, None)]);
    let server = StubServer::start(|_| state.router()).await;
    let client = RetryClient::new(&fast_retry_config(0)).unwrap();

    let err = client
        .execute(get_request(&format!("http://{}/flaky", server.addr)))
        .await
        .expect_err("503 with no retry budget");
    assert_eq!(state.hits(), 1);
    assert!(err
        .to_string()
        .contains("giving up request after 1 attempt(s)"));
}

#[tokio::test]
async fn transient_503_recovers_on_retry() {
    let state = Script::new(vec![
        (StatusCode::SERVICE_UNAVAILABLE, None),
        (StatusCode::OK, None),
    ]);
    let server = StubServer::start(|_| state.router()).await;
    let client = RetryClient::new(&fast_retry_config(2)).unwrap();

    let resp = client
        .execute(get_request(&format!("http://{}/flaky", server.addr)))
        .await
        .expect("second attempt succeeds");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(state.hits(), 2);
}

#[tokio::test]
async fn not_implemented_is_not_retried() {
    let state = Script::new(vec![(StatusCode::NOT_IMPLEMENTED, None)]);
    let server = StubServer::start(|_| state.router()).await;
    let client = RetryClient::new(&fast_retry_config(3)).unwrap();

    let resp = client
        .execute(get_request(&format!("http://{}/flaky", server.addr)))
        .await
        .expect("501 is returned, not retried");
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_IMPLEMENTED);
    assert_eq!(state.hits(), 1);
}

#[tokio::test]
async fn retry_after_is_honored_with_bounded_jitter() {
    let state = Script::new(vec![
        (StatusCode::TOO_MANY_REQUESTS, Some("1")),
        (StatusCode::OK, None),
    ]);
    let server = StubServer::start(|_| state.router()).await;
    let client = RetryClient::new(&RetryConfig {
        max_retries: 2,
        min_wait_msec: 10,
        max_wait_msec: 5_000,
        ..Default::default()
    })
    .unwrap();

    let resp = client
        .execute(get_request(&format!("http://{}/flaky", server.addr)))
        .await
        .expect("recovers after the advertised wait");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(state.hits(), 2);

    // Jittered delay lies in [1s, 1.125s); leave headroom for scheduling.
    let gap = state.gap(0, 1);
    assert!(gap >= Duration::from_secs(1), "gap was {gap:?}");
    assert!(gap < Duration::from_millis(1400), "gap was {gap:?}");
}

#[tokio::test]
async fn retry_after_is_clamped_to_max_wait() {
    let state = Script::new(vec![
        (StatusCode::TOO_MANY_REQUESTS, Some("3600")),
        (StatusCode::OK, None),
    ]);
    let server = StubServer::start(|_| state.router()).await;
    let client = RetryClient::new(&fast_retry_config(1)).unwrap();

    let start = Instant::now();
    client
        .execute(get_request(&format!("http://{}/flaky", server.addr)))
        .await
        .expect("clamped wait recovers quickly");
    // max_wait is 100ms, so an hour-long Retry-After must not be honored.
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn errors_redact_query_values() {
    let state = Script::new(vec![
        (StatusCode::SERVICE_UNAVAILABLE, None),
        (StatusCode::SERVICE_UNAVAILABLE, None),
    ]);
    let server = StubServer::start(|_| state.router()).await;
    let client = RetryClient::new(&fast_retry_config(1)).unwrap();

    let err = client
        .execute(get_request(&format!(
            "http://{}/flaky?X-Amz-Signature=topsecret&token=hunter2",
            server.addr
        )))
        .await
        .expect_err("all attempts fail");

    let message = err.to_string();
    assert!(message.contains("giving up request after 2 attempt(s)"));
    assert!(message.contains("X-Amz-Signature=REDACTED"));
    assert!(message.contains("token=REDACTED"));
    assert!(!message.contains("topsecret"));
    assert!(!message.contains("hunter2"));
    assert!(matches!(err, FetchError::GivingUp { attempts: 2, .. }));
}

#[tokio::test]
async fn connection_errors_are_retried_and_redacted() {
    // Nothing listens on this port; every attempt is a connect error.
    let client = RetryClient::new(&fast_retry_config(1)).unwrap();
    let err = client
        .execute(get_request(
            "http://127.0.0.1:1/flaky?X-Amz-Credential=AKIAsecret",
        ))
        .await
        .expect_err("nothing is listening");
    let message = err.to_string();
    assert!(message.contains("giving up request after 2 attempt(s)"));
    assert!(!message.contains("AKIAsecret"));
}
