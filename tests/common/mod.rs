#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Form, Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use fodcli::fod::{Backoff, Connection, ConnectionBuilder, RetryPolicy};

pub const FPR_CONTENT: &[u8] = b"PK\x03\x04fortify-project-results audit.fvdl webinspect.xml";

/// Shared state of the fake FoD server. Tests tweak it to provoke throttling,
/// token rejection or broken downloads, and read the counters afterwards.
#[derive(Default)]
pub struct MockState {
    pub releases: Mutex<Vec<Value>>,
    pub vulnerability_count: AtomicUsize,

    pub token_requests: AtomicUsize,
    pub token_forms: Mutex<Vec<HashMap<String, String>>>,
    pub release_requests: AtomicUsize,
    pub vulnerability_requests: AtomicUsize,
    pub detail_requests: AtomicUsize,
    pub fpr_requests: AtomicUsize,

    /// Next N API requests are answered with 429.
    pub throttle: AtomicUsize,
    /// Requests answered with 429 so far.
    pub throttled: AtomicUsize,
    /// The first FPR request of every release is answered with 429.
    pub throttle_each_release: AtomicBool,
    /// FPR requests per release, throttled ones included.
    pub fpr_hits: Mutex<HashMap<String, usize>>,
    /// FPR requests are answered with 204 and no body.
    pub no_content: AtomicBool,
    /// Next N FPR requests are answered with 202.
    pub pending: AtomicUsize,
    /// FPR bodies abort after the first few bytes.
    pub break_stream: AtomicBool,
    pub rejected_tokens: Mutex<Vec<String>>,
    pub reject_all_tokens: AtomicBool,
    pub release_delay: Mutex<Duration>,

    /// Ordered log of page requests, shared with handlers in tests.
    pub events: Mutex<Vec<String>>,
}

impl MockState {
    pub fn push_event(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct MockFod {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockFod {
    pub async fn start() -> Self {
        let state = MockState::default();
        *state.releases.lock().unwrap() = default_releases();
        state.vulnerability_count.store(12, Ordering::SeqCst);
        Self::with_state(state).await
    }

    pub async fn with_state(state: MockState) -> Self {
        let state = Arc::new(state);
        let app = Router::new()
            .route("/oauth/token", post(token))
            .route("/api/v3/releases", get(releases))
            .route("/api/v3/releases/{id}/fpr", get(fpr))
            .route("/api/v3/releases/{id}/vulnerabilities", get(vulnerabilities))
            .route(
                "/api/v3/releases/{id}/vulnerabilities/{vuln_id}/{detail}",
                get(vulnerability_detail),
            )
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn connection_string(&self) -> String {
        format!("http://client-id:client-secret@{}/", self.addr)
    }

    pub fn builder(&self) -> ConnectionBuilder {
        Connection::builder()
            .connection_string(self.connection_string())
            .retry_policy(fast_retry(5))
    }

    pub async fn connect(&self) -> Connection {
        self.builder().build().await.unwrap()
    }
}

/// Retry policy with millisecond delays so throttling tests stay fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Backoff::Fixed(Duration::from_millis(5)))
}

pub fn default_releases() -> Vec<Value> {
    vec![
        release(1001, "WebGoat", "5.0", 4),
        release(1002, "WebGoat", "6.0", 3),
        release(1003, "WebGoat", "7.1", 5),
        release(2001, "JuiceShop", "12.0", 2),
        release(2002, "JuiceShop", "13.1", 1),
        release(3001, "Duplicate", "1.0", 3),
        release(3002, "Duplicate", "1.0", 3),
    ]
}

fn release(id: u64, application: &str, name: &str, rating: u64) -> Value {
    json!({
        "releaseId": id,
        "applicationName": application,
        "releaseName": name,
        "rating": rating,
        "sdlcStatusType": "Production",
    })
}

fn take(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Authentication and throttling shared by every API route.
fn gate(state: &MockState, headers: &HeaderMap) -> Option<Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .to_string();

    if token.is_empty()
        || state.reject_all_tokens.load(Ordering::SeqCst)
        || state.rejected_tokens.lock().unwrap().contains(&token)
    {
        return Some(StatusCode::UNAUTHORIZED.into_response());
    }
    if take(&state.throttle) {
        return Some(too_many_requests(state));
    }
    None
}

fn too_many_requests(state: &MockState) -> Response {
    state.throttled.fetch_add(1, Ordering::SeqCst);
    (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "0")]).into_response()
}

fn window(params: &HashMap<String, String>) -> (usize, usize) {
    let offset = params
        .get("offset")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let limit = params
        .get("limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(50);
    (offset, limit)
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn token(
    State(state): State<Arc<MockState>>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let rejected = form.get("client_secret").is_some_and(|s| s == "wrong");
    state.token_forms.lock().unwrap().push(form);
    if rejected {
        return (StatusCode::UNAUTHORIZED, "invalid_client").into_response();
    }

    let n = state.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({
        "access_token": format!("token-{n}"),
        "token_type": "bearer",
        "expires_in": 3600,
    }))
    .into_response()
}

async fn releases(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let delay = *state.release_delay.lock().unwrap();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if let Some(res) = gate(&state, &headers) {
        return res;
    }
    state.release_requests.fetch_add(1, Ordering::SeqCst);

    let filters: Vec<(String, String)> = params
        .get("filters")
        .map(|f| {
            f.split('+')
                .filter_map(|pair| pair.split_once(':'))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();
    let fields: Option<Vec<String>> = params
        .get("fields")
        .map(|f| f.split(',').map(str::to_string).collect());

    let matching: Vec<Value> = state
        .releases
        .lock()
        .unwrap()
        .iter()
        .filter(|r| filters.iter().all(|(k, v)| as_text(&r[k.as_str()]) == *v))
        .cloned()
        .collect();

    let (offset, limit) = window(&params);
    state.push_event(format!("releases offset={offset}"));

    let items: Vec<Value> = matching
        .iter()
        .skip(offset)
        .take(limit)
        .map(|r| match &fields {
            Some(fields) => Value::Object(
                fields
                    .iter()
                    .filter_map(|f| r.get(f).map(|v| (f.clone(), v.clone())))
                    .collect(),
            ),
            None => r.clone(),
        })
        .collect();

    Json(json!({ "items": items, "totalCount": matching.len() })).into_response()
}

/// Answers with bare arrays, without a total count.
async fn vulnerabilities(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(release_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(res) = gate(&state, &headers) {
        return res;
    }
    state.vulnerability_requests.fetch_add(1, Ordering::SeqCst);

    let (offset, limit) = window(&params);
    state.push_event(format!("vulnerabilities offset={offset}"));

    let count = state.vulnerability_count.load(Ordering::SeqCst);
    let items: Vec<Value> = (offset..count)
        .take(limit)
        .map(|i| {
            json!({
                "vulnId": format!("v{i}"),
                "releaseId": release_id,
                "severityString": if i % 2 == 0 { "High" } else { "Low" },
            })
        })
        .collect();

    Json(Value::Array(items)).into_response()
}

async fn vulnerability_detail(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path((release_id, vuln_id, detail)): Path<(String, String, String)>,
) -> Response {
    if let Some(res) = gate(&state, &headers) {
        return res;
    }
    state.detail_requests.fetch_add(1, Ordering::SeqCst);

    Json(json!({
        "releaseId": release_id,
        "vulnId": vuln_id,
        "detail": detail,
    }))
    .into_response()
}

async fn fpr(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Path(release_id): Path<String>,
) -> Response {
    if let Some(res) = gate(&state, &headers) {
        return res;
    }
    let hits = {
        let mut hits = state.fpr_hits.lock().unwrap();
        let n = hits.entry(release_id).or_default();
        *n += 1;
        *n
    };
    if hits == 1 && state.throttle_each_release.load(Ordering::SeqCst) {
        return too_many_requests(&state);
    }
    state.fpr_requests.fetch_add(1, Ordering::SeqCst);

    if state.no_content.load(Ordering::SeqCst) {
        return StatusCode::NO_CONTENT.into_response();
    }

    if take(&state.pending) {
        return (StatusCode::ACCEPTED, [(header::RETRY_AFTER, "0")]).into_response();
    }

    if state.break_stream.load(Ordering::SeqCst) {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(&FPR_CONTENT[..8])),
            Err(std::io::Error::other("connection reset by peer")),
        ];
        return Body::from_stream(futures_util::stream::iter(chunks)).into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Bytes::from_static(FPR_CONTENT),
    )
        .into_response()
}
