//! In-process OpenAI-compatible backend used by the service and controller tests.

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

pub const STREAM_FRAMES: [&str; 5] = [
    "data: {\"id\":\"chatcmpl-mock\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
    "data: {\"id\":\"chatcmpl-mock\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    "data: {\"id\":\"chatcmpl-mock\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
    "data: {\"id\":\"chatcmpl-mock\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
    "data: [DONE]\n\n",
];

const FRAME_DELAY: Duration = Duration::from_millis(150);

#[derive(Clone, Default)]
pub struct BackendTracker {
    pub model_calls: Arc<AtomicUsize>,
    pub completion_calls: Arc<AtomicUsize>,
    pub chunks_sent: Arc<AtomicUsize>,
    pub stream_closed: Arc<AtomicBool>,
    authorization: Arc<Mutex<Option<String>>>,
    last_request: Arc<Mutex<Option<Value>>>,
}

impl BackendTracker {
    pub fn last_authorization(&self) -> Option<String> {
        self.authorization.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<Value> {
        self.last_request.lock().unwrap().clone()
    }

    pub fn backend_calls(&self) -> usize {
        self.model_calls.load(Ordering::SeqCst) + self.completion_calls.load(Ordering::SeqCst)
    }

    fn record_headers(&self, headers: &HeaderMap) {
        *self.authorization.lock().unwrap() = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }
}

struct CloseFlag(Arc<AtomicBool>);

impl Drop for CloseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone)]
struct MockState {
    tracker: BackendTracker,
    models: Arc<RwLock<Vec<Value>>>,
    failing: Arc<AtomicBool>,
}

pub struct MockBackend {
    /// Base URL including the `/v1` path segment.
    pub base_url: String,
    pub tracker: BackendTracker,
    state: MockState,
}

impl MockBackend {
    pub async fn start(model_ids: &[&str]) -> MockBackend {
        Self::start_with_entries(model_ids.iter().map(|id| bare_entry(id)).collect()).await
    }

    pub async fn start_with_entries(entries: Vec<Value>) -> MockBackend {
        let state = MockState {
            tracker: BackendTracker::default(),
            models: Arc::new(RwLock::new(entries)),
            failing: Arc::new(AtomicBool::new(false)),
        };
        let app = Router::new()
            .route("/v1/models", get(list_models))
            .route("/v1/chat/completions", post(completions))
            .with_state(state.clone());
        let base_url = serve(app).await;
        MockBackend {
            base_url,
            tracker: state.tracker.clone(),
            state,
        }
    }

    pub async fn start_failing() -> MockBackend {
        let backend = Self::start(&[]).await;
        backend.set_failing(true);
        backend
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_models(&self, model_ids: &[&str]) {
        *self.state.models.write().unwrap() = model_ids.iter().map(|id| bare_entry(id)).collect();
    }

    pub fn full_stream_body() -> String {
        STREAM_FRAMES.concat()
    }
}

pub fn bare_entry(id: &str) -> Value {
    json!({"id": id, "object": "model", "created": 1700000000, "owned_by": "mock"})
}

/// Serves `app` on an ephemeral local port and returns `http://127.0.0.1:<port>/v1`.
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/v1", addr)
}

async fn list_models(State(state): State<MockState>, headers: HeaderMap) -> Response {
    state.tracker.model_calls.fetch_add(1, Ordering::SeqCst);
    state.tracker.record_headers(&headers);
    if state.failing.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "upstream down").into_response();
    }
    let data = state.models.read().unwrap().clone();
    Json(json!({"object": "list", "data": data})).into_response()
}

async fn completions(State(state): State<MockState>, headers: HeaderMap, Json(request): Json<Value>) -> Response {
    state.tracker.completion_calls.fetch_add(1, Ordering::SeqCst);
    state.tracker.record_headers(&headers);
    *state.tracker.last_request.lock().unwrap() = Some(request.clone());
    if state.failing.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "upstream down").into_response();
    }

    if request["stream"].as_bool() == Some(true) {
        let tracker = state.tracker.clone();
        let frames = async_stream::stream! {
            let _closed = CloseFlag(tracker.stream_closed.clone());
            for (i, frame) in STREAM_FRAMES.into_iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(FRAME_DELAY).await;
                }
                tracker.chunks_sent.fetch_add(1, Ordering::SeqCst);
                yield Ok::<_, std::io::Error>(Bytes::from_static(frame.as_bytes()));
            }
        };
        return ([(header::CONTENT_TYPE, "text/event-stream")], Body::from_stream(frames)).into_response();
    }

    Json(json!({
        "id": "chatcmpl-mock",
        "object": "chat.completion",
        "created": 1700000000,
        "model": request["model"],
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "Hello"},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
    }))
    .into_response()
}
