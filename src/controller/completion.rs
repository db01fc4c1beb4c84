use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Json, State},
    http::header::{CACHE_CONTROL, CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::post,
};

use super::BaseError;
use crate::service::app_state::{AppState, StateRouter, create_state_router};
use crate::service::relay::{ChatCompletionRequest, RelayResponse};
use crate::utils::auth::CallerIdentity;

async fn create_completion(
    State(app_state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, BaseError> {
    let response = app_state
        .relay
        .complete(request, caller.organization_id, &caller.project_ids)
        .await?;
    Ok(match response {
        RelayResponse::Buffered(body) => Json(body).into_response(),
        RelayResponse::Streaming(stream) => (
            [(CONTENT_TYPE, "text/event-stream"), (CACHE_CONTROL, "no-cache")],
            Body::from_stream(stream),
        )
            .into_response(),
    })
}

pub fn create_completion_router() -> StateRouter {
    create_state_router().route("/chat/completions", post(create_completion))
}

#[cfg(test)]
mod tests {
    use crate::controller::test_support::{TestApp, json_body, request};
    use crate::service::mock_backend::MockBackend;
    use axum::body::to_bytes;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_messages_is_bad_request() {
        let platform = MockBackend::start(&["m1"]).await;
        let app = TestApp::new(&platform.base_url);

        let response = app
            .send(request(
                "POST",
                "/v1/chat/completions",
                &[],
                Some(&json!({"model": "m1", "messages": []})),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], 1001);
        assert_eq!(body["msg"], "messages cannot be empty");
        assert_eq!(platform.tracker.backend_calls(), 0);
    }

    #[tokio::test]
    async fn test_buffered_completion_returned_bare() {
        let platform = MockBackend::start(&["m1"]).await;
        let app = TestApp::new(&platform.base_url);

        let response = app
            .send(request(
                "POST",
                "/v1/chat/completions",
                &[("X-Organization-Id", "7")],
                Some(&json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]})),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["usage"]["total_tokens"], 4);
    }

    #[tokio::test]
    async fn test_streaming_completion_is_event_stream() {
        let platform = MockBackend::start(&["m1"]).await;
        let app = TestApp::new(&platform.base_url);

        let response = app
            .send(request(
                "POST",
                "/v1/chat/completions",
                &[],
                Some(&json!({"model": "m1", "stream": true, "messages": [{"role": "user", "content": "hi"}]})),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(String::from_utf8(bytes.to_vec()).unwrap(), MockBackend::full_stream_body());
    }

    #[tokio::test]
    async fn test_backend_failure_maps_status() {
        let platform = MockBackend::start_failing().await;
        let app = TestApp::new(&platform.base_url);

        let response = app
            .send(request(
                "POST",
                "/v1/chat/completions",
                &[],
                Some(&json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]})),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["code"], 1400);
    }
}
