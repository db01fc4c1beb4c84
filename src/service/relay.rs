use bytes::Bytes;
use cyder_tools::log::{debug, info, warn};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use crate::controller::BaseError;
use crate::service::chat_client::ChatByteStream;
use crate::service::model_cache::ModelCache;
use crate::service::registry::ProviderRegistry;
use crate::utils::sse::{DONE_MARKER, SseParser};

/// OpenAI-style chat completion request. Fields the relay does not inspect ride along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

pub enum RelayResponse {
    Buffered(Value),
    Streaming(ChatByteStream),
}

impl std::fmt::Debug for RelayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayResponse::Buffered(body) => f.debug_tuple("Buffered").field(body).finish(),
            RelayResponse::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// Logs a caller disconnect when dropped before the backend stream finished.
struct StreamGuard {
    request_id: String,
    finished: Arc<AtomicBool>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::SeqCst) {
            warn!("[{}] caller disconnected, backend stream cancelled", self.request_id);
        }
    }
}

/// Request-time entry point: resolves the serving provider and forwards the call.
#[derive(Clone)]
pub struct CompletionRelay {
    registry: ProviderRegistry,
    model_cache: ModelCache,
}

impl CompletionRelay {
    pub fn new(registry: ProviderRegistry, model_cache: ModelCache) -> Self {
        CompletionRelay { registry, model_cache }
    }

    /// Backends the model cache lists for `model`.
    pub async fn served_by(&self, model: &str) -> Vec<String> {
        self.model_cache
            .get_model_to_backends()
            .await
            .remove(model)
            .unwrap_or_default()
    }

    pub async fn complete(
        &self,
        request: ChatCompletionRequest,
        organization_id: i64,
        project_ids: &[i64],
    ) -> Result<RelayResponse, BaseError> {
        if request.messages.is_empty() {
            return Err(BaseError::ParamInvalid(Some("messages cannot be empty".to_string())));
        }
        let request_id = Uuid::new_v4().simple().to_string();

        let resolution = self
            .registry
            .get_provider_for_model_or_default(&request.model, organization_id, project_ids);
        if let Some(reason) = &resolution.fallback_reason {
            let served_by = self.served_by(&request.model).await;
            if served_by.is_empty() {
                warn!(
                    "[{}] model '{}' is neither registered nor advertised by a cached backend, using default provider: {}",
                    request_id, request.model, reason
                );
            } else {
                debug!(
                    "[{}] model '{}' falls back to the default provider, advertised by {:?}",
                    request_id, request.model, served_by
                );
            }
        }
        let provider = resolution.provider;
        let client = self.registry.client_for(&provider)?;
        let payload = serde_json::to_value(&request)
            .map_err(|e| BaseError::ParamInvalid(Some(format!("invalid completion request: {}", e))))?;

        info!(
            "[{}] relaying model '{}' to provider {} (stream: {})",
            request_id,
            request.model,
            provider.public_id,
            request.is_stream()
        );
        if !request.is_stream() {
            let body = client.create_completion(&payload).await?;
            debug!("[{}] buffered completion finished", request_id);
            return Ok(RelayResponse::Buffered(body));
        }

        let upstream = client.create_completion_stream(&payload).await?;
        Ok(RelayResponse::Streaming(observe_stream(request_id, upstream)))
    }
}

/// Passes backend bytes through unchanged while watching the frames for the done marker.
fn observe_stream(request_id: String, mut upstream: ChatByteStream) -> ChatByteStream {
    let finished = Arc::new(AtomicBool::new(false));
    let guard = StreamGuard {
        request_id: request_id.clone(),
        finished: finished.clone(),
    };
    let observed = async_stream::stream! {
        let _guard = guard;
        let mut parser = SseParser::new();
        let mut saw_done = false;
        let mut frames = 0usize;
        while let Some(chunk_result) = upstream.next().await {
            match chunk_result {
                Ok(chunk) => {
                    for frame in parser.process(&chunk) {
                        frames += 1;
                        saw_done |= frame.is_done();
                    }
                    yield Ok::<Bytes, std::io::Error>(chunk);
                }
                Err(e) => {
                    finished.store(true, Ordering::SeqCst);
                    yield Err(e);
                    break;
                }
            }
        }
        finished.store(true, Ordering::SeqCst);
        if saw_done {
            info!("[{}] stream completed after {} frames", request_id, frames);
        } else {
            warn!("[{}] backend closed the stream after {} frames without {}", request_id, frames, DONE_MARKER);
        }
    };
    Box::pin(observed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::sqlite_pool;
    use crate::service::cache::CacheStore;
    use crate::service::chat_client::{ChatClient, ClientOptions};
    use crate::service::crypto::CredentialCodec;
    use crate::service::mock_backend::{MockBackend, STREAM_FRAMES};
    use crate::service::model_cache::ModelCacheSettings;
    use crate::service::registry::{DefaultScope, RegisterProviderInput};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    const ORG: i64 = 7;

    fn relay_with_default(default_url: &str) -> (CompletionRelay, ProviderRegistry, TempDir) {
        let (pool, dir) = sqlite_pool();
        let registry = ProviderRegistry::new(
            pool,
            CredentialCodec::new(Some("test-secret")),
            Arc::new(DefaultScope::new(1, default_url, None)),
            ClientOptions::default(),
        );
        let platform = ChatClient::new(default_url, None, &ClientOptions::default()).unwrap();
        let cache = ModelCache::new(&CacheStore::Memory, &ModelCacheSettings::default(), Some(platform));
        (CompletionRelay::new(registry.clone(), cache), registry, dir)
    }

    fn request(body: Value) -> ChatCompletionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[tokio::test]
    async fn test_empty_messages_rejected_before_backend_call() {
        let backend = MockBackend::start(&["m1"]).await;
        let (relay, _registry, _dir) = relay_with_default(&backend.base_url);

        let err = relay
            .complete(request(json!({"model": "m1", "messages": []})), ORG, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BaseError::ParamInvalid(_)));
        let err = relay
            .complete(request(json!({"model": "m1"})), ORG, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, BaseError::ParamInvalid(_)));
        assert_eq!(backend.tracker.backend_calls(), 0);
    }

    #[tokio::test]
    async fn test_buffered_completion_via_registered_provider() {
        let default_backend = MockBackend::start(&[]).await;
        let backend = MockBackend::start(&["m1"]).await;
        let (relay, registry, _dir) = relay_with_default(&default_backend.base_url);
        let provider = registry
            .register_provider(RegisterProviderInput {
                organization_id: Some(ORG),
                name: "p1".to_string(),
                base_url: backend.base_url.clone(),
                api_key: Some("sk-p1-key".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        registry.discover_and_sync(&provider).await.unwrap();

        let response = relay
            .complete(
                request(json!({
                    "model": "m1",
                    "messages": [{"role": "user", "content": "hi"}],
                    "temperature": 0.2
                })),
                ORG,
                &[],
            )
            .await
            .unwrap();
        match response {
            RelayResponse::Buffered(body) => assert_eq!(body["choices"][0]["message"]["content"], "Hello"),
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(backend.tracker.last_authorization().as_deref(), Some("Bearer sk-p1-key"));
        let forwarded = backend.tracker.last_request().unwrap();
        assert_eq!(forwarded["temperature"], 0.2);
        assert!(forwarded.get("stream").is_none());
        assert_eq!(default_backend.tracker.backend_calls(), 0);
    }

    #[tokio::test]
    async fn test_unresolved_model_falls_back_to_default() {
        let default_backend = MockBackend::start(&[]).await;
        let (relay, _registry, _dir) = relay_with_default(&default_backend.base_url);

        let response = relay
            .complete(
                request(json!({"model": "anything", "messages": [{"role": "user", "content": "hi"}]})),
                ORG,
                &[],
            )
            .await
            .unwrap();
        assert!(matches!(response, RelayResponse::Buffered(_)));
        assert_eq!(default_backend.tracker.completion_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_consults_model_cache_once() {
        let default_backend = MockBackend::start(&["m1"]).await;
        let (relay, _registry, _dir) = relay_with_default(&default_backend.base_url);
        let body = json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}]});

        relay.complete(request(body.clone()), ORG, &[]).await.unwrap();
        relay.complete(request(body), ORG, &[]).await.unwrap();
        assert_eq!(relay.served_by("m1").await, vec![default_backend.base_url.clone()]);
        assert!(relay.served_by("unknown").await.is_empty());
        assert_eq!(default_backend.tracker.model_calls.load(Ordering::SeqCst), 1);
        assert_eq!(default_backend.tracker.completion_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_backend_failure_is_inference_error() {
        let default_backend = MockBackend::start_failing().await;
        let (relay, _registry, _dir) = relay_with_default(&default_backend.base_url);

        let err = relay
            .complete(
                request(json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}], "stream": true})),
                ORG,
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BaseError::Inference { status: Some(503), .. }));
        assert_eq!(default_backend.tracker.completion_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_relayed_verbatim() {
        let default_backend = MockBackend::start(&[]).await;
        let (relay, _registry, _dir) = relay_with_default(&default_backend.base_url);

        let response = relay
            .complete(
                request(json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}], "stream": true})),
                ORG,
                &[],
            )
            .await
            .unwrap();
        let RelayResponse::Streaming(mut stream) = response else {
            panic!("expected a stream");
        };
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(String::from_utf8(collected).unwrap(), MockBackend::full_stream_body());
    }

    #[tokio::test]
    async fn test_caller_cancel_tears_down_backend_stream() {
        let default_backend = MockBackend::start(&[]).await;
        let (relay, _registry, _dir) = relay_with_default(&default_backend.base_url);

        let response = relay
            .complete(
                request(json!({"model": "m1", "messages": [{"role": "user", "content": "hi"}], "stream": true})),
                ORG,
                &[],
            )
            .await
            .unwrap();
        let RelayResponse::Streaming(mut stream) = response else {
            panic!("expected a stream");
        };

        let expected = STREAM_FRAMES[..2].concat();
        let mut received = Vec::new();
        while received.len() < expected.len() {
            let chunk = stream.next().await.unwrap().unwrap();
            received.extend_from_slice(&chunk);
        }
        assert_eq!(String::from_utf8(received).unwrap(), expected);
        drop(stream);

        let tracker = default_backend.tracker.clone();
        let mut closed = false;
        for _ in 0..40 {
            if tracker.stream_closed.load(Ordering::SeqCst) {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(closed, "backend stream was not torn down");
        let sent = tracker.chunks_sent.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(tracker.chunks_sent.load(Ordering::SeqCst), sent);
        assert!(sent < STREAM_FRAMES.len());
    }
}
