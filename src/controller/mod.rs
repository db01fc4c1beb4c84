use std::sync::Arc;

use axum::{http, response::IntoResponse};

use crate::service::app_state::{AppState, StateRouter, create_state_router};
use completion::create_completion_router;
use model::create_model_router;
use provider::create_provider_router;

mod completion;
mod error;
mod model;
mod provider;

pub use error::BaseError;

/// Every public route, relative to `base_path`. The admin routes need the state for their guard.
pub fn create_router(app_state: &Arc<AppState>) -> StateRouter {
    create_state_router().nest(
        "/v1",
        create_state_router()
            .merge(create_completion_router())
            .merge(create_model_router())
            .merge(create_provider_router(app_state)),
    )
}

pub async fn handle_404() -> impl IntoResponse {
    (http::StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::Router;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, Response};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::database::test_support::sqlite_pool;
    use crate::service::app_state::AppState;
    use crate::service::cache::CacheStore;
    use crate::service::chat_client::{ChatClient, ClientOptions};
    use crate::service::crypto::CredentialCodec;
    use crate::service::model_cache::{ModelCache, ModelCacheSettings};
    use crate::service::registry::{DefaultScope, ProviderRegistry};

    pub const ADMIN_TOKEN: &str = "test-admin-token";
    pub const PLATFORM_ORG: i64 = 1;

    pub struct TestApp {
        pub state: Arc<AppState>,
        pub router: Router,
        _dir: TempDir,
    }

    impl TestApp {
        /// Full router backed by a fresh database and an in-memory cache fed by `platform_url`.
        pub fn new(platform_url: &str) -> TestApp {
            let (pool, dir) = sqlite_pool();
            let options = ClientOptions::default();
            let scope = Arc::new(DefaultScope::new(PLATFORM_ORG, platform_url, None));
            let platform = ChatClient::new(platform_url, None, &options).unwrap();
            let cache = ModelCache::new(&CacheStore::Memory, &ModelCacheSettings::default(), Some(platform));
            let registry = ProviderRegistry::new(pool, CredentialCodec::new(Some("test-secret")), scope, options);
            let state = Arc::new(AppState::new(registry, cache, ADMIN_TOKEN));
            let router = super::create_router(&state).with_state(state.clone());
            TestApp { state, router, _dir: dir }
        }

        pub async fn send(&self, request: Request<Body>) -> Response<Body> {
            self.router.clone().oneshot(request).await.unwrap()
        }
    }

    pub async fn json_body(response: Response<Body>) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    pub fn request(method: &str, uri: &str, headers: &[(&str, &str)], body: Option<&Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }
}
