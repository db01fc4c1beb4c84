use std::sync::Arc;

use axum::Router;
use cyder_tools::log::{info, warn};

use crate::config::{CacheBackendType, FinalConfig};
use crate::controller::BaseError;
use crate::database::DbPool;
use crate::service::cache::CacheStore;
use crate::service::chat_client::{ChatClient, ClientOptions};
use crate::service::crypto::CredentialCodec;
use crate::service::model_cache::{ModelCache, ModelCacheSettings};
use crate::service::redis;
use crate::service::registry::{DefaultScope, ProviderRegistry};
use crate::service::relay::CompletionRelay;

/// Everything a request handler needs, built once in `main` and shared behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub registry: ProviderRegistry,
    pub model_cache: ModelCache,
    pub relay: CompletionRelay,
    admin_token: String,
}

impl AppState {
    pub fn new(registry: ProviderRegistry, model_cache: ModelCache, admin_token: &str) -> Self {
        AppState {
            relay: CompletionRelay::new(registry.clone(), model_cache.clone()),
            registry,
            model_cache,
            admin_token: admin_token.trim().to_string(),
        }
    }

    pub fn admin_token(&self) -> &str {
        &self.admin_token
    }

    pub fn default_organization_id(&self) -> i64 {
        self.registry.default_scope().organization_id
    }
}

async fn create_cache_store(config: &FinalConfig) -> CacheStore {
    if config.cache.backend != CacheBackendType::Redis {
        info!("Using in-memory cache backend.");
        return CacheStore::Memory;
    }
    let Some(redis_config) = config.redis.as_ref() else {
        return CacheStore::Memory;
    };
    match redis::connect(redis_config).await {
        Some(pool) => {
            info!("Using Redis cache backend.");
            CacheStore::Redis {
                pool,
                key_prefix: format!("{}{}", redis_config.key_prefix, config.cache.redis.key_prefix),
            }
        }
        None => {
            warn!("Redis is configured, but connection failed. Falling back to in-memory cache.");
            CacheStore::Memory
        }
    }
}

/// Wires the services from configuration. The database pool is opened by the caller.
pub async fn create_app_state(config: &FinalConfig, pool: DbPool) -> Result<Arc<AppState>, BaseError> {
    let codec = CredentialCodec::new(config.provider_secret.as_deref());
    if !codec.is_configured() {
        warn!("MODEL_PROVIDER_SECRET is not set, providers with api keys cannot be registered");
    }
    let client_options = ClientOptions {
        proxy: config.proxy.clone(),
        discovery_timeout: config.discovery_timeout(),
        request_timeout: config.request_timeout(),
    };
    let default_scope = Arc::new(DefaultScope::new(
        config.default_organization_id,
        &config.platform.inference_url,
        config.platform.api_key.clone(),
    ));
    let platform_client = ChatClient::new(
        &default_scope.default_provider.base_url,
        config.platform.api_key.as_deref(),
        &client_options,
    )?;

    let store = create_cache_store(config).await;
    let settings = ModelCacheSettings {
        ttl: config.cache.ttl(),
        negative_ttl: config.cache.negative_ttl(),
    };
    let model_cache = ModelCache::new(&store, &settings, Some(platform_client));
    let registry = ProviderRegistry::new(pool, codec, default_scope, client_options);

    Ok(Arc::new(AppState::new(registry, model_cache, &config.admin_token)))
}

pub type StateRouter = Router<Arc<AppState>>;

pub fn create_state_router() -> StateRouter {
    Router::<Arc<AppState>>::new()
}
