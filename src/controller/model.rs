use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::HeaderMap,
    routing::get,
};
use serde::Serialize;

use super::BaseError;
use crate::database::model_catalog::ModelCatalog;
use crate::database::provider::Provider;
use crate::schema::enum_def::{CatalogStatus, ProviderKind};
use crate::service::app_state::{AppState, StateRouter, create_state_router};
use crate::service::catalog::Architecture;
use crate::service::registry::{ProviderRegistry, ProviderScope};
use crate::utils::HttpResult;
use crate::utils::auth::CallerIdentity;

const PROVIDER_DATA_HEADER: &str = "x-provider-data";

#[derive(Debug, Serialize)]
struct ProviderBrief {
    public_id: String,
    slug: String,
    name: String,
    kind: ProviderKind,
    scope: ProviderScope,
}

#[derive(Debug, Serialize)]
struct CatalogBrief {
    public_id: String,
    status: CatalogStatus,
    notes: Option<String>,
    architecture: Architecture,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_synced_at: Option<i64>,
}

impl From<&ModelCatalog> for CatalogBrief {
    fn from(catalog: &ModelCatalog) -> Self {
        CatalogBrief {
            public_id: catalog.public_id.clone(),
            status: catalog.status,
            notes: catalog.notes.clone(),
            architecture: catalog.architecture(),
            last_synced_at: catalog.last_synced_at,
        }
    }
}

#[derive(Debug, Serialize)]
struct ModelEntry {
    id: String,
    object: &'static str,
    created: i64,
    owned_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<ProviderBrief>,
    #[serde(skip_serializing_if = "Option::is_none")]
    catalog: Option<CatalogBrief>,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    object: &'static str,
    data: Vec<ModelEntry>,
}

#[derive(Debug, Serialize)]
struct ProviderSummary {
    id: String,
    slug: String,
    name: String,
    vendor: String,
    base_url: String,
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<BTreeMap<String, String>>,
    scope: ProviderScope,
}

fn brief(registry: &ProviderRegistry, provider: &Provider) -> ProviderBrief {
    ProviderBrief {
        public_id: provider.public_id.clone(),
        slug: provider.slug.clone(),
        name: provider.name.clone(),
        kind: provider.kind,
        scope: registry.scope_of(provider),
    }
}

fn wants_provider_data(headers: &HeaderMap) -> bool {
    headers
        .get(PROVIDER_DATA_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Platform models first, then the active models of every accessible provider. First id wins.
async fn list_models(
    State(app_state): State<Arc<AppState>>,
    caller: CallerIdentity,
    headers: HeaderMap,
) -> Result<Json<ModelsResponse>, BaseError> {
    let with_provider = wants_provider_data(&headers);
    let registry = &app_state.registry;
    let platform = &registry.default_scope().default_provider;

    let mut seen = HashSet::new();
    let mut data = Vec::new();
    for model in app_state.model_cache.list_models().await {
        if !seen.insert(model.id.clone()) {
            continue;
        }
        data.push(ModelEntry {
            provider: with_provider.then(|| brief(registry, platform)),
            catalog: None,
            id: model.id,
            object: "model",
            created: model.created,
            owned_by: model.owned_by,
        });
    }

    let providers = registry.list_accessible_providers(caller.organization_id, &caller.project_ids)?;
    let by_id: HashMap<i64, &Provider> = providers.iter().map(|p| (p.id, p)).collect();
    let ids: Vec<i64> = providers.iter().filter(|p| p.active).map(|p| p.id).collect();
    let mut models = registry.list_active_provider_models(&ids)?;
    let rank: HashMap<i64, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    models.sort_by_key(|m| rank.get(&m.provider_id).copied().unwrap_or(usize::MAX));
    let catalogs = if with_provider {
        registry.catalogs_by_id(&models)?
    } else {
        HashMap::new()
    };

    for model in models {
        let Some(provider) = by_id.get(&model.provider_id) else {
            continue;
        };
        if !seen.insert(model.model_key.clone()) {
            continue;
        }
        data.push(ModelEntry {
            provider: with_provider.then(|| brief(registry, provider)),
            catalog: model
                .model_catalog_id
                .and_then(|id| catalogs.get(&id))
                .map(CatalogBrief::from),
            id: model.model_key,
            object: "model",
            created: model.created_at / 1000,
            owned_by: provider.slug.clone(),
        });
    }

    Ok(Json(ModelsResponse { object: "list", data }))
}

async fn list_providers(
    State(app_state): State<Arc<AppState>>,
    caller: CallerIdentity,
) -> Result<HttpResult<Vec<ProviderSummary>>, BaseError> {
    let registry = &app_state.registry;
    let mut providers = registry.list_accessible_providers(caller.organization_id, &caller.project_ids)?;
    providers.push(registry.default_scope().default_provider.clone());

    let mut summaries: Vec<ProviderSummary> = providers
        .into_iter()
        .map(|p| ProviderSummary {
            scope: registry.scope_of(&p),
            metadata: p.metadata_map(),
            vendor: p.kind.to_string(),
            id: p.public_id,
            slug: p.slug,
            name: p.name,
            base_url: p.base_url,
            active: p.active,
        })
        .collect();
    summaries.sort_by(|a, b| a.scope.cmp(&b.scope).then_with(|| a.name.cmp(&b.name)));
    Ok(HttpResult::new(summaries))
}

pub fn create_model_router() -> StateRouter {
    create_state_router()
        .route("/models", get(list_models))
        .route("/models/providers", get(list_providers))
}
