use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    middleware,
    routing::{patch, post},
};
use cyder_tools::log::{info, warn};
use serde::{Deserialize, Serialize};

use super::BaseError;
use crate::database::model_catalog::ModelCatalog;
use crate::database::provider::Provider;
use crate::database::provider_model::ProviderModel;
use crate::schema::enum_def::CatalogStatus;
use crate::service::app_state::{AppState, StateRouter, create_state_router};
use crate::service::registry::{ProviderRegistry, RegisterProviderInput, SyncedModel, UpdateProviderInput};
use crate::utils::HttpResult;
use crate::utils::auth::{CallerIdentity, admin_access_middleware};

#[derive(Deserialize)]
struct RegisterPayload {
    name: String,
    #[serde(default)]
    vendor: String,
    base_url: String,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    metadata: Option<BTreeMap<String, String>>,
    #[serde(default)]
    active: Option<bool>,
    #[serde(default)]
    project_id: Option<i64>,
}

#[derive(Serialize)]
struct ProviderModelSummary {
    id: String,
    model_key: String,
    display_name: String,
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    catalog_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    catalog_status: Option<CatalogStatus>,
}

impl ProviderModelSummary {
    fn new(model: &ProviderModel, catalog: Option<&ModelCatalog>) -> Self {
        ProviderModelSummary {
            id: model.public_id.clone(),
            model_key: model.model_key.clone(),
            display_name: model.display_name.clone(),
            active: model.active,
            catalog_id: catalog.map(|c| c.public_id.clone()),
            catalog_status: catalog.map(|c| c.status),
        }
    }
}

impl From<&SyncedModel> for ProviderModelSummary {
    fn from(synced: &SyncedModel) -> Self {
        ProviderModelSummary::new(&synced.provider_model, synced.catalog.as_ref())
    }
}

/// Models already stored for `provider`, with their catalog rows.
fn stored_models(registry: &ProviderRegistry, provider: &Provider) -> Result<Vec<ProviderModelSummary>, BaseError> {
    let models = registry.list_provider_models(provider)?;
    let catalogs = registry.catalogs_by_id(&models)?;
    Ok(models
        .iter()
        .map(|m| ProviderModelSummary::new(m, m.model_catalog_id.and_then(|id| catalogs.get(&id))))
        .collect())
}

#[derive(Serialize)]
struct ProviderDetail {
    id: String,
    slug: String,
    name: String,
    vendor: String,
    base_url: String,
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<BTreeMap<String, String>>,
    models: Vec<ProviderModelSummary>,
}

impl ProviderDetail {
    fn new(provider: &Provider, models: Vec<ProviderModelSummary>) -> Self {
        ProviderDetail {
            id: provider.public_id.clone(),
            slug: provider.slug.clone(),
            name: provider.name.clone(),
            vendor: provider.kind.to_string(),
            base_url: provider.base_url.clone(),
            active: provider.active,
            metadata: provider.metadata_map(),
            models,
        }
    }
}

async fn register(
    State(app_state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Json(payload): Json<RegisterPayload>,
) -> Result<HttpResult<ProviderDetail>, BaseError> {
    let registry = &app_state.registry;
    let provider = registry
        .register_provider(RegisterProviderInput {
            organization_id: Some(caller.organization_id),
            project_id: payload.project_id,
            name: payload.name,
            vendor: payload.vendor,
            base_url: payload.base_url,
            api_key: payload.api_key,
            metadata: payload.metadata,
            active: payload.active.unwrap_or(true),
        })
        .await?;
    let synced = registry.discover_and_sync(&provider).await?;
    info!(
        "organization {} registered provider {} with {} models",
        caller.organization_id,
        provider.public_id,
        synced.len()
    );
    let models = synced.iter().map(ProviderModelSummary::from).collect();
    Ok(HttpResult::new(ProviderDetail::new(&provider, models)))
}

async fn update(
    State(app_state): State<Arc<AppState>>,
    caller: CallerIdentity,
    Path(id): Path<String>,
    Json(payload): Json<UpdateProviderInput>,
) -> Result<HttpResult<ProviderDetail>, BaseError> {
    let registry = &app_state.registry;
    let provider = registry.find_by_public_id(&id)?;
    if provider.organization_id != Some(caller.organization_id) {
        return Err(BaseError::NotFound(Some("provider not found".to_string())));
    }
    if provider.project_id.is_some() {
        return Err(BaseError::ParamInvalid(Some(
            "only organization providers can be updated here".to_string(),
        )));
    }

    let endpoint_changed = payload.base_url.is_some() || payload.api_key.is_some();
    let updated = registry.update_provider(&provider, payload).await?;
    if endpoint_changed {
        match registry.discover_and_sync(&updated).await {
            Ok(synced) => {
                let models = synced.iter().map(ProviderModelSummary::from).collect();
                return Ok(HttpResult::new(ProviderDetail::new(&updated, models)));
            }
            Err(e) => warn!("re-sync of provider {} after update failed: {}", updated.public_id, e),
        }
    }
    let models = stored_models(registry, &updated)?;
    Ok(HttpResult::new(ProviderDetail::new(&updated, models)))
}

pub fn create_provider_router(app_state: &Arc<AppState>) -> StateRouter {
    create_state_router()
        .route("/organization/models/providers", post(register))
        .route("/organization/models/providers/{id}", patch(update))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), admin_access_middleware))
}
