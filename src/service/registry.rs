use chrono::Utc;
use cyder_tools::log::{debug, info, warn};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::controller::BaseError;
use crate::database::DbPool;
use crate::database::model_catalog::{ModelCatalog, UpdateModelCatalogData};
use crate::database::provider::{Provider, ProviderScopeFilter, UpdateProviderData};
use crate::database::provider_model::{ProviderModel, UpdateProviderModelData};
use crate::schema::enum_def::ProviderKind;
use crate::service::catalog::{CatalogDraft, DiscoveredModel, ProviderModelDraft};
use crate::service::chat_client::{ChatClient, ClientOptions};
use crate::service::crypto::{CredentialCodec, key_hint};
use crate::utils::{ID_GENERATOR, generate_public_id, slugify};

pub const DEFAULT_PROVIDER_PUBLIC_ID: &str = "prov_platform_default";
const PROVIDER_ID_PREFIX: &str = "prov";
const PROVIDER_MODEL_ID_PREFIX: &str = "pmdl";
const SLUG_ATTEMPTS: usize = 64;

/// The platform-wide organization and the built-in provider used when resolution fails.
///
/// Built once at startup and shared; the default provider is never stored.
#[derive(Debug, Clone)]
pub struct DefaultScope {
    pub organization_id: i64,
    pub default_provider: Provider,
    api_key: Option<String>,
}

impl DefaultScope {
    pub fn new(organization_id: i64, inference_url: &str, api_key: Option<String>) -> Self {
        let default_provider = Provider {
            public_id: DEFAULT_PROVIDER_PUBLIC_ID.to_string(),
            slug: "platform".to_string(),
            organization_id: Some(organization_id),
            name: "Platform".to_string(),
            kind: ProviderKind::Platform,
            base_url: inference_url.trim().trim_end_matches('/').to_string(),
            active: true,
            ..Default::default()
        };
        DefaultScope {
            organization_id,
            default_provider,
            api_key: api_key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty()),
        }
    }

    pub fn is_default(&self, provider: &Provider) -> bool {
        provider.id == self.default_provider.id && provider.public_id == DEFAULT_PROVIDER_PUBLIC_ID
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterProviderInput {
    #[serde(default)]
    pub organization_id: Option<i64>,
    #[serde(default)]
    pub project_id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Default for RegisterProviderInput {
    fn default() -> Self {
        RegisterProviderInput {
            organization_id: None,
            project_id: None,
            name: String::new(),
            vendor: String::new(),
            base_url: String::new(),
            api_key: None,
            metadata: None,
            active: true,
        }
    }
}

/// Partial provider patch. `api_key: Some("")` clears the stored key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProviderInput {
    pub name: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub metadata: Option<BTreeMap<String, String>>,
    pub active: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct SyncedModel {
    pub provider_model: ProviderModel,
    pub catalog: Option<ModelCatalog>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderScope {
    Project,
    Organization,
    Platform,
}

/// Outcome of a resolution that may have fallen back to the default provider.
#[derive(Debug)]
pub struct Resolution {
    pub provider: Provider,
    /// Why resolution fell back; `None` when a registered provider serves the model.
    pub fallback_reason: Option<BaseError>,
}

impl Resolution {
    #[cfg(test)]
    pub fn used_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

type ScopeKey = (ProviderKind, i64, Option<i64>);

#[derive(Clone)]
pub struct ProviderRegistry {
    pool: DbPool,
    codec: CredentialCodec,
    default_scope: Arc<DefaultScope>,
    client_options: ClientOptions,
    scope_locks: Arc<DashMap<ScopeKey, Arc<Mutex<()>>>>,
}

/// Trims, checks for an absolute http(s) URL and strips trailing slashes.
pub fn normalize_base_url(raw: &str) -> Result<String, BaseError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BaseError::ParamInvalid(Some("base_url is required".to_string())));
    }
    let parsed = reqwest::Url::parse(trimmed)
        .map_err(|e| BaseError::ParamInvalid(Some(format!("base_url '{}' is invalid: {}", trimmed, e))))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(BaseError::ParamInvalid(Some(format!(
            "base_url '{}' must be an absolute http(s) url",
            trimmed
        ))));
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

fn sanitize_metadata(metadata: Option<BTreeMap<String, String>>) -> Result<Option<String>, BaseError> {
    let cleaned: BTreeMap<String, String> = metadata
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| {
            let key = k.trim();
            (!key.is_empty()).then(|| (key.to_string(), v.trim().to_string()))
        })
        .collect();
    if cleaned.is_empty() {
        return Ok(None);
    }
    to_json(&cleaned).map(Some)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, BaseError> {
    serde_json::to_string(value)
        .map_err(|e| BaseError::InternalServerError(Some(format!("failed to serialize column: {}", e))))
}

fn append_unique(result: &mut Vec<Provider>, seen: &mut HashSet<i64>, items: Vec<Provider>) {
    for provider in items {
        if seen.insert(provider.id) {
            result.push(provider);
        }
    }
}

impl ProviderRegistry {
    pub fn new(pool: DbPool, codec: CredentialCodec, default_scope: Arc<DefaultScope>, client_options: ClientOptions) -> Self {
        ProviderRegistry {
            pool,
            codec,
            default_scope,
            client_options,
            scope_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn default_scope(&self) -> &DefaultScope {
        &self.default_scope
    }

    pub fn scope_of(&self, provider: &Provider) -> ProviderScope {
        if self.default_scope.is_default(provider) {
            ProviderScope::Platform
        } else if provider.project_id.is_some() {
            ProviderScope::Project
        } else if provider.organization_id == Some(self.default_scope.organization_id) {
            ProviderScope::Platform
        } else {
            ProviderScope::Organization
        }
    }

    fn scope_lock(&self, key: ScopeKey) -> Arc<Mutex<()>> {
        self.scope_locks.entry(key).or_default().clone()
    }

    fn ensure_kind_free(&self, kind: ProviderKind, organization_id: i64, project_id: Option<i64>) -> Result<(), BaseError> {
        let existing = Provider::count_active_in_scope(&self.pool, kind, Some(organization_id), project_id)?;
        if existing > 0 {
            return Err(BaseError::Conflict(Some(format!(
                "an active '{}' provider already exists in this scope",
                kind
            ))));
        }
        Ok(())
    }

    fn seal_api_key(&self, api_key: Option<&str>) -> Result<(String, Option<String>), BaseError> {
        match api_key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => Ok((self.codec.encrypt(key)?, key_hint(key))),
            None => Ok((String::new(), None)),
        }
    }

    fn next_free_slug(&self, base: &str, suffix: &mut usize) -> Result<String, BaseError> {
        loop {
            let candidate = if *suffix <= 1 {
                base.to_string()
            } else {
                format!("{}-{}", base, suffix)
            };
            if !Provider::slug_exists(&self.pool, &candidate)? {
                return Ok(candidate);
            }
            *suffix += 1;
        }
    }

    pub async fn register_provider(&self, input: RegisterProviderInput) -> Result<Provider, BaseError> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(BaseError::ParamInvalid(Some("provider name is required".to_string())));
        }
        let base_url = normalize_base_url(&input.base_url)?;
        let kind = ProviderKind::from_vendor(&input.vendor);
        let organization_id = input.organization_id.unwrap_or(self.default_scope.organization_id);
        let project_id = input.project_id;
        let (encrypted_api_key, api_key_hint) = self.seal_api_key(input.api_key.as_deref())?;
        let metadata = sanitize_metadata(input.metadata)?;

        let enforce_unique = kind.is_unique_per_scope() && input.active;
        let scope_lock = enforce_unique.then(|| self.scope_lock((kind, organization_id, project_id)));
        let _scope_guard = match &scope_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        if enforce_unique {
            self.ensure_kind_free(kind, organization_id, project_id)?;
        }

        let base_slug = match slugify(&format!("{}-{}", kind, name)) {
            slug if slug.is_empty() => "provider".to_string(),
            slug => slug,
        };
        let mut suffix = 1;
        for _ in 0..SLUG_ATTEMPTS {
            let now = Utc::now().timestamp_millis();
            let candidate = Provider {
                id: ID_GENERATOR.generate_id(),
                public_id: generate_public_id(PROVIDER_ID_PREFIX, 24),
                slug: self.next_free_slug(&base_slug, &mut suffix)?,
                organization_id: Some(organization_id),
                project_id,
                name: name.clone(),
                kind,
                base_url: base_url.clone(),
                encrypted_api_key: encrypted_api_key.clone(),
                api_key_hint: api_key_hint.clone(),
                metadata: metadata.clone(),
                active: input.active,
                is_moderated: false,
                last_synced_at: None,
                created_at: now,
                updated_at: now,
            };
            match Provider::create(&self.pool, &candidate) {
                Ok(provider) => {
                    info!(
                        "registered provider {} ({}, kind {}) for organization {}",
                        provider.public_id, provider.slug, provider.kind, organization_id
                    );
                    return Ok(provider);
                }
                Err(BaseError::Conflict(_)) => {
                    if enforce_unique {
                        self.ensure_kind_free(kind, organization_id, project_id)?;
                    }
                    debug!("slug '{}' was taken concurrently, trying the next one", candidate.slug);
                    suffix += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Err(BaseError::Conflict(Some(format!(
            "could not allocate a unique slug for '{}'",
            base_slug
        ))))
    }

    /// Upserts catalog and provider-model rows for every discovered model.
    ///
    /// A missing model key aborts the batch. Any other per-model failure is logged and
    /// skipped; rows already written stay written.
    pub async fn sync_provider_models(
        &self,
        provider: &Provider,
        discovered: &[DiscoveredModel],
    ) -> Result<Vec<SyncedModel>, BaseError> {
        let mut results = Vec::with_capacity(discovered.len());
        for model in discovered {
            if model.id.trim().is_empty() {
                return Err(BaseError::ParamInvalid(Some("model identifier missing".to_string())));
            }
            let catalog = match self.upsert_catalog(provider.kind, model) {
                Ok(catalog) => Some(catalog),
                Err(e) => {
                    warn!("catalog sync of '{}' failed, linking without catalog: {}", model.id, e);
                    None
                }
            };
            match self.upsert_provider_model(provider, catalog.as_ref(), model) {
                Ok(provider_model) => results.push(SyncedModel { provider_model, catalog }),
                Err(e) => warn!("sync of model '{}' on provider {} failed: {}", model.id, provider.public_id, e),
            }
        }
        Provider::mark_synced(&self.pool, provider.id, Utc::now().timestamp_millis())?;
        info!(
            "synced {}/{} models for provider {}",
            results.len(),
            discovered.len(),
            provider.public_id
        );
        Ok(results)
    }

    fn catalog_patch(draft: &CatalogDraft) -> Result<UpdateModelCatalogData, BaseError> {
        Ok(UpdateModelCatalogData {
            supported_parameters: Some(to_json(&draft.supported_parameters)?),
            architecture: Some(to_json(&draft.architecture)?),
            notes: Some(draft.notes.clone()),
            is_moderated: Some(draft.is_moderated),
            extras: Some(if draft.extras.is_empty() { None } else { Some(to_json(&draft.extras)?) }),
            status: Some(draft.status),
        })
    }

    fn upsert_catalog(&self, kind: ProviderKind, model: &DiscoveredModel) -> Result<ModelCatalog, BaseError> {
        let draft = model.catalog_draft(kind);
        if let Some(existing) = ModelCatalog::find_by_public_id(&self.pool, &draft.public_id)? {
            return self.refresh_catalog(existing, &draft);
        }

        let patch = Self::catalog_patch(&draft)?;
        let now = Utc::now().timestamp_millis();
        let row = ModelCatalog {
            id: ID_GENERATOR.generate_id(),
            public_id: draft.public_id.clone(),
            supported_parameters: patch.supported_parameters.clone().unwrap_or_default(),
            architecture: patch.architecture.clone().unwrap_or_default(),
            notes: draft.notes.clone(),
            is_moderated: draft.is_moderated,
            extras: patch.extras.clone().flatten(),
            status: draft.status,
            last_synced_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        match ModelCatalog::create(&self.pool, &row) {
            Ok(catalog) => Ok(catalog),
            Err(BaseError::Conflict(_)) => {
                let existing = ModelCatalog::find_by_public_id(&self.pool, &draft.public_id)?.ok_or_else(|| {
                    BaseError::NotFound(Some(format!("catalog entry '{}' vanished", draft.public_id)))
                })?;
                self.refresh_catalog(existing, &draft)
            }
            Err(e) => Err(e),
        }
    }

    /// Enriched rows are returned untouched; `init` rows take the fresh draft.
    fn refresh_catalog(&self, existing: ModelCatalog, draft: &CatalogDraft) -> Result<ModelCatalog, BaseError> {
        if existing.status.is_enriched() {
            return Ok(existing);
        }
        match ModelCatalog::update_if_init(&self.pool, existing.id, &Self::catalog_patch(draft)?)? {
            Some(updated) => Ok(updated),
            None => Ok(ModelCatalog::find_by_public_id(&self.pool, &existing.public_id)?.unwrap_or(existing)),
        }
    }

    fn provider_model_patch(
        provider: &Provider,
        catalog: Option<&ModelCatalog>,
        draft: &ProviderModelDraft,
    ) -> Result<UpdateProviderModelData, BaseError> {
        Ok(UpdateProviderModelData {
            model_catalog_id: Some(catalog.map(|c| c.id)),
            display_name: Some(draft.display_name.clone()),
            pricing: Some(to_json(&draft.pricing)?),
            token_limits: Some(draft.token_limits.as_ref().map(to_json).transpose()?),
            family: Some(draft.family.clone()),
            supports_images: Some(draft.supports_images),
            supports_embeddings: Some(draft.supports_embeddings),
            supports_reasoning: Some(draft.supports_reasoning),
            active: Some(provider.active),
        })
    }

    fn upsert_provider_model(
        &self,
        provider: &Provider,
        catalog: Option<&ModelCatalog>,
        model: &DiscoveredModel,
    ) -> Result<ProviderModel, BaseError> {
        let draft = model.provider_model_draft();
        let patch = Self::provider_model_patch(provider, catalog, &draft)?;
        if let Some(existing) = ProviderModel::find_by_provider_and_key(&self.pool, provider.id, &draft.model_key)? {
            return ProviderModel::update(&self.pool, existing.id, &patch);
        }

        let now = Utc::now().timestamp_millis();
        let row = ProviderModel {
            id: ID_GENERATOR.generate_id(),
            public_id: generate_public_id(PROVIDER_MODEL_ID_PREFIX, 32),
            provider_id: provider.id,
            model_catalog_id: catalog.map(|c| c.id),
            model_key: draft.model_key.clone(),
            display_name: draft.display_name.clone(),
            pricing: patch.pricing.clone().unwrap_or_else(|| "[]".to_string()),
            token_limits: patch.token_limits.clone().flatten(),
            family: draft.family.clone(),
            supports_images: draft.supports_images,
            supports_embeddings: draft.supports_embeddings,
            supports_reasoning: draft.supports_reasoning,
            active: provider.active,
            created_at: now,
            updated_at: now,
        };
        match ProviderModel::create(&self.pool, &row) {
            Ok(created) => Ok(created),
            Err(BaseError::Conflict(_)) => {
                let existing = ProviderModel::find_by_provider_and_key(&self.pool, provider.id, &draft.model_key)?
                    .ok_or_else(|| BaseError::NotFound(Some(format!("provider model '{}' vanished", draft.model_key))))?;
                ProviderModel::update(&self.pool, existing.id, &patch)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn update_provider(&self, provider: &Provider, patch: UpdateProviderInput) -> Result<Provider, BaseError> {
        let mut data = UpdateProviderData::default();
        if let Some(name) = patch.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(BaseError::ParamInvalid(Some("provider name is required".to_string())));
            }
            data.name = Some(name.to_string());
        }
        if let Some(base_url) = patch.base_url {
            data.base_url = Some(normalize_base_url(&base_url)?);
        }
        if let Some(api_key) = patch.api_key {
            let (encrypted, hint) = self.seal_api_key(Some(&api_key))?;
            data.encrypted_api_key = Some(encrypted);
            data.api_key_hint = Some(hint);
        }
        if let Some(metadata) = patch.metadata {
            data.metadata = Some(sanitize_metadata(Some(metadata))?);
        }
        data.active = patch.active;

        let organization_id = provider.organization_id.unwrap_or(self.default_scope.organization_id);
        let activating = patch.active == Some(true) && !provider.active && provider.kind.is_unique_per_scope();
        let scope_lock = activating.then(|| self.scope_lock((provider.kind, organization_id, provider.project_id)));
        let _scope_guard = match &scope_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };
        if activating {
            self.ensure_kind_free(provider.kind, organization_id, provider.project_id)?;
        }

        let updated = Provider::update(&self.pool, provider.id, &data)?;
        if updated.active != provider.active {
            ProviderModel::set_active_for_provider(&self.pool, updated.id, updated.active)?;
        }
        info!("updated provider {}", updated.public_id);
        Ok(updated)
    }

    /// Providers visible to the caller: project-scoped first, then the organization's own,
    /// then those of the platform organization. Each provider appears once.
    pub fn list_accessible_providers(&self, organization_id: i64, project_ids: &[i64]) -> Result<Vec<Provider>, BaseError> {
        let mut result = Vec::new();
        let mut seen = HashSet::new();
        if !project_ids.is_empty() {
            let items = Provider::list_by_scope(
                &self.pool,
                &ProviderScopeFilter::Projects(organization_id, project_ids.to_vec()),
            )?;
            append_unique(&mut result, &mut seen, items);
        }
        let items = Provider::list_by_scope(&self.pool, &ProviderScopeFilter::Organization(organization_id))?;
        append_unique(&mut result, &mut seen, items);
        if organization_id != self.default_scope.organization_id {
            let items = Provider::list_by_scope(
                &self.pool,
                &ProviderScopeFilter::Organization(self.default_scope.organization_id),
            )?;
            append_unique(&mut result, &mut seen, items);
        }
        Ok(result)
    }

    /// Highest-priority accessible provider with an active row for `model_key`.
    pub fn get_provider_for_model(
        &self,
        model_key: &str,
        organization_id: i64,
        project_ids: &[i64],
    ) -> Result<Provider, BaseError> {
        let model_key = model_key.trim();
        if model_key.is_empty() {
            return Err(BaseError::ParamInvalid(Some("model key is required".to_string())));
        }
        let providers = self.list_accessible_providers(organization_id, project_ids)?;
        if providers.is_empty() {
            return Err(BaseError::NotFound(Some("no accessible providers found".to_string())));
        }

        let ids: Vec<i64> = providers.iter().map(|p| p.id).collect();
        let serving: HashSet<i64> = ProviderModel::list_active(&self.pool, &ids, Some(model_key))?
            .into_iter()
            .map(|pm| pm.provider_id)
            .collect();
        providers
            .into_iter()
            .find(|p| p.active && serving.contains(&p.id))
            .ok_or_else(|| {
                BaseError::ModelNotFound(Some(format!("model '{}' not found in accessible providers", model_key)))
            })
    }

    pub fn get_provider_for_model_or_default(
        &self,
        model_key: &str,
        organization_id: i64,
        project_ids: &[i64],
    ) -> Resolution {
        match self.get_provider_for_model(model_key, organization_id, project_ids) {
            Ok(provider) => Resolution { provider, fallback_reason: None },
            Err(reason) => Resolution {
                provider: self.default_scope.default_provider.clone(),
                fallback_reason: Some(reason),
            },
        }
    }

    pub fn find_by_public_id(&self, public_id: &str) -> Result<Provider, BaseError> {
        Provider::find_by_public_id(&self.pool, public_id.trim())?
            .ok_or_else(|| BaseError::NotFound(Some("provider not found".to_string())))
    }

    pub fn list_provider_models(&self, provider: &Provider) -> Result<Vec<ProviderModel>, BaseError> {
        ProviderModel::list_by_provider(&self.pool, provider.id)
    }

    pub fn list_active_provider_models(&self, provider_ids: &[i64]) -> Result<Vec<ProviderModel>, BaseError> {
        ProviderModel::list_active(&self.pool, provider_ids, None)
    }

    pub fn catalogs_by_id(&self, models: &[ProviderModel]) -> Result<HashMap<i64, ModelCatalog>, BaseError> {
        let ids: Vec<i64> = models.iter().filter_map(|m| m.model_catalog_id).collect();
        Ok(ModelCatalog::list_by_ids(&self.pool, &ids)?
            .into_iter()
            .map(|c| (c.id, c))
            .collect())
    }

    /// Plaintext key for calling the provider's backend.
    pub fn api_key_for(&self, provider: &Provider) -> Result<Option<String>, BaseError> {
        if self.default_scope.is_default(provider) {
            return Ok(self.default_scope.api_key.clone());
        }
        if !provider.has_api_key() {
            return Ok(None);
        }
        self.codec.decrypt(&provider.encrypted_api_key).map(Some)
    }

    pub fn client_for(&self, provider: &Provider) -> Result<ChatClient, BaseError> {
        let api_key = self.api_key_for(provider)?;
        ChatClient::new(&provider.base_url, api_key.as_deref(), &self.client_options)
    }

    /// Live discovery against the provider's backend followed by a sync.
    pub async fn discover_and_sync(&self, provider: &Provider) -> Result<Vec<SyncedModel>, BaseError> {
        let raw = self.client_for(provider)?.list_models().await?;
        let discovered = DiscoveredModel::decode_batch(&raw)?;
        self.sync_provider_models(provider, &discovered).await
    }
}
