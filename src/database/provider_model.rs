use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;

use crate::controller::BaseError;
use crate::database::{DbPool, DbResult, is_unique_violation};
use crate::service::catalog::{PriceLine, TokenLimits};
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable)]
    #[diesel(table_name = provider_model)]
    pub struct ProviderModel {
        pub id: i64,
        pub public_id: String,
        pub provider_id: i64,
        pub model_catalog_id: Option<i64>,
        pub model_key: String,
        pub display_name: String,
        pub pricing: String,
        pub token_limits: Option<String>,
        pub family: Option<String>,
        pub supports_images: bool,
        pub supports_embeddings: bool,
        pub supports_reasoning: bool,
        pub active: bool,
        pub created_at: i64,
        pub updated_at: i64,
    }

    #[derive(AsChangeset, Deserialize, Debug)]
    #[diesel(table_name = provider_model)]
    pub struct UpdateProviderModelData {
        pub model_catalog_id: Option<Option<i64>>,
        pub display_name: Option<String>,
        pub pricing: Option<String>,
        pub token_limits: Option<Option<String>>,
        pub family: Option<Option<String>>,
        pub supports_images: Option<bool>,
        pub supports_embeddings: Option<bool>,
        pub supports_reasoning: Option<bool>,
        pub active: Option<bool>,
    }
}

impl ProviderModel {
    pub fn pricing(&self) -> Vec<PriceLine> {
        serde_json::from_str(&self.pricing).unwrap_or_default()
    }

    pub fn token_limits(&self) -> Option<TokenLimits> {
        self.token_limits
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub fn create(pool: &DbPool, new_model: &ProviderModel) -> DbResult<ProviderModel> {
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let db_model = diesel::insert_into(provider_model::table)
                .values(ProviderModelDb::to_db(new_model))
                .returning(ProviderModelDb::as_returning())
                .get_result::<ProviderModelDb>(conn)
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        BaseError::Conflict(Some(format!("model '{}' already linked to provider {}", new_model.model_key, new_model.provider_id)))
                    } else {
                        BaseError::DatabaseFatal(Some(format!("Failed to insert provider model: {}", e)))
                    }
                })?;
            Ok(db_model.from_db())
        })
    }

    pub fn update(pool: &DbPool, id_value: i64, update_data: &UpdateProviderModelData) -> DbResult<ProviderModel> {
        let conn = &mut pool.get_connection()?;
        let current_time = Utc::now().timestamp_millis();
        db_execute!(conn, {
            let db_model = diesel::update(provider_model::table.find(id_value))
                .set((
                    UpdateProviderModelDataDb::to_db(update_data),
                    provider_model::dsl::updated_at.eq(current_time),
                ))
                .returning(ProviderModelDb::as_returning())
                .get_result::<ProviderModelDb>(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to update provider model {}: {}", id_value, e))))?;
            Ok(db_model.from_db())
        })
    }

    pub fn find_by_provider_and_key(pool: &DbPool, provider_id_val: i64, key: &str) -> DbResult<Option<ProviderModel>> {
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let db_model = provider_model::table
                .filter(provider_model::dsl::provider_id.eq(provider_id_val))
                .filter(provider_model::dsl::model_key.eq(key))
                .select(ProviderModelDb::as_select())
                .first::<ProviderModelDb>(conn)
                .optional()
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Error fetching provider model '{}': {}", key, e))))?;
            Ok(db_model.map(|m| m.from_db()))
        })
    }

    pub fn list_by_provider(pool: &DbPool, provider_id_val: i64) -> DbResult<Vec<ProviderModel>> {
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let db_models = provider_model::table
                .filter(provider_model::dsl::provider_id.eq(provider_id_val))
                .order(provider_model::dsl::model_key.asc())
                .select(ProviderModelDb::as_select())
                .load::<ProviderModelDb>(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to list models of provider {}: {}", provider_id_val, e))))?;
            Ok(db_models.into_iter().map(|m| m.from_db()).collect())
        })
    }

    /// Active rows of the given providers, optionally narrowed to one model key.
    pub fn list_active(pool: &DbPool, provider_ids: &[i64], key: Option<&str>) -> DbResult<Vec<ProviderModel>> {
        if provider_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let mut query = provider_model::table
                .filter(provider_model::dsl::provider_id.eq_any(provider_ids.to_vec()))
                .filter(provider_model::dsl::active.eq(true))
                .into_boxed();
            if let Some(key) = key {
                query = query.filter(provider_model::dsl::model_key.eq(key.to_string()));
            }
            let db_models = query
                .order(provider_model::dsl::model_key.asc())
                .select(ProviderModelDb::as_select())
                .load::<ProviderModelDb>(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to list active provider models: {}", e))))?;
            Ok(db_models.into_iter().map(|m| m.from_db()).collect())
        })
    }

    /// Mirrors the parent provider's active flag onto all of its model rows.
    pub fn set_active_for_provider(pool: &DbPool, provider_id_val: i64, active_val: bool) -> DbResult<usize> {
        let conn = &mut pool.get_connection()?;
        let current_time = Utc::now().timestamp_millis();
        db_execute!(conn, {
            diesel::update(provider_model::table.filter(provider_model::dsl::provider_id.eq(provider_id_val)))
                .set((
                    provider_model::dsl::active.eq(active_val),
                    provider_model::dsl::updated_at.eq(current_time),
                ))
                .execute(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to toggle models of provider {}: {}", provider_id_val, e))))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::provider::Provider;
    use crate::database::test_support::sqlite_pool;
    use crate::schema::enum_def::ProviderKind;

    fn provider(pool: &DbPool, id: i64) {
        Provider::create(
            pool,
            &Provider {
                id,
                public_id: format!("prov_{}", id),
                slug: format!("custom-{}", id),
                organization_id: Some(1),
                name: format!("p{}", id),
                kind: ProviderKind::Custom,
                base_url: "https://a.example/v1".to_string(),
                active: true,
                ..Default::default()
            },
        )
        .unwrap();
    }

    fn model(id: i64, provider_id: i64, key: &str, active: bool) -> ProviderModel {
        ProviderModel {
            id,
            public_id: format!("pmdl_{}", id),
            provider_id,
            model_key: key.to_string(),
            display_name: key.to_string(),
            pricing: "[]".to_string(),
            active,
            ..Default::default()
        }
    }

    #[test]
    fn test_unique_per_provider_and_key() {
        let (pool, _dir) = sqlite_pool();
        provider(&pool, 1);
        ProviderModel::create(&pool, &model(10, 1, "m1", true)).unwrap();
        let err = ProviderModel::create(&pool, &model(11, 1, "m1", true)).unwrap_err();
        assert!(matches!(err, BaseError::Conflict(_)));
        assert!(ProviderModel::find_by_provider_and_key(&pool, 1, "m1").unwrap().is_some());
        assert!(ProviderModel::find_by_provider_and_key(&pool, 1, "m2").unwrap().is_none());
    }

    #[test]
    fn test_list_active_filters_inactive_and_key() {
        let (pool, _dir) = sqlite_pool();
        provider(&pool, 1);
        provider(&pool, 2);
        ProviderModel::create(&pool, &model(10, 1, "shared", true)).unwrap();
        ProviderModel::create(&pool, &model(11, 2, "shared", false)).unwrap();
        ProviderModel::create(&pool, &model(12, 2, "other", true)).unwrap();

        let shared = ProviderModel::list_active(&pool, &[1, 2], Some("shared")).unwrap();
        assert_eq!(shared.iter().map(|m| m.id).collect::<Vec<_>>(), vec![10]);
        assert_eq!(ProviderModel::list_active(&pool, &[2], None).unwrap().len(), 1);
        assert!(ProviderModel::list_active(&pool, &[], None).unwrap().is_empty());

        ProviderModel::set_active_for_provider(&pool, 1, false).unwrap();
        assert!(ProviderModel::list_active(&pool, &[1], None).unwrap().is_empty());
    }
}
