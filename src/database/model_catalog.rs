use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::controller::BaseError;
use crate::database::{DbPool, DbResult, is_unique_violation};
use crate::schema::enum_def::CatalogStatus;
use crate::service::catalog::{Architecture, SupportedParameters};
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable)]
    #[diesel(table_name = model_catalog)]
    pub struct ModelCatalog {
        pub id: i64,
        pub public_id: String,
        pub supported_parameters: String,
        pub architecture: String,
        pub notes: Option<String>,
        pub is_moderated: bool,
        pub extras: Option<String>,
        pub status: CatalogStatus,
        pub last_synced_at: Option<i64>,
        pub created_at: i64,
        pub updated_at: i64,
    }

    #[derive(AsChangeset, Deserialize, Debug)]
    #[diesel(table_name = model_catalog)]
    pub struct UpdateModelCatalogData {
        pub supported_parameters: Option<String>,
        pub architecture: Option<String>,
        pub notes: Option<Option<String>>,
        pub is_moderated: Option<bool>,
        pub extras: Option<Option<String>>,
        pub status: Option<CatalogStatus>,
    }
}

impl ModelCatalog {
    pub fn architecture(&self) -> Architecture {
        serde_json::from_str(&self.architecture).unwrap_or_default()
    }

    pub fn supported_parameters(&self) -> SupportedParameters {
        serde_json::from_str(&self.supported_parameters).unwrap_or_default()
    }

    pub fn extras(&self) -> Map<String, Value> {
        self.extras
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }

    pub fn create(pool: &DbPool, new_catalog: &ModelCatalog) -> DbResult<ModelCatalog> {
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let db_catalog = diesel::insert_into(model_catalog::table)
                .values(ModelCatalogDb::to_db(new_catalog))
                .returning(ModelCatalogDb::as_returning())
                .get_result::<ModelCatalogDb>(conn)
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        BaseError::Conflict(Some(format!("catalog entry '{}' already exists", new_catalog.public_id)))
                    } else {
                        BaseError::DatabaseFatal(Some(format!("Failed to insert model catalog: {}", e)))
                    }
                })?;
            Ok(db_catalog.from_db())
        })
    }

    /// Applies `update_data` only while the row is still `init`, stamping `last_synced_at`.
    ///
    /// Returns `None` when the row has already been enriched, in which case nothing is written.
    pub fn update_if_init(
        pool: &DbPool,
        id_value: i64,
        update_data: &UpdateModelCatalogData,
    ) -> DbResult<Option<ModelCatalog>> {
        let conn = &mut pool.get_connection()?;
        let current_time = Utc::now().timestamp_millis();
        db_execute!(conn, {
            let db_catalog = diesel::update(
                model_catalog::table
                    .filter(model_catalog::dsl::id.eq(id_value))
                    .filter(model_catalog::dsl::status.eq(CatalogStatus::Init)),
            )
            .set((
                UpdateModelCatalogDataDb::to_db(update_data),
                model_catalog::dsl::last_synced_at.eq(Some(current_time)),
                model_catalog::dsl::updated_at.eq(current_time),
            ))
            .returning(ModelCatalogDb::as_returning())
            .get_result::<ModelCatalogDb>(conn)
            .optional()
            .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to update model catalog {}: {}", id_value, e))))?;
            Ok(db_catalog.map(|c| c.from_db()))
        })
    }

    pub fn find_by_public_id(pool: &DbPool, public_id_val: &str) -> DbResult<Option<ModelCatalog>> {
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let db_catalog = model_catalog::table
                .filter(model_catalog::dsl::public_id.eq(public_id_val))
                .select(ModelCatalogDb::as_select())
                .first::<ModelCatalogDb>(conn)
                .optional()
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Error fetching model catalog '{}': {}", public_id_val, e))))?;
            Ok(db_catalog.map(|c| c.from_db()))
        })
    }

    pub fn list_by_ids(pool: &DbPool, ids: &[i64]) -> DbResult<Vec<ModelCatalog>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let db_catalogs = model_catalog::table
                .filter(model_catalog::dsl::id.eq_any(ids.to_vec()))
                .select(ModelCatalogDb::as_select())
                .load::<ModelCatalogDb>(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to list model catalogs: {}", e))))?;
            Ok(db_catalogs.into_iter().map(|c| c.from_db()).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::sqlite_pool;

    fn sample(id: i64, public_id: &str, status: CatalogStatus) -> ModelCatalog {
        ModelCatalog {
            id,
            public_id: public_id.to_string(),
            supported_parameters: "{}".to_string(),
            architecture: "{}".to_string(),
            status,
            created_at: 1,
            updated_at: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_update_only_touches_init_rows() {
        let (pool, _dir) = sqlite_pool();
        ModelCatalog::create(&pool, &sample(1, "gpt-4o", CatalogStatus::Init)).unwrap();
        ModelCatalog::create(&pool, &sample(2, "claude", CatalogStatus::Filled)).unwrap();

        let patch = UpdateModelCatalogData {
            notes: Some(Some("refreshed".to_string())),
            ..Default::default()
        };
        let updated = ModelCatalog::update_if_init(&pool, 1, &patch).unwrap().unwrap();
        assert_eq!(updated.notes.as_deref(), Some("refreshed"));
        assert!(updated.last_synced_at.is_some_and(|at| at > 1));

        assert!(ModelCatalog::update_if_init(&pool, 2, &patch).unwrap().is_none());
        let untouched = ModelCatalog::find_by_public_id(&pool, "claude").unwrap().unwrap();
        assert!(untouched.notes.is_none());
        assert!(untouched.last_synced_at.is_none());
        assert_eq!(untouched.status, CatalogStatus::Filled);
    }

    #[test]
    fn test_duplicate_public_id_is_conflict() {
        let (pool, _dir) = sqlite_pool();
        ModelCatalog::create(&pool, &sample(1, "gpt-4o", CatalogStatus::Init)).unwrap();
        let err = ModelCatalog::create(&pool, &sample(2, "gpt-4o", CatalogStatus::Init)).unwrap_err();
        assert!(matches!(err, BaseError::Conflict(_)));
        assert_eq!(ModelCatalog::list_by_ids(&pool, &[1, 2]).unwrap().len(), 1);
    }
}
