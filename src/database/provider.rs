use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use std::collections::BTreeMap;

use crate::controller::BaseError;
use crate::database::{DbPool, DbResult, is_unique_violation};
use crate::schema::enum_def::ProviderKind;
use crate::{db_execute, db_object};

db_object! {
    #[derive(Queryable, Selectable, Identifiable, Insertable)]
    #[diesel(table_name = provider)]
    pub struct Provider {
        pub id: i64,
        pub public_id: String,
        pub slug: String,
        pub organization_id: Option<i64>,
        pub project_id: Option<i64>,
        pub name: String,
        pub kind: ProviderKind,
        pub base_url: String,
        pub encrypted_api_key: String,
        pub api_key_hint: Option<String>,
        pub metadata: Option<String>,
        pub active: bool,
        pub is_moderated: bool,
        pub last_synced_at: Option<i64>,
        pub created_at: i64,
        pub updated_at: i64,
    }

    #[derive(AsChangeset, Deserialize, Debug)]
    #[diesel(table_name = provider)]
    pub struct UpdateProviderData {
        pub name: Option<String>,
        pub base_url: Option<String>,
        pub encrypted_api_key: Option<String>,
        pub api_key_hint: Option<Option<String>>,
        pub metadata: Option<Option<String>>,
        pub active: Option<bool>,
    }
}

/// Which slice of the provider table a listing covers.
#[derive(Debug, Clone)]
pub enum ProviderScopeFilter {
    /// Providers owned by the organization that are not bound to any project.
    Organization(i64),
    /// Providers owned by the organization and bound to one of the projects.
    Projects(i64, Vec<i64>),
}

impl Provider {
    pub fn metadata_map(&self) -> Option<BTreeMap<String, String>> {
        self.metadata
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }

    pub fn has_api_key(&self) -> bool {
        !self.encrypted_api_key.is_empty()
    }

    /// Inserts a provider row. Unique index hits surface as `Conflict` so callers can retry.
    pub fn create(pool: &DbPool, new_provider: &Provider) -> DbResult<Provider> {
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let db_provider = diesel::insert_into(provider::table)
                .values(ProviderDb::to_db(new_provider))
                .returning(ProviderDb::as_returning())
                .get_result::<ProviderDb>(conn)
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        BaseError::Conflict(Some(format!("provider '{}' conflicts with an existing provider", new_provider.slug)))
                    } else {
                        BaseError::DatabaseFatal(Some(format!("Failed to insert provider: {}", e)))
                    }
                })?;
            Ok(db_provider.from_db())
        })
    }

    pub fn update(pool: &DbPool, id_value: i64, update_data: &UpdateProviderData) -> DbResult<Provider> {
        let conn = &mut pool.get_connection()?;
        let current_time = Utc::now().timestamp_millis();
        db_execute!(conn, {
            let db_provider = diesel::update(provider::table.find(id_value))
                .set((
                    UpdateProviderDataDb::to_db(update_data),
                    provider::dsl::updated_at.eq(current_time),
                ))
                .returning(ProviderDb::as_returning())
                .get_result::<ProviderDb>(conn)
                .map_err(|e| match e {
                    diesel::result::Error::NotFound => {
                        BaseError::NotFound(Some(format!("Provider with id {} not found", id_value)))
                    }
                    e if is_unique_violation(&e) => BaseError::Conflict(Some(
                        "an active provider of this vendor already exists in this scope".to_string(),
                    )),
                    e => BaseError::DatabaseFatal(Some(format!("Failed to update provider {}: {}", id_value, e))),
                })?;
            Ok(db_provider.from_db())
        })
    }

    pub fn mark_synced(pool: &DbPool, id_value: i64, synced_at: i64) -> DbResult<usize> {
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            diesel::update(provider::table.find(id_value))
                .set((
                    provider::dsl::last_synced_at.eq(Some(synced_at)),
                    provider::dsl::updated_at.eq(synced_at),
                ))
                .execute(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to mark provider {} synced: {}", id_value, e))))
        })
    }

    pub fn get_by_id(pool: &DbPool, target_id_value: i64) -> DbResult<Provider> {
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let db_provider = provider::table
                .filter(provider::dsl::id.eq(target_id_value))
                .select(ProviderDb::as_select())
                .first::<ProviderDb>(conn)
                .map_err(|e| {
                    if matches!(e, diesel::result::Error::NotFound) {
                        BaseError::NotFound(Some(format!("Provider with id {} not found", target_id_value)))
                    } else {
                        BaseError::DatabaseFatal(Some(format!("Error fetching provider {}: {}", target_id_value, e)))
                    }
                })?;
            Ok(db_provider.from_db())
        })
    }

    pub fn find_by_public_id(pool: &DbPool, public_id_val: &str) -> DbResult<Option<Provider>> {
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let db_provider_opt = provider::table
                .filter(provider::dsl::public_id.eq(public_id_val))
                .select(ProviderDb::as_select())
                .first::<ProviderDb>(conn)
                .optional()
                .map_err(|e| {
                    BaseError::DatabaseFatal(Some(format!("Error fetching provider '{}': {}", public_id_val, e)))
                })?;
            Ok(db_provider_opt.map(|db_p| db_p.from_db()))
        })
    }

    pub fn slug_exists(pool: &DbPool, slug_val: &str) -> DbResult<bool> {
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let count = provider::table
                .filter(provider::dsl::slug.eq(slug_val))
                .count()
                .get_result::<i64>(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to check slug '{}': {}", slug_val, e))))?;
            Ok(count > 0)
        })
    }

    /// Counts active providers of `kind_val` in exactly the given (organization, project) scope.
    pub fn count_active_in_scope(
        pool: &DbPool,
        kind_val: ProviderKind,
        organization: Option<i64>,
        project: Option<i64>,
    ) -> DbResult<i64> {
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let mut query = provider::table
                .filter(provider::dsl::kind.eq(kind_val))
                .filter(provider::dsl::active.eq(true))
                .into_boxed();
            query = match organization {
                Some(org) => query.filter(provider::dsl::organization_id.eq(org)),
                None => query.filter(provider::dsl::organization_id.is_null()),
            };
            query = match project {
                Some(p) => query.filter(provider::dsl::project_id.eq(p)),
                None => query.filter(provider::dsl::project_id.is_null()),
            };
            query
                .count()
                .get_result::<i64>(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to count providers: {}", e))))
        })
    }

    /// Lists providers in one scope ordered by creation time.
    pub fn list_by_scope(pool: &DbPool, filter: &ProviderScopeFilter) -> DbResult<Vec<Provider>> {
        let conn = &mut pool.get_connection()?;
        db_execute!(conn, {
            let mut query = provider::table.into_boxed();
            query = match filter {
                ProviderScopeFilter::Organization(org) => query
                    .filter(provider::dsl::organization_id.eq(*org))
                    .filter(provider::dsl::project_id.is_null()),
                ProviderScopeFilter::Projects(org, project_ids) => query
                    .filter(provider::dsl::organization_id.eq(*org))
                    .filter(provider::dsl::project_id.eq_any(project_ids.clone())),
            };
            let db_providers = query
                .order((provider::dsl::created_at.asc(), provider::dsl::id.asc()))
                .select(ProviderDb::as_select())
                .load::<ProviderDb>(conn)
                .map_err(|e| BaseError::DatabaseFatal(Some(format!("Failed to list providers: {}", e))))?;
            Ok(db_providers.into_iter().map(|db_p| db_p.from_db()).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::sqlite_pool;

    fn sample(id: i64, slug: &str, kind: ProviderKind, org: Option<i64>, project: Option<i64>) -> Provider {
        Provider {
            id,
            public_id: format!("prov_{}", id),
            slug: slug.to_string(),
            organization_id: org,
            project_id: project,
            name: slug.to_string(),
            kind,
            base_url: "https://a.example/v1".to_string(),
            active: true,
            created_at: id,
            updated_at: id,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_and_lookup() {
        let (pool, _dir) = sqlite_pool();
        let created = Provider::create(&pool, &sample(1, "openai-main", ProviderKind::Openai, Some(7), None)).unwrap();
        assert_eq!(created.kind, ProviderKind::Openai);

        let found = Provider::find_by_public_id(&pool, "prov_1").unwrap().unwrap();
        assert_eq!(found.slug, "openai-main");
        assert!(Provider::find_by_public_id(&pool, "prov_missing").unwrap().is_none());
        assert!(Provider::slug_exists(&pool, "openai-main").unwrap());
        assert!(matches!(Provider::get_by_id(&pool, 99), Err(BaseError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_slug_is_conflict() {
        let (pool, _dir) = sqlite_pool();
        Provider::create(&pool, &sample(1, "custom-a", ProviderKind::Custom, Some(7), None)).unwrap();
        let err = Provider::create(&pool, &sample(2, "custom-a", ProviderKind::Custom, Some(7), None)).unwrap_err();
        assert!(matches!(err, BaseError::Conflict(_)));
    }

    #[test]
    fn test_kind_scope_index_rejects_second_active_vendor() {
        let (pool, _dir) = sqlite_pool();
        Provider::create(&pool, &sample(1, "openai-a", ProviderKind::Openai, Some(7), None)).unwrap();
        let err = Provider::create(&pool, &sample(2, "openai-b", ProviderKind::Openai, Some(7), None)).unwrap_err();
        assert!(matches!(err, BaseError::Conflict(_)));

        // a project scope is a different scope
        Provider::create(&pool, &sample(3, "openai-c", ProviderKind::Openai, Some(7), Some(70))).unwrap();
        assert_eq!(Provider::count_active_in_scope(&pool, ProviderKind::Openai, Some(7), None).unwrap(), 1);
        assert_eq!(Provider::count_active_in_scope(&pool, ProviderKind::Openai, Some(7), Some(70)).unwrap(), 1);
    }

    #[test]
    fn test_update_applies_only_supplied_fields() {
        let (pool, _dir) = sqlite_pool();
        Provider::create(&pool, &sample(1, "custom-a", ProviderKind::Custom, Some(7), None)).unwrap();
        let updated = Provider::update(
            &pool,
            1,
            &UpdateProviderData { name: Some("Renamed".to_string()), ..Default::default() },
        )
        .unwrap();
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.base_url, "https://a.example/v1");

        let cleared = Provider::update(
            &pool,
            1,
            &UpdateProviderData {
                encrypted_api_key: Some(String::new()),
                api_key_hint: Some(None),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(!cleared.has_api_key());
        assert!(cleared.api_key_hint.is_none());
    }

    #[test]
    fn test_list_by_scope() {
        let (pool, _dir) = sqlite_pool();
        Provider::create(&pool, &sample(1, "org-level", ProviderKind::Custom, Some(7), None)).unwrap();
        Provider::create(&pool, &sample(2, "project-level", ProviderKind::Custom, Some(7), Some(70))).unwrap();
        Provider::create(&pool, &sample(3, "other-project", ProviderKind::Custom, Some(7), Some(71))).unwrap();
        Provider::create(&pool, &sample(4, "other-org", ProviderKind::Custom, Some(8), None)).unwrap();

        let org = Provider::list_by_scope(&pool, &ProviderScopeFilter::Organization(7)).unwrap();
        assert_eq!(org.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1]);

        let projects = Provider::list_by_scope(&pool, &ProviderScopeFilter::Projects(7, vec![70])).unwrap();
        assert_eq!(projects.iter().map(|p| p.id).collect::<Vec<_>>(), vec![2]);
    }
}
