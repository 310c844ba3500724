#![allow(clippy::module_name_repetitions)]
use uuid::Uuid;

use crate::{error::AppError, retrieval::RetrieverEngineChoice, storage::db::SurrealDbClient, stored_object};

stored_object!(Tenant, "tenant", {
    name: String,
    api_key: String,
    retriever_engines: Vec<RetrieverEngineChoice>,
    storage_quota: i64,
    storage_used: i64
});

impl Tenant {
    pub fn new(
        id: u32,
        name: String,
        retriever_engines: Vec<RetrieverEngineChoice>,
        storage_quota: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            created_at: now,
            updated_at: now,
            name,
            api_key: mint_api_key(),
            retriever_engines,
            storage_quota,
            storage_used: 0,
        }
    }

    /// Tenant ids are small integers; the next id is max(existing) + 1.
    pub async fn next_id(db: &SurrealDbClient) -> Result<u32, AppError> {
        let tenants: Vec<Tenant> = db.get_all_stored_items().await?;
        let max = tenants
            .iter()
            .filter_map(|tenant| tenant.id.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        Ok(max.saturating_add(1))
    }

    pub async fn find_by_api_key(
        api_key: &str,
        db: &SurrealDbClient,
    ) -> Result<Option<Tenant>, AppError> {
        let mut response = db
            .query("SELECT * FROM tenant WHERE api_key = $api_key LIMIT 1")
            .bind(("api_key", api_key.to_owned()))
            .await?;
        let tenants: Vec<Tenant> = response.take(0)?;
        Ok(tenants.into_iter().next())
    }

    /// The api-key rotates whenever the tenant record is updated.
    pub fn rotate_api_key(&mut self) {
        self.api_key = mint_api_key();
        self.updated_at = Utc::now();
    }

    /// Adjust the storage counter through a single-record atomic update so
    /// concurrent uploads and deletes cannot lose increments.
    pub async fn adjust_storage_used(
        id: &str,
        delta: i64,
        db: &SurrealDbClient,
    ) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('tenant', $id) SET \
             storage_used = math::max([0, storage_used + $delta]), \
             updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .bind(("delta", delta))
        .await?
        .check()?;
        Ok(())
    }
}

fn mint_api_key() -> String {
    format!("sk-{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::RetrieverType;

    fn engine_choices() -> Vec<RetrieverEngineChoice> {
        vec![
            RetrieverEngineChoice {
                retriever_type: RetrieverType::Vector,
                engine_type: "surreal_vector".to_string(),
            },
            RetrieverEngineChoice {
                retriever_type: RetrieverType::Keyword,
                engine_type: "surreal_keyword".to_string(),
            },
        ]
    }

    #[tokio::test]
    async fn test_next_id_counts_up_from_existing_tenants() {
        let db = SurrealDbClient::memory("tenant_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        assert_eq!(Tenant::next_id(&db).await.expect("next id"), 1);

        let tenant = Tenant::new(1, "first".to_string(), engine_choices(), 1_000_000);
        db.store_item(tenant).await.expect("store tenant");

        assert_eq!(Tenant::next_id(&db).await.expect("next id"), 2);
    }

    #[tokio::test]
    async fn test_find_by_api_key() {
        let db = SurrealDbClient::memory("tenant_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let tenant = Tenant::new(7, "acme".to_string(), engine_choices(), 0);
        let api_key = tenant.api_key.clone();
        db.store_item(tenant.clone()).await.expect("store tenant");

        let found = Tenant::find_by_api_key(&api_key, &db)
            .await
            .expect("lookup")
            .expect("tenant should be found");
        assert_eq!(found.id, tenant.id);

        let missing = Tenant::find_by_api_key("sk-unknown", &db)
            .await
            .expect("lookup");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_rotate_api_key_changes_key() {
        let mut tenant = Tenant::new(1, "acme".to_string(), engine_choices(), 0);
        let before = tenant.api_key.clone();
        tenant.rotate_api_key();
        assert_ne!(tenant.api_key, before);
    }

    #[tokio::test]
    async fn test_adjust_storage_used_is_clamped_at_zero() {
        let db = SurrealDbClient::memory("tenant_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let tenant = Tenant::new(3, "acme".to_string(), engine_choices(), 1_000);
        db.store_item(tenant.clone()).await.expect("store tenant");

        Tenant::adjust_storage_used(&tenant.id, 400, &db)
            .await
            .expect("increase");
        Tenant::adjust_storage_used(&tenant.id, -700, &db)
            .await
            .expect("decrease past zero");

        let reloaded: Tenant = db
            .get_item(&tenant.id)
            .await
            .expect("fetch")
            .expect("tenant exists");
        assert_eq!(reloaded.storage_used, 0);
    }
}
