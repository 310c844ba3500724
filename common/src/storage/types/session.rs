#![allow(clippy::module_name_repetitions)]
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// What to answer with when retrieval yields nothing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    Fixed,
    Model,
}

stored_object!(Session, "session", {
    tenant_id: String,
    kb_id: String,
    title: Option<String>,
    chat_model_id: String,
    summary_model_id: Option<String>,
    embedding_top_k: usize,
    keyword_threshold: f32,
    vector_threshold: f32,
    rerank_top_k: usize,
    rerank_threshold: f32,
    enable_rewrite: bool,
    enable_neighbor_expansion: bool,
    fallback_strategy: FallbackStrategy,
    fallback_response: String,
    context_template: Option<String>,
    max_rounds: usize
});

impl Session {
    pub fn new(tenant_id: String, kb_id: String, chat_model_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            kb_id,
            title: None,
            chat_model_id,
            summary_model_id: None,
            embedding_top_k: 10,
            keyword_threshold: 0.0,
            vector_threshold: 0.5,
            rerank_top_k: 5,
            rerank_threshold: 0.5,
            enable_rewrite: true,
            enable_neighbor_expansion: false,
            fallback_strategy: FallbackStrategy::Fixed,
            fallback_response: "I don't know.".to_string(),
            context_template: None,
            max_rounds: 5,
        }
    }

    pub async fn list_by_tenant(
        tenant_id: &str,
        db: &SurrealDbClient,
    ) -> Result<Vec<Session>, AppError> {
        let mut response = db
            .query("SELECT * FROM session WHERE tenant_id = $tenant_id ORDER BY created_at DESC")
            .bind(("tenant_id", tenant_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    pub async fn set_title(id: &str, title: &str, db: &SurrealDbClient) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('session', $id) SET title = $title, updated_at = time::now()",
        )
        .bind(("id", id.to_owned()))
        .bind(("title", title.to_owned()))
        .await?
        .check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_defaults() {
        let session = Session::new("1".to_string(), "kb-a".to_string(), "model-a".to_string());
        assert_eq!(session.max_rounds, 5);
        assert_eq!(session.fallback_strategy, FallbackStrategy::Fixed);
        assert!(session.enable_rewrite);
        assert!(!session.enable_neighbor_expansion);
    }

    #[tokio::test]
    async fn test_list_by_tenant_newest_first() {
        let db = SurrealDbClient::memory("session_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let mut older = Session::new("1".to_string(), "kb-a".to_string(), "m".to_string());
        older.created_at = Utc::now() - chrono::Duration::seconds(10);
        let newer = Session::new("1".to_string(), "kb-a".to_string(), "m".to_string());
        let foreign = Session::new("2".to_string(), "kb-b".to_string(), "m".to_string());

        db.store_item(older.clone()).await.expect("store older");
        db.store_item(newer.clone()).await.expect("store newer");
        db.store_item(foreign).await.expect("store foreign");

        let listed = Session::list_by_tenant("1", &db).await.expect("list");
        let ids: Vec<&str> = listed.iter().map(|session| session.id.as_str()).collect();
        assert_eq!(ids, vec![newer.id.as_str(), older.id.as_str()]);
    }

    #[tokio::test]
    async fn test_set_title() {
        let db = SurrealDbClient::memory("session_ns", &Uuid::new_v4().to_string())
            .await
            .expect("Failed to start in-memory surrealdb");

        let session = Session::new("1".to_string(), "kb-a".to_string(), "m".to_string());
        db.store_item(session.clone()).await.expect("store");

        Session::set_title(&session.id, "Comets", &db)
            .await
            .expect("set title");

        let reloaded: Session = db
            .get_item(&session.id)
            .await
            .expect("fetch")
            .expect("exists");
        assert_eq!(reloaded.title.as_deref(), Some("Comets"));
    }
}
