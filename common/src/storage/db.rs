use std::ops::Deref;
use std::sync::Arc;

use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

use crate::error::AppError;

use super::types::StoredObject;

pub const FTS_ANALYZER_NAME: &str = "app_fts_analyzer";

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

pub trait ProvidesDb {
    fn db(&self) -> &Arc<SurrealDbClient>;
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Bootstrap the relational schema: FTS analyzer, uniqueness and lookup
    /// indexes. Safe to call repeatedly; every statement is `IF NOT EXISTS`.
    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        self.ensure_fts_analyzer().await?;

        self.client
            .query(
                "DEFINE INDEX IF NOT EXISTS idx_knowledge_kb_hash ON TABLE knowledge \
                 FIELDS kb_id, content_hash UNIQUE;",
            )
            .await?
            .check()?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_tenant_api_key ON TABLE tenant FIELDS api_key;")
            .await?
            .check()?;
        self.client
            .query(
                "DEFINE INDEX IF NOT EXISTS idx_chunk_knowledge ON TABLE chunk \
                 FIELDS knowledge_id;",
            )
            .await?
            .check()?;
        self.client
            .query(
                "DEFINE INDEX IF NOT EXISTS idx_message_session ON TABLE message \
                 FIELDS session_id, created_at;",
            )
            .await?
            .check()?;

        Ok(())
    }

    async fn ensure_fts_analyzer(&self) -> Result<(), AppError> {
        // Snowball stemming when the running Surreal build supports it,
        // ascii-only otherwise.
        let snowball = format!(
            "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME} \
             TOKENIZERS class FILTERS lowercase, ascii, snowball(english);"
        );

        if let Ok(res) = self.client.query(snowball).await {
            if res.check().is_ok() {
                return Ok(());
            }
        }

        tracing::warn!(
            analyzer = FTS_ANALYZER_NAME,
            "Snowball analyzer unavailable; defining ascii-only fallback"
        );

        let fallback = format!(
            "DEFINE ANALYZER IF NOT EXISTS {FTS_ANALYZER_NAME} \
             TOKENIZERS class FILTERS lowercase, ascii;"
        );
        self.client.query(fallback).await?.check()?;

        Ok(())
    }

    /// Store an object under its own id. Fails on key collision.
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Replace the stored record with the given content, creating it if absent.
    pub async fn upsert_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .upsert((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
