#![allow(clippy::module_name_repetitions)]
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Ids the startup seeding uses when the environment provides none.
pub const DEFAULT_CHAT_MODEL_ID: &str = "builtin-chat";
pub const DEFAULT_EMBEDDING_MODEL_ID: &str = "builtin-embedding";
pub const DEFAULT_RERANK_MODEL_ID: &str = "builtin-rerank";
pub const DEFAULT_VLM_MODEL_ID: &str = "builtin-vlm";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Chat,
    Embedding,
    Rerank,
    Vlm,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    Remote,
    Local,
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Remote => f.write_str("remote"),
            ModelSource::Local => f.write_str("local"),
        }
    }
}

stored_object!(AiModel, "ai_model", {
    name: String,
    kind: ModelKind,
    source: ModelSource,
    base_url: String,
    api_key: Option<String>,
    dimension: Option<u32>
});

impl AiModel {
    pub fn new(
        id: Option<String>,
        name: String,
        kind: ModelKind,
        source: ModelSource,
        base_url: String,
        api_key: Option<String>,
        dimension: Option<u32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            created_at: now,
            updated_at: now,
            name,
            kind,
            source,
            base_url,
            api_key,
            dimension,
        }
    }

    /// Identity string for embedding models: `builtin:<source>:<name>:<dim>`.
    pub fn identity(&self) -> String {
        match self.dimension {
            Some(dimension) => format!("builtin:{}:{}:{}", self.source, self.name, dimension),
            None => format!("builtin:{}:{}", self.source, self.name),
        }
    }

    pub async fn require(id: &str, db: &SurrealDbClient) -> Result<AiModel, AppError> {
        db.get_item::<AiModel>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("model '{id}'")))
    }
}
