use std::sync::Arc;

use async_trait::async_trait;
use chat_pipeline::{ChatPipeline, StreamManager, TurnServices};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            knowledge_base::KnowledgeBase,
            model::AiModel,
            session::Session,
        },
    },
    utils::{
        chat::{ChatModel, OpenAiCompatChat},
        config::AppConfig,
        embedding::EmbeddingProvider,
        rerank::{RemoteReranker, Reranker},
    },
};
use ingestion_pipeline::IngestionPipeline;
use retrieval_engines::EngineRegistry;

use crate::error::ApiError;

/// Builds model clients from stored model records. Behind a trait so tests
/// can swap scripted models in.
#[async_trait]
pub trait ModelGateway: Send + Sync {
    async fn chat(&self, model_id: &str) -> Result<Arc<dyn ChatModel>, AppError>;
    async fn reranker(&self, model_id: &str) -> Result<Arc<dyn Reranker>, AppError>;
    async fn embedder(&self, model_id: &str) -> Result<Arc<EmbeddingProvider>, AppError>;
}

pub struct DbModelGateway {
    db: Arc<SurrealDbClient>,
    default_embedder: Arc<EmbeddingProvider>,
    default_embedding_model_id: String,
}

impl DbModelGateway {
    pub fn new(
        db: Arc<SurrealDbClient>,
        default_embedder: Arc<EmbeddingProvider>,
        default_embedding_model_id: String,
    ) -> Self {
        Self {
            db,
            default_embedder,
            default_embedding_model_id,
        }
    }
}

#[async_trait]
impl ModelGateway for DbModelGateway {
    async fn chat(&self, model_id: &str) -> Result<Arc<dyn ChatModel>, AppError> {
        let model = AiModel::require(model_id, &self.db).await?;
        Ok(Arc::new(OpenAiCompatChat::from_model(&model)?))
    }

    async fn reranker(&self, model_id: &str) -> Result<Arc<dyn Reranker>, AppError> {
        let model = AiModel::require(model_id, &self.db).await?;
        Ok(Arc::new(RemoteReranker::from_model(&model)?))
    }

    async fn embedder(&self, model_id: &str) -> Result<Arc<EmbeddingProvider>, AppError> {
        if model_id == self.default_embedding_model_id {
            return Ok(Arc::clone(&self.default_embedder));
        }
        let model = AiModel::require(model_id, &self.db).await?;
        Ok(Arc::new(EmbeddingProvider::from_model(&model)?))
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub registry: Arc<EngineRegistry>,
    pub streams: Arc<dyn StreamManager>,
    pub models: Arc<dyn ModelGateway>,
    pub chat_pipeline: Arc<ChatPipeline>,
    pub ingestion: Arc<IngestionPipeline>,
}

impl ApiState {
    /// Assemble the per-turn service bundle for one session.
    pub async fn turn_services(
        &self,
        session: &Session,
        kb: &KnowledgeBase,
    ) -> Result<Arc<TurnServices>, ApiError> {
        let chat = self.models.chat(&session.chat_model_id).await?;
        let embedder = self.models.embedder(&kb.embedding_model_id).await?;
        let reranker = match kb.rerank_model_id.as_deref() {
            Some(model_id) => Some(self.models.reranker(model_id).await?),
            None => None,
        };

        Ok(Arc::new(TurnServices {
            db: Arc::clone(&self.db),
            registry: Arc::clone(&self.registry),
            embedder: Some(embedder),
            chat,
            reranker,
            streams: Arc::clone(&self.streams),
        }))
    }
}
