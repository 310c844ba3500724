use std::sync::Arc;

use common::{
    storage::{
        db::SurrealDbClient,
        types::{
            chunk::ImageInfo,
            knowledge_base::KnowledgeBase,
            message::{ChunkReference, Message},
            session::Session,
            tenant::Tenant,
        },
    },
    utils::{chat::ChatMessage, chat::ChatModel, embedding::EmbeddingProvider, rerank::Reranker},
};
use retrieval_engines::{EngineRegistry, RetrieveResult};
use tokio::sync::mpsc;

use crate::stream::StreamManager;

/// Everything a turn needs to reach the outside world.
pub struct TurnServices {
    pub db: Arc<SurrealDbClient>,
    pub registry: Arc<EngineRegistry>,
    pub embedder: Option<Arc<EmbeddingProvider>>,
    pub chat: Arc<dyn ChatModel>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub streams: Arc<dyn StreamManager>,
}

/// A merged, prompt-ready passage.
#[derive(Debug, Clone)]
pub struct Passage {
    pub chunk_id: String,
    pub knowledge_id: String,
    pub chunk_index: u32,
    pub content: String,
    pub score: f32,
    pub match_type: common::retrieval::MatchType,
    pub image_info: Option<Vec<ImageInfo>>,
}

/// Frame pushed to the client while a turn streams.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatFrame {
    References(Vec<ChunkReference>),
    Answer { content: String, done: bool },
    Error { message: String },
}

/// Shared mutable record one QA turn's plugins operate on.
pub struct ChatTurn {
    pub services: Arc<TurnServices>,
    pub tenant: Tenant,
    pub kb: KnowledgeBase,
    pub session: Session,
    pub request_id: String,
    pub original_query: String,
    pub query: String,
    pub language: Option<String>,
    pub history: Vec<Message>,
    pub query_embedding: Option<Vec<f32>>,
    pub candidates: Vec<RetrieveResult>,
    pub passages: Vec<Passage>,
    pub references: Vec<ChunkReference>,
    pub prompt: Vec<ChatMessage>,
    pub answer: String,
    pub skip_chat: bool,
    emitter: mpsc::Sender<ChatFrame>,
}

impl ChatTurn {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        services: Arc<TurnServices>,
        tenant: Tenant,
        kb: KnowledgeBase,
        session: Session,
        request_id: String,
        query: String,
        history: Vec<Message>,
        emitter: mpsc::Sender<ChatFrame>,
    ) -> Self {
        Self {
            services,
            tenant,
            kb,
            session,
            request_id,
            original_query: query.clone(),
            query,
            language: None,
            history,
            query_embedding: None,
            candidates: Vec::new(),
            passages: Vec::new(),
            references: Vec::new(),
            prompt: Vec::new(),
            answer: String::new(),
            skip_chat: false,
            emitter,
        }
    }

    /// Push a frame toward the client. A closed receiver means the client
    /// went away; the turn keeps running so the stream stays resumable.
    pub async fn emit(&self, frame: ChatFrame) {
        if self.emitter.send(frame).await.is_err() {
            tracing::debug!(
                session_id = %self.session.id,
                request_id = %self.request_id,
                "Client disconnected; continuing turn for resume"
            );
        }
    }
}
