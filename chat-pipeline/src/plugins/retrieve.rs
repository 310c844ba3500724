use async_trait::async_trait;
use retrieval_engines::{hybrid_search, HybridSearchParams};
use tracing::debug;

use crate::{
    events::{ChatEvent, Next, Plugin, PluginError},
    turn::ChatTurn,
};

/// Hybrid multi-engine retrieval over the session's knowledge base.
pub struct RetrievePlugin;

#[async_trait]
impl Plugin for RetrievePlugin {
    fn name(&self) -> &'static str {
        "retrieve"
    }

    fn activates_on(&self) -> &'static [ChatEvent] {
        &[ChatEvent::Retrieve]
    }

    async fn handle(&self, turn: &mut ChatTurn, next: Next<'_>) -> Result<(), PluginError> {
        let params = HybridSearchParams {
            kb_id: turn.session.kb_id.clone(),
            query: turn.query.clone(),
            query_embedding: turn.query_embedding.clone(),
            vector_threshold: turn.session.vector_threshold,
            keyword_threshold: turn.session.keyword_threshold,
            match_count: turn.session.embedding_top_k,
        };

        let candidates = hybrid_search(
            &turn.services.registry,
            turn.services.embedder.as_deref(),
            &turn.tenant.retriever_engines,
            params,
        )
        .await
        .map_err(PluginError::from)?;

        debug!(candidates = candidates.len(), "Hybrid retrieval finished");
        turn.candidates = candidates;

        next.run(turn).await
    }
}
