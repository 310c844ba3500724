use async_trait::async_trait;
use common::retrieval::RetrieverType;
use tracing::{debug, warn};

use crate::{
    events::{ChatEvent, Next, Plugin, PluginError},
    turn::ChatTurn,
};

/// Embeds the (possibly rewritten) query once for all vector engines.
/// Skipped entirely when the tenant configured no vector engine.
pub struct EmbedQueryPlugin;

#[async_trait]
impl Plugin for EmbedQueryPlugin {
    fn name(&self) -> &'static str {
        "embed_query"
    }

    fn activates_on(&self) -> &'static [ChatEvent] {
        &[ChatEvent::EmbedQuery]
    }

    async fn handle(&self, turn: &mut ChatTurn, next: Next<'_>) -> Result<(), PluginError> {
        let wants_vector = turn
            .tenant
            .retriever_engines
            .iter()
            .any(|choice| choice.retriever_type == RetrieverType::Vector);

        if !wants_vector {
            debug!("No vector engine configured; skipping query embedding");
            return next.run(turn).await;
        }

        match turn.services.embedder.as_ref() {
            Some(embedder) => {
                let embedding = embedder.embed(&turn.query).await.map_err(PluginError::from)?;
                debug!(dimension = embedding.len(), "Embedded query");
                turn.query_embedding = Some(embedding);
            }
            None => {
                warn!("Vector engine configured but no embedding provider available");
            }
        }

        next.run(turn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Next;
    use crate::turn::test_support::{test_services, turn_with_services, ScriptedChat};
    use common::retrieval::RetrieverEngineChoice;

    #[tokio::test]
    async fn embeds_once_when_a_vector_engine_is_configured() {
        let services = test_services(ScriptedChat::with_deltas(&["x"])).await;
        let (mut turn, _rx) = turn_with_services(services, "about comets");
        turn.tenant.retriever_engines = vec![RetrieverEngineChoice {
            retriever_type: RetrieverType::Vector,
            engine_type: "surreal_vector".to_string(),
        }];

        EmbedQueryPlugin
            .handle(&mut turn, Next::noop())
            .await
            .expect("embed");

        let embedding = turn.query_embedding.expect("embedding present");
        assert_eq!(embedding.len(), 8);
    }

    #[tokio::test]
    async fn keyword_only_tenants_skip_embedding() {
        let services = test_services(ScriptedChat::with_deltas(&["x"])).await;
        let (mut turn, _rx) = turn_with_services(services, "about comets");
        turn.tenant.retriever_engines = vec![RetrieverEngineChoice {
            retriever_type: RetrieverType::Keyword,
            engine_type: "surreal_keyword".to_string(),
        }];

        EmbedQueryPlugin
            .handle(&mut turn, Next::noop())
            .await
            .expect("embed");

        assert!(turn.query_embedding.is_none());
    }
}
