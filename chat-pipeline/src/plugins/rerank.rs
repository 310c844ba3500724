use async_trait::async_trait;
use retrieval_engines::RetrieveResult;
use tracing::{debug, warn};

use crate::{
    events::{ChatEvent, Next, Plugin, PluginError},
    turn::ChatTurn,
};

/// Re-scores candidates with the KB's rerank model, keeping only passages at
/// or above the session threshold and the configured top-k. Rerank trouble
/// never fails the turn; the fused ordering is kept instead.
pub struct RerankPlugin;

#[async_trait]
impl Plugin for RerankPlugin {
    fn name(&self) -> &'static str {
        "rerank"
    }

    fn activates_on(&self) -> &'static [ChatEvent] {
        &[ChatEvent::Rerank]
    }

    async fn handle(&self, turn: &mut ChatTurn, next: Next<'_>) -> Result<(), PluginError> {
        if turn.kb.rerank_model_id.is_none() {
            return next.run(turn).await;
        }
        let Some(reranker) = turn.services.reranker.as_ref() else {
            debug!("Rerank model configured but no reranker client available");
            return next.run(turn).await;
        };
        if turn.candidates.len() <= 1 {
            return next.run(turn).await;
        }

        let documents: Vec<String> = turn
            .candidates
            .iter()
            .map(|candidate| candidate.content.clone())
            .collect();

        match reranker.rerank(&turn.query, &documents).await {
            Ok(ranked) if !ranked.is_empty() => {
                let threshold = turn.session.rerank_threshold;
                let keep_top = turn.session.rerank_top_k;

                let mut remaining: Vec<Option<RetrieveResult>> =
                    std::mem::take(&mut turn.candidates).into_iter().map(Some).collect();

                let mut reranked = Vec::with_capacity(remaining.len());
                for entry in ranked {
                    if entry.score < threshold {
                        continue;
                    }
                    if let Some(slot) = remaining.get_mut(entry.index) {
                        if let Some(mut candidate) = slot.take() {
                            candidate.score = entry.score;
                            reranked.push(candidate);
                        }
                    } else {
                        warn!(
                            result_index = entry.index,
                            "Reranker returned out-of-range index; skipping"
                        );
                    }
                }

                if keep_top > 0 && reranked.len() > keep_top {
                    reranked.truncate(keep_top);
                }

                debug!(
                    kept = reranked.len(),
                    threshold,
                    "Applied rerank scores"
                );
                turn.candidates = reranked;
            }
            Ok(_) => {
                debug!("Reranker returned no results; retaining fused ordering");
            }
            Err(err) => {
                warn!(error = %err, "Reranking failed; continuing with fused ordering");
            }
        }

        next.run(turn).await
    }
}
