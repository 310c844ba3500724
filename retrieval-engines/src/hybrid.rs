use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::{
    error::AppError,
    retrieval::{MatchType, RetrieverEngineChoice, RetrieverType},
    utils::embedding::EmbeddingProvider,
};
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::{
    engine::{RetrievalEngine, RetrieveParams, RetrieveResult},
    registry::EngineRegistry,
    scoring::{min_max_normalize, rrf_contribution},
};

/// Over-fetch factor: each engine returns up to `match_count × K_OVER`
/// candidates so fusion has something to work with.
const K_OVER: usize = 3;

/// Per-engine retrieval deadline.
const RETRIEVE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct HybridSearchParams {
    pub kb_id: String,
    pub query: String,
    pub query_embedding: Option<Vec<f32>>,
    pub vector_threshold: f32,
    pub keyword_threshold: f32,
    pub match_count: usize,
}

struct FusedCandidate {
    result: RetrieveResult,
    rrf: f32,
    best_normalized: f32,
    engines: HashSet<&'static str>,
    first_retriever: RetrieverType,
}

/// Parallel multi-engine retrieval with score normalization and
/// Reciprocal-Rank-Fusion. Partial engine failures degrade to the fusion of
/// the successes; only a total failure surfaces as a retrieval error.
#[instrument(skip_all, fields(kb_id = %params.kb_id, match_count = params.match_count))]
pub async fn hybrid_search(
    registry: &EngineRegistry,
    embedder: Option<&EmbeddingProvider>,
    choices: &[RetrieverEngineChoice],
    params: HybridSearchParams,
) -> Result<Vec<RetrieveResult>, AppError> {
    if params.match_count == 0 {
        return Ok(Vec::new());
    }

    let mut pairs = registry.engines_for(choices);
    if pairs.is_empty() {
        warn!("No retrieval engines resolved for this tenant; returning empty result");
        return Ok(Vec::new());
    }

    // Embed the query once and reuse it across vector engines.
    let mut query_embedding = params.query_embedding.clone();
    let wants_vector = pairs
        .iter()
        .any(|(retriever, _)| *retriever == RetrieverType::Vector);
    if wants_vector && query_embedding.is_none() {
        match embedder {
            Some(provider) => {
                query_embedding = Some(provider.embed(&params.query).await?);
            }
            None => {
                warn!("Vector engines configured but no embedder available; skipping them");
                pairs.retain(|(retriever, _)| *retriever != RetrieverType::Vector);
                if pairs.is_empty() {
                    return Ok(Vec::new());
                }
            }
        }
    }

    let take = params.match_count.saturating_mul(K_OVER);
    let fan_out = pairs.iter().map(|(retriever, engine)| {
        let engine = Arc::clone(engine);
        let retriever = *retriever;
        let retrieve_params = RetrieveParams {
            query: params.query.clone(),
            query_embedding: match retriever {
                RetrieverType::Vector => query_embedding.clone(),
                RetrieverType::Keyword => None,
            },
            kb_ids: vec![params.kb_id.clone()],
            top_k: take,
            threshold: match retriever {
                RetrieverType::Vector => params.vector_threshold,
                RetrieverType::Keyword => params.keyword_threshold,
            },
            retriever_type: retriever,
        };
        async move {
            let outcome = match tokio::time::timeout(
                RETRIEVE_TIMEOUT,
                engine.retrieve(&retrieve_params),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(AppError::Cancelled(format!(
                    "retrieval deadline exceeded for engine '{}'",
                    engine.engine_type()
                ))),
            };
            (retriever, engine, outcome)
        }
    });

    let outcomes = join_all(fan_out).await;

    let mut successes: Vec<(RetrieverType, &'static str, Vec<RetrieveResult>)> = Vec::new();
    let mut failures = 0usize;
    for (retriever, engine, outcome) in outcomes {
        match outcome {
            Ok(results) => {
                debug!(
                    engine = engine.engine_type(),
                    retriever = %retriever,
                    candidates = results.len(),
                    "Engine retrieval finished"
                );
                successes.push((retriever, engine.engine_type(), results));
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                warn!(
                    engine = engine.engine_type(),
                    retriever = %retriever,
                    error = %err,
                    "Engine retrieval failed"
                );
            }
        }
    }

    if successes.is_empty() && failures > 0 {
        return Err(AppError::Retrieval(
            "all retrieval engines failed for this query".into(),
        ));
    }

    Ok(fuse(successes, params.match_count))
}

/// RRF across engines (1-based ranks); ties broken by the highest
/// single-engine normalized score, then ascending chunk id.
fn fuse(
    per_engine: Vec<(RetrieverType, &'static str, Vec<RetrieveResult>)>,
    match_count: usize,
) -> Vec<RetrieveResult> {
    let mut candidates: HashMap<String, FusedCandidate> = HashMap::new();

    for (retriever, engine_type, results) in per_engine {
        if results.is_empty() {
            continue;
        }
        let raw_scores: Vec<f32> = results.iter().map(|result| result.score).collect();
        let normalized = min_max_normalize(&raw_scores);

        for (position, (result, normalized_score)) in
            results.into_iter().zip(normalized.into_iter()).enumerate()
        {
            let contribution = rrf_contribution(position.saturating_add(1));
            let entry = candidates
                .entry(result.chunk_id.clone())
                .or_insert_with(|| FusedCandidate {
                    result,
                    rrf: 0.0,
                    best_normalized: 0.0,
                    engines: HashSet::new(),
                    first_retriever: retriever,
                });
            entry.rrf += contribution;
            entry.best_normalized = entry.best_normalized.max(normalized_score);
            entry.engines.insert(engine_type);
        }
    }

    let mut fused: Vec<FusedCandidate> = candidates.into_values().collect();
    fused.sort_by(|a, b| {
        b.rrf
            .partial_cmp(&a.rrf)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.best_normalized
                    .partial_cmp(&a.best_normalized)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.result.chunk_id.cmp(&b.result.chunk_id))
    });
    fused.truncate(match_count);

    fused
        .into_iter()
        .map(|candidate| {
            let match_type = if candidate.engines.len() > 1 {
                MatchType::Hybrid
            } else {
                MatchType::from(candidate.first_retriever)
            };
            RetrieveResult {
                score: candidate.rrf,
                match_type,
                ..candidate.result
            }
        })
        .collect()
}
