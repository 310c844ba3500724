use std::cmp::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};

use crate::{
    error::AppError,
    storage::types::model::{AiModel, ModelKind},
};

const RERANK_TIMEOUT: Duration = Duration::from_secs(15);

/// Relevance score for one passage, by original index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankedPassage {
    pub index: usize,
    pub score: f32,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score (query, passage) pairs, returned in descending score order.
    /// Threshold filtering is the caller's concern.
    async fn rerank(
        &self,
        query: &str,
        passages: &[String],
    ) -> Result<Vec<RankedPassage>, AppError>;
}

pub struct RemoteReranker {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl RemoteReranker {
    pub fn new(base_url: &str, api_key: Option<&str>, model: &str) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(RERANK_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key: api_key.map(str::to_owned),
            model: model.to_owned(),
        })
    }

    pub fn from_model(model: &AiModel) -> Result<Self, AppError> {
        if model.kind != ModelKind::Rerank {
            return Err(AppError::Validation(format!(
                "model '{}' is not a rerank model",
                model.id
            )));
        }
        Self::new(&model.base_url, model.api_key.as_deref(), &model.name)
    }

    async fn call(&self, query: &str, passages: &[String]) -> Result<Vec<RankedPassage>, AppError> {
        #[derive(Deserialize)]
        struct RerankRow {
            index: usize,
            relevance_score: f32,
        }
        #[derive(Deserialize)]
        struct RerankResponse {
            results: Vec<RerankRow>,
        }

        let mut request = self
            .http
            .post(format!("{}/rerank", self.base_url))
            .json(&json!({
                "model": self.model,
                "query": query,
                "documents": passages,
            }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_client_error() {
            return Err(AppError::Auth(format!(
                "rerank endpoint rejected the request with status {status}"
            )));
        }
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "rerank endpoint returned status {status}"
            )));
        }

        let body: RerankResponse = response.json().await?;
        let mut ranked: Vec<RankedPassage> = body
            .results
            .into_iter()
            .map(|row| RankedPassage {
                index: row.index,
                score: row.relevance_score,
            })
            .collect();
        sort_by_score_desc(&mut ranked);
        Ok(ranked)
    }
}

#[async_trait]
impl Reranker for RemoteReranker {
    async fn rerank(
        &self,
        query: &str,
        passages: &[String],
    ) -> Result<Vec<RankedPassage>, AppError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
        RetryIf::spawn(
            strategy,
            || self.call(query, passages),
            AppError::is_transient,
        )
        .await
    }
}

pub fn sort_by_score_desc(ranked: &mut [RankedPassage]) {
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.index.cmp(&b.index))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sort_orders_descending_with_index_tiebreak() {
        let mut ranked = vec![
            RankedPassage { index: 2, score: 0.4 },
            RankedPassage { index: 0, score: 0.9 },
            RankedPassage { index: 1, score: 0.4 },
        ];
        sort_by_score_desc(&mut ranked);

        let order: Vec<usize> = ranked.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }
}
