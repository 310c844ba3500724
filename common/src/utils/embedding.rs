use std::time::Duration;

use async_openai::{config::OpenAIConfig, types::CreateEmbeddingRequestArgs, Client};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::debug;

use crate::{
    error::AppError,
    storage::types::model::{AiModel, ModelSource},
};

const EMBED_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: usize = 3;

fn retry_strategy() -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(100)
        .map(jitter)
        .take(RETRY_ATTEMPTS)
}

/// Produces fixed-dimension vectors for text behind one interface.
///
/// `Remote` talks to an OpenAI-compatible endpoint, `Local` to an
/// Ollama-style endpoint (pulling the model once before first use), and
/// `Hashed` produces deterministic vectors for tests.
pub enum EmbeddingProvider {
    Remote {
        client: Client<OpenAIConfig>,
        model: String,
        dimension: usize,
        identity: String,
    },
    Local {
        http: reqwest::Client,
        base_url: String,
        model: String,
        dimension: usize,
        identity: String,
        pulled: OnceCell<()>,
    },
    Hashed {
        dimension: usize,
    },
}

impl EmbeddingProvider {
    pub fn remote(
        base_url: &str,
        api_key: &str,
        model: &str,
        dimension: usize,
        identity: Option<String>,
    ) -> Self {
        let client = Client::with_config(
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base(base_url),
        );
        Self::Remote {
            client,
            model: model.to_owned(),
            dimension,
            identity: identity
                .unwrap_or_else(|| format!("builtin:remote:{model}:{dimension}")),
        }
    }

    pub fn local(
        base_url: &str,
        model: &str,
        dimension: usize,
        identity: Option<String>,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(EMBED_TIMEOUT)
            .build()?;
        Ok(Self::Local {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
            model: model.to_owned(),
            dimension,
            identity: identity
                .unwrap_or_else(|| format!("builtin:local:{model}:{dimension}")),
            pulled: OnceCell::new(),
        })
    }

    /// Deterministic vectors with no network dependency; used by tests.
    pub fn new_hashed(dimension: usize) -> Self {
        Self::Hashed { dimension }
    }

    pub fn from_model(model: &AiModel) -> Result<Self, AppError> {
        let dimension = model.dimension.ok_or_else(|| {
            AppError::Validation(format!("embedding model '{}' has no dimension", model.id))
        })? as usize;

        match model.source {
            ModelSource::Remote => Ok(Self::remote(
                &model.base_url,
                model.api_key.as_deref().unwrap_or_default(),
                &model.name,
                dimension,
                Some(model.identity()),
            )),
            ModelSource::Local => Self::local(
                &model.base_url,
                &model.name,
                dimension,
                Some(model.identity()),
            ),
        }
    }

    pub fn dimension(&self) -> usize {
        match self {
            Self::Remote { dimension, .. }
            | Self::Local { dimension, .. }
            | Self::Hashed { dimension } => *dimension,
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            Self::Remote { identity, .. } | Self::Local { identity, .. } => identity,
            Self::Hashed { .. } => "builtin:hashed",
        }
    }

    pub async fn embed(&self, input: &str) -> Result<Vec<f32>, AppError> {
        match self {
            Self::Remote {
                client,
                model,
                dimension,
                ..
            } => {
                let inputs = vec![input.to_owned()];
                let embeddings = RetryIf::spawn(
                    retry_strategy(),
                    || remote_embed(client, model, *dimension, &inputs),
                    AppError::is_transient,
                )
                .await?;
                embeddings
                    .into_iter()
                    .next()
                    .ok_or_else(|| AppError::Upstream("no embedding data received".into()))
            }
            Self::Local {
                http,
                base_url,
                model,
                dimension,
                pulled,
                ..
            } => {
                ensure_pulled(pulled, http, base_url, model).await?;
                let embedding = RetryIf::spawn(
                    retry_strategy(),
                    || local_embed(http, base_url, model, input),
                    AppError::is_transient,
                )
                .await?;
                check_dimension(&embedding, *dimension)?;
                Ok(embedding)
            }
            Self::Hashed { dimension } => Ok(hashed_vector(input, *dimension)),
        }
    }

    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        match self {
            Self::Remote {
                client,
                model,
                dimension,
                ..
            } => {
                let embeddings = RetryIf::spawn(
                    retry_strategy(),
                    || remote_embed(client, model, *dimension, inputs),
                    AppError::is_transient,
                )
                .await?;
                if embeddings.len() != inputs.len() {
                    return Err(AppError::Upstream(format!(
                        "expected {} embeddings, received {}",
                        inputs.len(),
                        embeddings.len()
                    )));
                }
                Ok(embeddings)
            }
            Self::Local { .. } | Self::Hashed { .. } => {
                let mut embeddings = Vec::with_capacity(inputs.len());
                for input in inputs {
                    embeddings.push(self.embed(input).await?);
                }
                Ok(embeddings)
            }
        }
    }
}

async fn remote_embed(
    client: &Client<OpenAIConfig>,
    model: &str,
    dimension: usize,
    inputs: &[String],
) -> Result<Vec<Vec<f32>>, AppError> {
    let request = CreateEmbeddingRequestArgs::default()
        .model(model)
        .dimensions(dimension as u32)
        .input(inputs.to_vec())
        .build()?;

    let response = client.embeddings().create(request).await?;

    let mut embeddings: Vec<(u32, Vec<f32>)> = response
        .data
        .into_iter()
        .map(|row| (row.index, row.embedding))
        .collect();
    embeddings.sort_by_key(|(index, _)| *index);

    let embeddings: Vec<Vec<f32>> = embeddings
        .into_iter()
        .map(|(_, embedding)| embedding)
        .collect();

    for embedding in &embeddings {
        check_dimension(embedding, dimension)?;
    }

    Ok(embeddings)
}

async fn ensure_pulled(
    pulled: &OnceCell<()>,
    http: &reqwest::Client,
    base_url: &str,
    model: &str,
) -> Result<(), AppError> {
    pulled
        .get_or_try_init(|| async {
            debug!(model, "Pulling local embedding model before first use");
            let response = http
                .post(format!("{base_url}/api/pull"))
                .json(&json!({ "name": model, "stream": false }))
                .timeout(Duration::from_secs(600))
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(AppError::Upstream(format!(
                    "model pull failed with status {}",
                    response.status()
                )));
            }
            Ok(())
        })
        .await
        .map(|_| ())
}

async fn local_embed(
    http: &reqwest::Client,
    base_url: &str,
    model: &str,
    input: &str,
) -> Result<Vec<f32>, AppError> {
    #[derive(Deserialize)]
    struct EmbeddingResponse {
        embedding: Vec<f32>,
    }

    let response = http
        .post(format!("{base_url}/api/embeddings"))
        .json(&json!({ "model": model, "prompt": input }))
        .send()
        .await?;

    let status = response.status();
    if status.is_client_error() {
        return Err(AppError::Auth(format!(
            "embedding endpoint rejected the request with status {status}"
        )));
    }
    if !status.is_success() {
        return Err(AppError::Upstream(format!(
            "embedding endpoint returned status {status}"
        )));
    }

    let body: EmbeddingResponse = response.json().await?;
    Ok(body.embedding)
}

fn check_dimension(embedding: &[f32], dimension: usize) -> Result<(), AppError> {
    if embedding.len() == dimension {
        Ok(())
    } else {
        Err(AppError::Upstream(format!(
            "embedding has dimension {}, expected {dimension}",
            embedding.len()
        )))
    }
}

fn hashed_vector(input: &str, dimension: usize) -> Vec<f32> {
    let mut values = Vec::with_capacity(dimension);
    let mut counter: u32 = 0;

    while values.len() < dimension {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();

        for pair in digest.chunks_exact(2) {
            if values.len() == dimension {
                break;
            }
            let raw = u16::from_le_bytes([pair[0], pair[1]]);
            values.push(f32::from(raw) / f32::from(u16::MAX) * 2.0 - 1.0);
        }
        counter = counter.wrapping_add(1);
    }

    let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for value in &mut values {
            *value /= norm;
        }
    }

    values
}
