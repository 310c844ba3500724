use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use common::{
    error::AppError,
    storage::types::{
        chunk::ImageInfo,
        knowledge::KnowledgeSource,
        knowledge_base::{ChunkingConfig, ObjectStorageConfig},
    },
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

/// Large uploads can take a very long time to parse.
const DOCREADER_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Vision model configuration forwarded for multimodal parsing.
#[derive(Debug, Clone, Serialize)]
pub struct VlmConfig {
    pub model_name: String,
    pub base_url: String,
    pub api_key: Option<String>,
}

/// What the external chunking service needs to split one document.
#[derive(Debug, Clone)]
pub struct DocReadRequest {
    pub source: KnowledgeSource,
    /// Raw bytes for file sources; `None` for URL sources.
    pub content: Option<Vec<u8>>,
    pub chunking: ChunkingConfig,
    pub enable_multimodal: bool,
    pub vlm: Option<VlmConfig>,
    pub object_storage: Option<ObjectStorageConfig>,
}

/// One ordered chunk as produced by DocReader.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DocChunk {
    pub content: String,
    pub seq: u32,
    pub start: usize,
    pub end: usize,
    #[serde(default)]
    pub images: Vec<ImageInfo>,
}

/// External document parsing and chunking service.
#[async_trait]
pub trait DocReader: Send + Sync {
    async fn read(&self, request: DocReadRequest) -> Result<Vec<DocChunk>, AppError>;
}

pub struct HttpDocReader {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDocReader {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(DOCREADER_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl DocReader for HttpDocReader {
    async fn read(&self, request: DocReadRequest) -> Result<Vec<DocChunk>, AppError> {
        #[derive(Deserialize)]
        struct ReadResponse {
            chunks: Vec<DocChunk>,
        }

        let (file_name, url) = match &request.source {
            KnowledgeSource::File { file_name } => (Some(file_name.clone()), None),
            KnowledgeSource::Url { url } => (None, Some(url.clone())),
        };
        let content = request
            .content
            .as_deref()
            .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes));

        let body = json!({
            "file_name": file_name,
            "url": url,
            "content": content,
            "chunk_size": request.chunking.chunk_size,
            "chunk_overlap": request.chunking.chunk_overlap,
            "separators": request.chunking.separators,
            "enable_multimodal": request.enable_multimodal,
            "vlm": request.vlm,
            "object_storage": request.object_storage,
        });

        debug!(
            source = request.source.label(),
            multimodal = request.enable_multimodal,
            "Sending document to DocReader"
        );

        let response = self
            .http
            .post(format!("{}/read", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            return Err(AppError::Validation(format!(
                "DocReader rejected the document with status {status}"
            )));
        }
        if !status.is_success() {
            return Err(AppError::Upstream(format!(
                "DocReader returned status {status}"
            )));
        }

        let parsed: ReadResponse = response.json().await?;
        let mut chunks = parsed.chunks;
        chunks.sort_by_key(|chunk| chunk.seq);
        Ok(chunks)
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;

    /// DocReader stub returning a fixed chunk list.
    pub struct FixedDocReader {
        pub chunks: Vec<DocChunk>,
    }

    impl FixedDocReader {
        pub fn from_texts(texts: &[&str]) -> Self {
            let mut offset = 0usize;
            let chunks = texts
                .iter()
                .enumerate()
                .map(|(seq, text)| {
                    let start = offset;
                    offset += text.len();
                    DocChunk {
                        content: (*text).to_string(),
                        seq: seq as u32,
                        start,
                        end: offset,
                        images: Vec::new(),
                    }
                })
                .collect();
            Self { chunks }
        }
    }

    #[async_trait]
    impl DocReader for FixedDocReader {
        async fn read(&self, _request: DocReadRequest) -> Result<Vec<DocChunk>, AppError> {
            Ok(self.chunks.clone())
        }
    }
}
