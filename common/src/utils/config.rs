use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamManagerType {
    Memory,
    Redis,
}

fn default_stream_manager_type() -> StreamManagerType {
    StreamManagerType::Memory
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    pub http_port: u16,

    /// Comma-separated engine drivers to initialize at startup.
    #[serde(default = "default_retrieve_driver")]
    pub retrieve_driver: String,

    #[serde(default = "default_stream_manager_type")]
    pub stream_manager_type: StreamManagerType,
    #[serde(default)]
    pub redis_addr: Option<String>,
    #[serde(default)]
    pub redis_password: Option<String>,
    #[serde(default)]
    pub redis_db: i64,
    #[serde(default = "default_redis_prefix")]
    pub redis_prefix: String,
    #[serde(default = "default_stream_ttl_secs")]
    pub stream_ttl_secs: u64,

    #[serde(default = "default_docreader_addr")]
    pub docreader_addr: String,
    #[serde(default = "default_ingest_concurrency")]
    pub ingest_concurrency: usize,

    // Default models seeded at startup.
    #[serde(default)]
    pub init_llm_model_name: Option<String>,
    #[serde(default)]
    pub init_llm_model_base_url: Option<String>,
    #[serde(default)]
    pub init_llm_model_api_key: Option<String>,
    #[serde(default)]
    pub init_llm_model_id: Option<String>,

    #[serde(default)]
    pub init_embedding_model_name: Option<String>,
    #[serde(default = "default_embedding_dimension")]
    pub init_embedding_model_dimension: u32,
    #[serde(default)]
    pub init_embedding_model_base_url: Option<String>,
    #[serde(default)]
    pub init_embedding_model_api_key: Option<String>,
    #[serde(default)]
    pub init_embedding_model_id: Option<String>,

    #[serde(default)]
    pub init_rerank_model_name: Option<String>,
    #[serde(default)]
    pub init_rerank_model_base_url: Option<String>,
    #[serde(default)]
    pub init_rerank_model_api_key: Option<String>,
    #[serde(default)]
    pub init_rerank_model_id: Option<String>,

    #[serde(default)]
    pub vlm_model_name: Option<String>,
    #[serde(default)]
    pub vlm_model_base_url: Option<String>,
    #[serde(default)]
    pub vlm_model_api_key: Option<String>,
    #[serde(default)]
    pub vlm_model_id: Option<String>,

    // Object storage credentials, forwarded to DocReader for multimodal runs.
    #[serde(default)]
    pub minio_access_key_id: Option<String>,
    #[serde(default)]
    pub minio_secret_access_key: Option<String>,
}

fn default_retrieve_driver() -> String {
    "surreal_vector,surreal_keyword".to_string()
}

fn default_redis_prefix() -> String {
    "active_stream".to_string()
}

fn default_stream_ttl_secs() -> u64 {
    3600
}

fn default_docreader_addr() -> String {
    "http://localhost:8081".to_string()
}

fn default_ingest_concurrency() -> usize {
    4
}

fn default_embedding_dimension() -> u32 {
    1536
}

impl AppConfig {
    pub fn retrieve_drivers(&self) -> Vec<String> {
        self.retrieve_driver
            .split(',')
            .map(str::trim)
            .filter(|driver| !driver.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieve_drivers_splits_and_trims() {
        let config = AppConfig {
            surrealdb_address: "mem://".into(),
            surrealdb_username: "root".into(),
            surrealdb_password: "root".into(),
            surrealdb_namespace: "ns".into(),
            surrealdb_database: "db".into(),
            http_port: 0,
            retrieve_driver: "surreal_vector, surreal_keyword ,".into(),
            stream_manager_type: StreamManagerType::Memory,
            redis_addr: None,
            redis_password: None,
            redis_db: 0,
            redis_prefix: default_redis_prefix(),
            stream_ttl_secs: default_stream_ttl_secs(),
            docreader_addr: default_docreader_addr(),
            ingest_concurrency: default_ingest_concurrency(),
            init_llm_model_name: None,
            init_llm_model_base_url: None,
            init_llm_model_api_key: None,
            init_llm_model_id: None,
            init_embedding_model_name: None,
            init_embedding_model_dimension: default_embedding_dimension(),
            init_embedding_model_base_url: None,
            init_embedding_model_api_key: None,
            init_embedding_model_id: None,
            init_rerank_model_name: None,
            init_rerank_model_base_url: None,
            init_rerank_model_api_key: None,
            init_rerank_model_id: None,
            vlm_model_name: None,
            vlm_model_base_url: None,
            vlm_model_api_key: None,
            vlm_model_id: None,
            minio_access_key_id: None,
            minio_secret_access_key: None,
        };

        assert_eq!(
            config.retrieve_drivers(),
            vec!["surreal_vector".to_string(), "surreal_keyword".to_string()]
        );
    }
}
