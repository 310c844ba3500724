use std::sync::Arc;
use std::time::Duration;

use api_router::{
    api_routes_v1,
    api_state::{ApiState, DbModelGateway},
};
use axum::Router;
use chat_pipeline::{ChatPipeline, MemoryStreamManager, RedisStreamManager, StreamManager};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            model::{
                AiModel, ModelKind, ModelSource, DEFAULT_CHAT_MODEL_ID,
                DEFAULT_EMBEDDING_MODEL_ID, DEFAULT_RERANK_MODEL_ID, DEFAULT_VLM_MODEL_ID,
            },
            tenant::Tenant,
        },
    },
    utils::{
        config::{get_config, AppConfig, StreamManagerType},
        embedding::EmbeddingProvider,
    },
};
use ingestion_pipeline::{HttpDocReader, IngestionPipeline};
use retrieval_engines::{registry::default_choices_for_drivers, EngineRegistry};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    seed_default_models(&db, &config).await?;

    let embedder = Arc::new(default_embedder(&config)?);
    info!(
        embedding_model = embedder.model_id(),
        embedding_dimension = embedder.dimension(),
        "Embedding provider initialized"
    );

    let registry = Arc::new(
        EngineRegistry::from_drivers(
            &config.retrieve_drivers(),
            Arc::clone(&db),
            embedder.dimension(),
        )
        .await?,
    );
    if registry.is_empty() {
        warn!("No retrieval engines configured; retrieval will return nothing");
    }

    let streams = stream_manager(&config)?;
    let docreader = Arc::new(HttpDocReader::new(&config.docreader_addr)?);
    let ingestion = Arc::new(IngestionPipeline::new(
        Arc::clone(&db),
        Arc::clone(&registry),
        docreader,
        config.ingest_concurrency,
    ));
    let models = Arc::new(DbModelGateway::new(
        Arc::clone(&db),
        Arc::clone(&embedder),
        default_embedding_model_id(&config),
    ));

    seed_initial_tenant(&db, &config).await?;

    let state = ApiState {
        db,
        config: config.clone(),
        registry,
        streams,
        models,
        chat_pipeline: Arc::new(ChatPipeline::new()),
        ingestion,
    };

    let app = Router::new().nest("/api/v1", api_routes_v1(state));

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn default_embedding_model_id(config: &AppConfig) -> String {
    config
        .init_embedding_model_id
        .clone()
        .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL_ID.to_string())
}

/// The embedder backing the default embedding model id. Falls back to
/// deterministic hashed vectors when no endpoint is configured, which keeps
/// a dev instance usable without external services.
fn default_embedder(config: &AppConfig) -> Result<EmbeddingProvider, AppError> {
    let dimension = config.init_embedding_model_dimension as usize;
    match (
        config.init_embedding_model_name.as_deref(),
        config.init_embedding_model_base_url.as_deref(),
    ) {
        (Some(name), Some(base_url)) => Ok(EmbeddingProvider::remote(
            base_url,
            config.init_embedding_model_api_key.as_deref().unwrap_or(""),
            name,
            dimension,
            None,
        )),
        _ => {
            warn!("No embedding endpoint configured; using hashed embeddings");
            Ok(EmbeddingProvider::new_hashed(dimension))
        }
    }
}

fn stream_manager(config: &AppConfig) -> Result<Arc<dyn StreamManager>, AppError> {
    let ttl = Duration::from_secs(config.stream_ttl_secs);
    match config.stream_manager_type {
        StreamManagerType::Memory => Ok(Arc::new(MemoryStreamManager::new(ttl))),
        StreamManagerType::Redis => {
            let addr = config.redis_addr.as_deref().ok_or_else(|| {
                AppError::Validation("REDIS_ADDR is required for the redis stream manager".into())
            })?;
            Ok(Arc::new(RedisStreamManager::new(
                addr,
                config.redis_password.as_deref(),
                config.redis_db,
                &config.redis_prefix,
                ttl,
            )?))
        }
    }
}

/// Upsert the default model records named by the environment. Idempotent.
async fn seed_default_models(db: &SurrealDbClient, config: &AppConfig) -> Result<(), AppError> {
    if let (Some(name), Some(base_url)) = (
        config.init_llm_model_name.clone(),
        config.init_llm_model_base_url.clone(),
    ) {
        let id = config
            .init_llm_model_id
            .clone()
            .unwrap_or_else(|| DEFAULT_CHAT_MODEL_ID.to_string());
        let model = AiModel::new(
            Some(id),
            name,
            ModelKind::Chat,
            ModelSource::Remote,
            base_url,
            config.init_llm_model_api_key.clone(),
            None,
        );
        db.upsert_item(model).await?;
    }

    if let (Some(name), Some(base_url)) = (
        config.init_embedding_model_name.clone(),
        config.init_embedding_model_base_url.clone(),
    ) {
        let id = default_embedding_model_id(config);
        let model = AiModel::new(
            Some(id),
            name,
            ModelKind::Embedding,
            ModelSource::Remote,
            base_url,
            config.init_embedding_model_api_key.clone(),
            Some(config.init_embedding_model_dimension),
        );
        db.upsert_item(model).await?;
    }

    if let (Some(name), Some(base_url)) = (
        config.init_rerank_model_name.clone(),
        config.init_rerank_model_base_url.clone(),
    ) {
        let id = config
            .init_rerank_model_id
            .clone()
            .unwrap_or_else(|| DEFAULT_RERANK_MODEL_ID.to_string());
        let model = AiModel::new(
            Some(id),
            name,
            ModelKind::Rerank,
            ModelSource::Remote,
            base_url,
            config.init_rerank_model_api_key.clone(),
            None,
        );
        db.upsert_item(model).await?;
    }

    if let (Some(name), Some(base_url)) = (
        config.vlm_model_name.clone(),
        config.vlm_model_base_url.clone(),
    ) {
        let id = config
            .vlm_model_id
            .clone()
            .unwrap_or_else(|| DEFAULT_VLM_MODEL_ID.to_string());
        let model = AiModel::new(
            Some(id),
            name,
            ModelKind::Vlm,
            ModelSource::Remote,
            base_url,
            config.vlm_model_api_key.clone(),
            None,
        );
        db.upsert_item(model).await?;
    }

    Ok(())
}

/// First boot creates a tenant so the authenticated API is reachable; its
/// api-key is printed once to the log.
async fn seed_initial_tenant(db: &SurrealDbClient, config: &AppConfig) -> Result<(), AppError> {
    let existing: Vec<Tenant> = db.get_all_stored_items().await?;
    if !existing.is_empty() {
        return Ok(());
    }

    let tenant = Tenant::new(
        1,
        "default".to_string(),
        default_choices_for_drivers(&config.retrieve_drivers()),
        10 * 1024 * 1024 * 1024,
    );
    info!(
        tenant_id = %tenant.id,
        api_key = %tenant.api_key,
        "Created initial tenant"
    );
    db.store_item(tenant).await?;
    Ok(())
}
