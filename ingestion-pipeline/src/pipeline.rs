use std::collections::HashMap;
use std::sync::Arc;

use common::{
    error::AppError,
    retrieval::RetrieverType,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk::{link_chunk_chain, Chunk, ChunkType},
            knowledge::{Knowledge, KnowledgeStatus},
            knowledge_base::KnowledgeBase,
            tenant::Tenant,
        },
    },
    utils::embedding::EmbeddingProvider,
};
use futures::{StreamExt, TryStreamExt};
use retrieval_engines::{EngineRegistry, IndexEntry};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::docreader::{DocReadRequest, DocReader, VlmConfig};

/// Chunks per embedding request.
const EMBED_BATCH_SIZE: usize = 16;

/// Drives one Knowledge from DocReader output through embedding into every
/// configured engine, with compensating deletes on mid-failure.
pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    registry: Arc<EngineRegistry>,
    docreader: Arc<dyn DocReader>,
    concurrency: usize,
}

impl IngestionPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        registry: Arc<EngineRegistry>,
        docreader: Arc<dyn DocReader>,
        concurrency: usize,
    ) -> Self {
        Self {
            db,
            registry,
            docreader,
            concurrency: concurrency.max(1),
        }
    }

    #[instrument(skip_all, fields(knowledge_id = %knowledge.id, kb_id = %knowledge.kb_id))]
    pub async fn ingest(
        &self,
        tenant: &Tenant,
        kb: &KnowledgeBase,
        embedder: &EmbeddingProvider,
        knowledge: &Knowledge,
        vlm: Option<VlmConfig>,
    ) -> Result<(), AppError> {
        Knowledge::set_status(&knowledge.id, KnowledgeStatus::Processing, None, &self.db).await?;

        match self.run(tenant, kb, embedder, knowledge, vlm).await {
            Ok(chunk_count) => {
                Knowledge::set_status(&knowledge.id, KnowledgeStatus::Ready, None, &self.db)
                    .await?;
                Tenant::adjust_storage_used(&tenant.id, knowledge.file_size, &self.db).await?;
                info!(chunks = chunk_count, "Knowledge ingested");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Ingestion failed; removing partial state");
                self.rollback(tenant, &knowledge.id, embedder.dimension())
                    .await;
                Knowledge::set_status(
                    &knowledge.id,
                    KnowledgeStatus::Failed,
                    Some(err.to_string()),
                    &self.db,
                )
                .await?;
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        tenant: &Tenant,
        kb: &KnowledgeBase,
        embedder: &EmbeddingProvider,
        knowledge: &Knowledge,
        vlm: Option<VlmConfig>,
    ) -> Result<usize, AppError> {
        let request = DocReadRequest {
            source: knowledge.source.clone(),
            content: knowledge.raw_content.clone(),
            chunking: kb.chunking_config.clone(),
            enable_multimodal: kb.chunking_config.enable_multimodal,
            vlm,
            object_storage: kb.object_storage.clone(),
        };
        let doc_chunks = self.docreader.read(request).await?;
        if doc_chunks.is_empty() {
            return Err(AppError::Validation(
                "DocReader produced no chunks for this document".into(),
            ));
        }

        let mut chunks: Vec<Chunk> = doc_chunks
            .iter()
            .map(|doc_chunk| {
                let mut chunk = Chunk::new(
                    tenant.id.clone(),
                    kb.id.clone(),
                    knowledge.id.clone(),
                    doc_chunk.seq,
                    doc_chunk.content.clone(),
                    doc_chunk.start,
                    doc_chunk.end,
                    ChunkType::Text,
                );
                if !doc_chunk.images.is_empty() {
                    chunk.image_info = Some(doc_chunk.images.clone());
                }
                chunk
            })
            .collect();
        link_chunk_chain(&mut chunks);

        let needs_vectors = tenant
            .retriever_engines
            .iter()
            .any(|choice| choice.retriever_type == RetrieverType::Vector);

        let embeddings: Option<Vec<Vec<f32>>> = if needs_vectors {
            let batches: Vec<Vec<String>> = chunks
                .chunks(EMBED_BATCH_SIZE)
                .map(|batch| batch.iter().map(|chunk| chunk.content.clone()).collect())
                .collect();
            let batch_results: Vec<Vec<Vec<f32>>> = futures::stream::iter(
                batches
                    .into_iter()
                    .map(|batch| async move { embedder.embed_batch(&batch).await }),
            )
            .buffered(self.concurrency)
            .try_collect()
            .await?;
            Some(batch_results.into_iter().flatten().collect())
        } else {
            None
        };

        for chunk in &chunks {
            self.db.store_item(chunk.clone()).await?;
        }

        let entries: Vec<IndexEntry> = chunks
            .iter()
            .enumerate()
            .map(|(position, chunk)| IndexEntry {
                chunk_id: chunk.id.clone(),
                kb_id: chunk.kb_id.clone(),
                knowledge_id: chunk.knowledge_id.clone(),
                chunk_index: chunk.chunk_index,
                content: chunk.content.clone(),
                embedding: embeddings
                    .as_ref()
                    .and_then(|vectors| vectors.get(position).cloned()),
            })
            .collect();

        self.registry
            .index_chunks(&tenant.retriever_engines, &entries, embedder.dimension())
            .await?;

        Ok(chunks.len())
    }

    /// Best-effort removal of everything this Knowledge left behind.
    async fn rollback(&self, tenant: &Tenant, knowledge_id: &str, dimension: usize) {
        let ids = vec![knowledge_id.to_owned()];
        for engine in self.registry.unique_engines_for(&tenant.retriever_engines) {
            if let Err(err) = engine.delete_by_knowledge_ids(&ids, dimension).await {
                warn!(
                    engine = engine.engine_type(),
                    error = %err,
                    "Compensating delete failed"
                );
            }
        }
        if let Err(err) = Chunk::delete_by_knowledge(knowledge_id, &self.db).await {
            warn!(error = %err, "Failed to delete chunks during rollback");
        }
    }

    /// Cascade delete: index entries in every engine, chunks, the knowledge
    /// record, and the tenant's storage counter.
    #[instrument(skip_all, fields(knowledge_id = %knowledge.id))]
    pub async fn delete_knowledge(
        &self,
        tenant: &Tenant,
        knowledge: &Knowledge,
        dimension: usize,
    ) -> Result<(), AppError> {
        let ids = vec![knowledge.id.clone()];
        for engine in self.registry.unique_engines_for(&tenant.retriever_engines) {
            engine.delete_by_knowledge_ids(&ids, dimension).await?;
        }
        Chunk::delete_by_knowledge(&knowledge.id, &self.db).await?;
        self.db.delete_item::<Knowledge>(&knowledge.id).await?;
        Tenant::adjust_storage_used(&tenant.id, -knowledge.file_size, &self.db).await?;
        Ok(())
    }

    /// Clone a knowledge base's documents, chunks and index payloads under
    /// fresh ids without recomputing embeddings. Returns the chunk id map.
    #[instrument(skip_all, fields(src_kb = %src_kb.id, dst_kb = %dst_kb.id))]
    pub async fn copy_knowledge_base(
        &self,
        tenant: &Tenant,
        src_kb: &KnowledgeBase,
        dst_kb: &KnowledgeBase,
        dimension: usize,
    ) -> Result<HashMap<String, String>, AppError> {
        let knowledge_items = Knowledge::list_by_kb(&src_kb.id, &self.db).await?;

        let mut knowledge_id_map: HashMap<String, String> = HashMap::new();
        for item in &knowledge_items {
            let mut copy = item.clone();
            copy.id = Uuid::new_v4().to_string();
            copy.kb_id = dst_kb.id.clone();
            knowledge_id_map.insert(item.id.clone(), copy.id.clone());
            self.db.store_item(copy).await?;
        }

        let mut chunk_id_map: HashMap<String, String> = HashMap::new();
        for item in &knowledge_items {
            let mut chunks = Chunk::list_by_knowledge(&item.id, &self.db).await?;
            for chunk in &mut chunks {
                let new_id = Uuid::new_v4().to_string();
                chunk_id_map.insert(chunk.id.clone(), new_id.clone());
                chunk.id = new_id;
                chunk.kb_id = dst_kb.id.clone();
                chunk.knowledge_id = knowledge_id_map
                    .get(&item.id)
                    .cloned()
                    .unwrap_or_else(|| item.id.clone());
            }
            link_chunk_chain(&mut chunks);
            for chunk in chunks {
                self.db.store_item(chunk).await?;
            }
        }

        for engine in self.registry.unique_engines_for(&tenant.retriever_engines) {
            engine
                .copy_indices(
                    &src_kb.id,
                    &dst_kb.id,
                    &chunk_id_map,
                    &knowledge_id_map,
                    dimension,
                )
                .await?;
        }

        info!(
            documents = knowledge_items.len(),
            chunks = chunk_id_map.len(),
            "Copied knowledge base"
        );
        Ok(chunk_id_map)
    }
}
