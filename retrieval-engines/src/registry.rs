use std::collections::HashMap;
use std::sync::Arc;

use common::{
    error::AppError,
    retrieval::{RetrieverEngineChoice, RetrieverType},
    storage::db::SurrealDbClient,
};
use tracing::{info, warn};

use crate::{
    engine::{IndexEntry, RetrievalEngine},
    surreal::{SurrealKeywordEngine, SurrealVectorEngine, SURREAL_KEYWORD, SURREAL_VECTOR},
};

/// The (retriever-type, engine-type) pairs a driver list naturally provides;
/// used as the default preference set for new tenants.
pub fn default_choices_for_drivers(drivers: &[String]) -> Vec<RetrieverEngineChoice> {
    drivers
        .iter()
        .filter_map(|driver| {
            let retriever_type = match driver.as_str() {
                SURREAL_VECTOR => RetrieverType::Vector,
                SURREAL_KEYWORD => RetrieverType::Keyword,
                _ => return None,
            };
            Some(RetrieverEngineChoice {
                retriever_type,
                engine_type: driver.clone(),
            })
        })
        .collect()
}

/// Process-wide table of retrieval engines, keyed by engine-type.
/// Built once at startup from the configured driver list; read-only after.
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn RetrievalEngine>>,
}

impl EngineRegistry {
    /// Instantiate every driver named in the configured driver set. Each
    /// driver ensures its own backing schema before registering itself.
    pub async fn from_drivers(
        drivers: &[String],
        db: Arc<SurrealDbClient>,
        dimension: usize,
    ) -> Result<Self, AppError> {
        let mut engines: HashMap<String, Arc<dyn RetrievalEngine>> = HashMap::new();

        for driver in drivers {
            let engine: Arc<dyn RetrievalEngine> = match driver.as_str() {
                SURREAL_VECTOR => {
                    Arc::new(SurrealVectorEngine::new(Arc::clone(&db), dimension).await?)
                }
                SURREAL_KEYWORD => Arc::new(SurrealKeywordEngine::new(Arc::clone(&db)).await?),
                other => {
                    return Err(AppError::Validation(format!(
                        "unknown retrieval driver '{other}'"
                    )))
                }
            };
            info!(engine = engine.engine_type(), "Registered retrieval engine");
            engines.insert(engine.engine_type().to_owned(), engine);
        }

        Ok(Self { engines })
    }

    /// Registry over pre-built engines; used by tests and embedders of the
    /// crate that bring their own adapters.
    pub fn with_engines(list: Vec<Arc<dyn RetrievalEngine>>) -> Self {
        let mut engines: HashMap<String, Arc<dyn RetrievalEngine>> = HashMap::new();
        for engine in list {
            engines.insert(engine.engine_type().to_owned(), engine);
        }
        Self { engines }
    }

    pub fn get(&self, engine_type: &str) -> Option<Arc<dyn RetrievalEngine>> {
        self.engines.get(engine_type).map(Arc::clone)
    }

    pub fn all(&self) -> Vec<Arc<dyn RetrievalEngine>> {
        self.engines.values().map(Arc::clone).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Resolve a tenant's (retriever-type, engine-type) preferences against
    /// the registered engines, dropping pairs whose engine is missing or
    /// does not support the requested mode.
    pub fn engines_for(
        &self,
        choices: &[RetrieverEngineChoice],
    ) -> Vec<(RetrieverType, Arc<dyn RetrievalEngine>)> {
        let mut pairs = Vec::new();
        for choice in choices {
            let Some(engine) = self.get(&choice.engine_type) else {
                warn!(
                    engine = %choice.engine_type,
                    "Tenant references an engine that is not registered"
                );
                continue;
            };
            if !engine.supports().contains(&choice.retriever_type) {
                warn!(
                    engine = %choice.engine_type,
                    retriever = %choice.retriever_type,
                    "Engine does not support the requested retriever type"
                );
                continue;
            }
            pairs.push((choice.retriever_type, engine));
        }
        pairs
    }

    /// The distinct engines behind a tenant's choices, for index fan-out.
    pub fn unique_engines_for(
        &self,
        choices: &[RetrieverEngineChoice],
    ) -> Vec<Arc<dyn RetrievalEngine>> {
        let mut seen: Vec<Arc<dyn RetrievalEngine>> = Vec::new();
        for (_, engine) in self.engines_for(choices) {
            if !seen
                .iter()
                .any(|existing| existing.engine_type() == engine.engine_type())
            {
                seen.push(engine);
            }
        }
        seen
    }

    /// Fan an index write out to every engine the tenant configured. A
    /// failing engine aborts the write; prior engines' writes for the same
    /// chunk set are rolled back with best-effort compensating deletes.
    pub async fn index_chunks(
        &self,
        choices: &[RetrieverEngineChoice],
        entries: &[IndexEntry],
        dimension: usize,
    ) -> Result<(), AppError> {
        let engines = self.unique_engines_for(choices);
        let mut written: Vec<Arc<dyn RetrievalEngine>> = Vec::new();

        for engine in engines {
            if let Err(err) = engine.batch_save(entries).await {
                warn!(
                    engine = engine.engine_type(),
                    error = %err,
                    "Index write failed; rolling back prior engines"
                );
                let chunk_ids: Vec<String> =
                    entries.iter().map(|entry| entry.chunk_id.clone()).collect();
                for done in &written {
                    if let Err(cleanup_err) =
                        done.delete_by_chunk_ids(&chunk_ids, dimension).await
                    {
                        warn!(
                            engine = done.engine_type(),
                            error = %cleanup_err,
                            "Compensating delete failed"
                        );
                    }
                }
                return Err(err);
            }
            written.push(engine);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{RetrieveParams, RetrieveResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyEngine {
        name: &'static str,
        fail_saves: bool,
        saves: AtomicUsize,
        deletes: AtomicUsize,
    }

    impl FlakyEngine {
        fn new(name: &'static str, fail_saves: bool) -> Self {
            Self {
                name,
                fail_saves,
                saves: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl RetrievalEngine for FlakyEngine {
        fn engine_type(&self) -> &'static str {
            self.name
        }

        fn supports(&self) -> &[RetrieverType] {
            &[RetrieverType::Vector, RetrieverType::Keyword]
        }

        async fn save(&self, _entry: &IndexEntry) -> Result<(), AppError> {
            Ok(())
        }

        async fn batch_save(&self, _entries: &[IndexEntry]) -> Result<(), AppError> {
            if self.fail_saves {
                return Err(AppError::Upstream("engine unavailable".into()));
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_by_chunk_ids(
            &self,
            _chunk_ids: &[String],
            _dimension: usize,
        ) -> Result<(), AppError> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_by_knowledge_ids(
            &self,
            _knowledge_ids: &[String],
            _dimension: usize,
        ) -> Result<(), AppError> {
            Ok(())
        }

        async fn copy_indices(
            &self,
            _src_kb_id: &str,
            _dst_kb_id: &str,
            _chunk_id_map: &std::collections::HashMap<String, String>,
            _knowledge_id_map: &std::collections::HashMap<String, String>,
            _dimension: usize,
        ) -> Result<(), AppError> {
            Ok(())
        }

        async fn retrieve(
            &self,
            _params: &RetrieveParams,
        ) -> Result<Vec<RetrieveResult>, AppError> {
            Ok(Vec::new())
        }
    }

    fn choices_for(engines: &[&str]) -> Vec<RetrieverEngineChoice> {
        engines
            .iter()
            .map(|engine| RetrieverEngineChoice {
                retriever_type: RetrieverType::Vector,
                engine_type: (*engine).to_string(),
            })
            .collect()
    }

    fn test_entry() -> IndexEntry {
        IndexEntry {
            chunk_id: "c1".to_string(),
            kb_id: "kb".to_string(),
            knowledge_id: "k1".to_string(),
            chunk_index: 0,
            content: "body".to_string(),
            embedding: None,
        }
    }

    #[tokio::test]
    async fn engines_for_drops_unknown_engine_types() {
        let registry =
            EngineRegistry::with_engines(vec![Arc::new(FlakyEngine::new("alpha", false))]);

        let pairs = registry.engines_for(&choices_for(&["alpha", "missing"]));
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1.engine_type(), "alpha");
    }

    #[tokio::test]
    async fn index_chunks_rolls_back_prior_engines_on_failure() {
        let healthy = Arc::new(FlakyEngine::new("alpha", false));
        let broken = Arc::new(FlakyEngine::new("beta", true));
        let registry = EngineRegistry::with_engines(vec![
            Arc::clone(&healthy) as Arc<dyn RetrievalEngine>,
            Arc::clone(&broken) as Arc<dyn RetrievalEngine>,
        ]);

        // "alpha" sorts before "beta" in choice order, so it writes first.
        let result = registry
            .index_chunks(&choices_for(&["alpha", "beta"]), &[test_entry()], 3)
            .await;

        assert!(matches!(result, Err(AppError::Upstream(_))));
        assert_eq!(healthy.saves.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(broken.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn index_chunks_writes_all_engines_on_success() {
        let first = Arc::new(FlakyEngine::new("alpha", false));
        let second = Arc::new(FlakyEngine::new("beta", false));
        let registry = EngineRegistry::with_engines(vec![
            Arc::clone(&first) as Arc<dyn RetrievalEngine>,
            Arc::clone(&second) as Arc<dyn RetrievalEngine>,
        ]);

        registry
            .index_chunks(&choices_for(&["alpha", "beta"]), &[test_entry()], 3)
            .await
            .expect("fan-out succeeds");

        assert_eq!(first.saves.load(Ordering::SeqCst), 1);
        assert_eq!(second.saves.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unique_engines_deduplicates_shared_backends() {
        let engine = Arc::new(FlakyEngine::new("alpha", false));
        let registry =
            EngineRegistry::with_engines(vec![Arc::clone(&engine) as Arc<dyn RetrievalEngine>]);

        let choices = vec![
            RetrieverEngineChoice {
                retriever_type: RetrieverType::Vector,
                engine_type: "alpha".to_string(),
            },
            RetrieverEngineChoice {
                retriever_type: RetrieverType::Keyword,
                engine_type: "alpha".to_string(),
            },
        ];

        assert_eq!(registry.unique_engines_for(&choices).len(), 1);
    }
}
