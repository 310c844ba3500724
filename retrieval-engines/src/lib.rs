pub mod engine;
pub mod hybrid;
pub mod registry;
pub mod scoring;
pub mod surreal;

pub use engine::{IndexEntry, RetrievalEngine, RetrieveParams, RetrieveResult};
pub use hybrid::{hybrid_search, HybridSearchParams};
pub use registry::EngineRegistry;
