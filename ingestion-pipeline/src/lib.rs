pub mod docreader;
pub mod pipeline;

pub use docreader::{DocChunk, DocReadRequest, DocReader, HttpDocReader};
pub use pipeline::IngestionPipeline;
