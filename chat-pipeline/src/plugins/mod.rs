mod chat_stream;
mod embed;
mod merge;
mod persist;
mod preprocess;
mod prompt;
mod rerank;
mod retrieve;
mod rewrite;

pub use chat_stream::ChatStreamPlugin;
pub use embed::EmbedQueryPlugin;
pub use merge::MergeResultPlugin;
pub use persist::PersistPlugin;
pub use preprocess::PreprocessQueryPlugin;
pub use prompt::IntoChatMessagePlugin;
pub use rerank::RerankPlugin;
pub use retrieve::RetrievePlugin;
pub use rewrite::RewriteQueryPlugin;
