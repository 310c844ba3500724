mod keyword;
mod vector;

pub use keyword::SurrealKeywordEngine;
pub use vector::SurrealVectorEngine;

pub const SURREAL_VECTOR: &str = "surreal_vector";
pub const SURREAL_KEYWORD: &str = "surreal_keyword";
