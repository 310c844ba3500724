use std::fmt;

use serde::{Deserialize, Serialize};

/// Query mode an engine can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieverType {
    Vector,
    Keyword,
}

impl fmt::Display for RetrieverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetrieverType::Vector => f.write_str("vector"),
            RetrieverType::Keyword => f.write_str("keyword"),
        }
    }
}

/// Origin of a retrieval result as reported back to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Vector,
    Keyword,
    Hybrid,
}

impl From<RetrieverType> for MatchType {
    fn from(value: RetrieverType) -> Self {
        match value {
            RetrieverType::Vector => MatchType::Vector,
            RetrieverType::Keyword => MatchType::Keyword,
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchType::Vector => f.write_str("vector"),
            MatchType::Keyword => f.write_str("keyword"),
            MatchType::Hybrid => f.write_str("hybrid"),
        }
    }
}

/// One (retriever-type, engine-type) pair a tenant has opted into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieverEngineChoice {
    pub retriever_type: RetrieverType,
    pub engine_type: String,
}
