use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Authorization error: {0}")]
    Auth(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Duplicate: {0}")]
    Duplicate(String),
    #[error("Upstream service error: {0}")]
    Upstream(String),
    #[error("Retrieval failed: {0}")]
    Retrieval(String),
    #[error("Template parse error: {0}")]
    TemplateParse(String),
    #[error("Template execute error: {0}")]
    TemplateExecute(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Internal service error: {0}")]
    Internal(String),
}

impl AppError {
    /// True for faults that a bounded retry may clear (network, 5xx, timeouts).
    /// Authentication and other 4xx responses are permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Reqwest(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err
                        .status()
                        .is_some_and(|status| status.is_server_error())
            }
            Self::OpenAI(err) => matches!(
                err,
                OpenAIError::Reqwest(_) | OpenAIError::StreamError(_)
            ),
            Self::Upstream(_) => true,
            _ => false,
        }
    }
}
