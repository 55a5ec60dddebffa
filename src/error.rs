//! Error types for the orchestration core.
//!
//! Every subsystem has its own `thiserror` enum. All of them collapse onto
//! the flat [`ErrorKind`] taxonomy, whose string identifiers are what ends up
//! in the `error_code` field of agent runs and in structured log fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retrieval::EmbeddingError;
use crate::tools::ToolError;
use crate::watcher::WatcherError;

/// Flat error taxonomy shared by every component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Network,
    LlmConnection,
    LlmResponse,
    RateLimit,
    ToolError,
    Validation,
    NotFound,
    Retrieval,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Stable identifier used in `error_code` fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Network => "network",
            Self::LlmConnection => "llm_connection",
            Self::LlmResponse => "llm_response",
            Self::RateLimit => "rate_limit",
            Self::ToolError => "tool_error",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Retrieval => "retrieval",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }

    /// Kind-level default. Tool errors decide case by case through
    /// [`ToolError::is_retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network | Self::LlmConnection | Self::RateLimit)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration errors. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("No model profile resolves task type '{0}'")]
    Unresolvable(String),

    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Service '{service}' could not be built: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

/// Errors from LLM providers.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Request to {provider} failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Request to {provider} timed out after {after:?}")]
    Timeout { provider: String, after: Duration },

    #[error("Rate limited by {provider}, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Authentication failed for {provider}")]
    AuthFailed { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Context too long for {provider}")]
    ContextTooLong { provider: String },
}

impl LlmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RequestFailed { .. } | Self::Timeout { .. } => ErrorKind::LlmConnection,
            Self::RateLimited { .. } => ErrorKind::RateLimit,
            Self::AuthFailed { .. } => ErrorKind::Config,
            Self::InvalidResponse { .. } | Self::ContextTooLong { .. } => ErrorKind::LlmResponse,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Errors from the relational store.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Pool(_) => ErrorKind::Network,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Constraint(_) => ErrorKind::Validation,
            Self::Query(_) | Self::Migration(_) | Self::Serialization(_) => ErrorKind::Internal,
        }
    }
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(e.to_string())
    }
}

impl From<tokio_postgres::Error> for DatabaseError {
    fn from(e: tokio_postgres::Error) -> Self {
        if let Some(db) = e.as_db_error() {
            if db.code() == &tokio_postgres::error::SqlState::UNIQUE_VIOLATION {
                return DatabaseError::Constraint(db.message().to_string());
            }
        }
        DatabaseError::Query(e.to_string())
    }
}

/// Errors from the retrieval store.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Vector store unavailable: {0}")]
    Unavailable(String),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Answer generation failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid partition: {0}")]
    InvalidPartition(String),
}

impl RetrievalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Llm(e) => e.kind(),
            Self::InvalidPartition(_) => ErrorKind::Validation,
            _ => ErrorKind::Retrieval,
        }
    }
}

/// Errors from the content processing pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Stage {stage} failed: {reason}")]
    Stage {
        stage: String,
        reason: String,
        retryable: bool,
    },

    #[error("Stage {stage} timed out after {after:?}")]
    Timeout { stage: String, after: Duration },

    #[error("Processing cancelled")]
    Cancelled,

    #[error("Content item not found: {0}")]
    ItemNotFound(i64),

    #[error("Invalid content reference: {0}")]
    InvalidReference(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Stage { retryable: true, .. } | Self::Timeout { .. } => ErrorKind::Network,
            Self::Stage { .. } => ErrorKind::Internal,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ItemNotFound(_) => ErrorKind::NotFound,
            Self::InvalidReference(_) => ErrorKind::Validation,
            Self::Database(e) => e.kind(),
            Self::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Stage { retryable, .. } => *retryable,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }
}

/// Errors surfaced by the agent before a run starts.
///
/// Failures during a run are reported in-payload through `error_code`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid task: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

/// Top-level error for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(e) => e.kind(),
            Self::Llm(e) => e.kind(),
            Self::Tool(e) => e.kind(),
            Self::Database(e) => e.kind(),
            Self::Retrieval(e) => e.kind(),
            Self::Pipeline(e) => e.kind(),
            Self::Agent(e) => e.kind(),
            Self::Watcher(e) => e.kind(),
            Self::Validation(_) => ErrorKind::Validation,
            Self::Io(_) => ErrorKind::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
