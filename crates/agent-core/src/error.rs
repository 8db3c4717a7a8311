//! Error Types
//!
//! Three layers of failure exist in the agent core:
//!
//! - [`ProviderError`]: a backend could not produce a reply (retried per policy)
//! - tool-level failures, which never surface here: the registry turns them
//!   into `ToolResult` messages the model can read (see [`crate::tool`])
//! - [`AgentError`]: everything that ends a turn or rejects a caller request

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Classification of a backend failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Backend unreachable or temporarily down
    Unavailable,
    /// Backend throttled the request
    RateLimited,
    /// Credentials rejected
    Authentication,
    /// History exceeds the model's context window
    ContextLengthExceeded,
    /// Requested model does not exist on the backend
    ModelNotSupported,
    /// Transport failure (timeout, connection reset, DNS)
    RequestFailed,
    /// Reply could not be interpreted under the provider protocol
    MalformedResponse,
    /// Any other backend-side failure
    Execution,
}

impl ProviderErrorKind {
    /// Whether failures of this kind are transient by default
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ProviderErrorKind::Unavailable
                | ProviderErrorKind::RateLimited
                | ProviderErrorKind::RequestFailed
        )
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ProviderErrorKind::Unavailable => "unavailable",
            ProviderErrorKind::RateLimited => "rate_limited",
            ProviderErrorKind::Authentication => "authentication",
            ProviderErrorKind::ContextLengthExceeded => "context_length_exceeded",
            ProviderErrorKind::ModelNotSupported => "model_not_supported",
            ProviderErrorKind::RequestFailed => "request_failed",
            ProviderErrorKind::MalformedResponse => "malformed_response",
            ProviderErrorKind::Execution => "execution",
        };
        f.write_str(label)
    }
}

/// A backend failure reported by [`crate::provider::LlmProvider::complete`]
#[derive(Error, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[error("provider error ({kind}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub retryable: bool,
    pub message: String,
}

impl ProviderError {
    /// Create an error with the kind's conventional retryability
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.is_transient(),
            message: message.into(),
        }
    }

    /// Override the retryability flag
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unavailable, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::MalformedResponse, message)
    }
}

/// Why a turn ended without a final answer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "provider_kind", rename_all = "snake_case")]
pub enum TurnErrorKind {
    /// Session ordering or pairing was broken
    InvariantViolation,
    /// The backend failed and retries (if any) were exhausted
    ProviderError(ProviderErrorKind),
    /// Too many think-act cycles in one turn
    IterationLimitExceeded,
    /// The caller raised the cancellation signal
    Cancelled,
}

impl std::fmt::Display for TurnErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnErrorKind::InvariantViolation => f.write_str("invariant_violation"),
            TurnErrorKind::ProviderError(kind) => write!(f, "provider_error:{kind}"),
            TurnErrorKind::IterationLimitExceeded => f.write_str("iteration_limit_exceeded"),
            TurnErrorKind::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Agent error types
#[derive(Error, Debug)]
pub enum AgentError {
    /// A message failed construction-time validation
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Session ordering/pairing rule broken
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Backend failure that escaped the retry policy
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A tool with the same name is already registered
    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    /// Invalid tool descriptor
    #[error("Invalid tool spec: {0}")]
    InvalidToolSpec(String),

    /// Maximum iterations reached in reasoning loop
    #[error("Maximum iterations ({0}) reached")]
    IterationLimitExceeded(usize),

    /// The turn was cancelled by the caller
    #[error("Turn cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    /// Turn-level classification of this error
    pub fn turn_kind(&self) -> TurnErrorKind {
        match self {
            AgentError::Provider(e) => TurnErrorKind::ProviderError(e.kind),
            AgentError::IterationLimitExceeded(_) => TurnErrorKind::IterationLimitExceeded,
            AgentError::Cancelled => TurnErrorKind::Cancelled,
            _ => TurnErrorKind::InvariantViolation,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Provider(e) if e.retryable)
    }

    /// Convert to a user-friendly message
    pub fn user_message(&self) -> String {
        match self {
            AgentError::Provider(e) => match e.kind {
                ProviderErrorKind::Unavailable | ProviderErrorKind::RequestFailed => {
                    "The AI service is currently unavailable. Please try again.".into()
                }
                ProviderErrorKind::RateLimited => {
                    "You've made too many requests. Please wait a moment.".into()
                }
                ProviderErrorKind::Authentication => {
                    "Authentication failed. Please check your credentials.".into()
                }
                ProviderErrorKind::ContextLengthExceeded => {
                    "The conversation is too long. Please start a new session.".into()
                }
                _ => format!("The AI service encountered an error: {}", e.message),
            },
            AgentError::IterationLimitExceeded(_) => {
                "The request took too long to process. Please try a simpler query.".into()
            }
            AgentError::Cancelled => "The request was cancelled.".into(),
            AgentError::DuplicateTool(name) => format!("The tool '{name}' is already registered."),
            _ => "An unexpected error occurred.".into(),
        }
    }
}
