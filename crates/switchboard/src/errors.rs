use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};
use thiserror::Error;

/// Classification of a provider failure, shared by every adapter so that
/// retry and failover never need to know which vendor produced the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Connection resets, timeouts and 5xx responses
    Transient,
    /// Rejected or missing credentials
    Auth,
    /// Quota or rate limiting, possibly with a server supplied retry hint
    RateLimit,
    /// The request was refused because of its content
    ContentPolicy,
    /// Anything else; never retried
    Fatal,
}

#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind} error from {provider}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub provider: String,
    pub message: String,
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new<P: Into<String>, M: Into<String>>(
        kind: ProviderErrorKind,
        provider: P,
        message: M,
    ) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn transient<P: Into<String>, M: Into<String>>(provider: P, message: M) -> Self {
        Self::new(ProviderErrorKind::Transient, provider, message)
    }

    pub fn auth<P: Into<String>, M: Into<String>>(provider: P, message: M) -> Self {
        Self::new(ProviderErrorKind::Auth, provider, message)
    }

    pub fn rate_limit<P: Into<String>, M: Into<String>>(
        provider: P,
        message: M,
        retry_after: Option<Duration>,
    ) -> Self {
        Self {
            retry_after,
            ..Self::new(ProviderErrorKind::RateLimit, provider, message)
        }
    }

    pub fn content_policy<P: Into<String>, M: Into<String>>(provider: P, message: M) -> Self {
        Self::new(ProviderErrorKind::ContentPolicy, provider, message)
    }

    pub fn fatal<P: Into<String>, M: Into<String>>(provider: P, message: M) -> Self {
        Self::new(ProviderErrorKind::Fatal, provider, message)
    }

    /// Errors raised when a stream ends in the middle of a message.
    pub fn truncated<P: Into<String>>(provider: P) -> Self {
        Self::transient(provider, "stream ended before the message was complete")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolErrorKind {
    /// Arguments did not match the declared schema or could not be parsed
    Validation,
    Timeout,
    Execution,
    /// The tool (or the server hosting it) could not be reached
    Unavailable,
    NotFound,
    Cancelled,
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Deserialize, Serialize)]
#[error("{kind} error: {message}")]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new<M: Into<String>>(kind: ToolErrorKind, message: M) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation<M: Into<String>>(message: M) -> Self {
        Self::new(ToolErrorKind::Validation, message)
    }

    pub fn timeout<M: Into<String>>(message: M) -> Self {
        Self::new(ToolErrorKind::Timeout, message)
    }

    pub fn execution<M: Into<String>>(message: M) -> Self {
        Self::new(ToolErrorKind::Execution, message)
    }

    pub fn unavailable<M: Into<String>>(message: M) -> Self {
        Self::new(ToolErrorKind::Unavailable, message)
    }

    pub fn not_found<M: Into<String>>(name: M) -> Self {
        Self::new(ToolErrorKind::NotFound, format!("no tool named {}", name.into()))
    }

    pub fn cancelled() -> Self {
        Self::new(ToolErrorKind::Cancelled, "tool call was cancelled")
    }
}

pub type ToolResult<T> = Result<T, ToolError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Message {0} already exists")]
    Duplicate(String),

    #[error("Parent message {0} not found")]
    MissingParent(String),

    #[error("Message {0} not found")]
    MissingMessage(String),

    #[error("Storage failure: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("The assistant draft was already finalized")]
    AlreadyFinalized,

    #[error("No assistant draft is open")]
    NoOpenDraft,

    #[error("An assistant draft is still open")]
    DraftOpen,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimeoutScope {
    Provider,
    Tool,
    Turn,
}

/// Reasons a turn ends in the failed (or cancelled) state.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Tool call budget exhausted before any output was produced")]
    BudgetExhausted,

    #[error("Provider stream was truncated: {0}")]
    TruncatedStream(String),

    #[error("{0} timeout exceeded")]
    Timeout(TimeoutScope),

    #[error("Turn was cancelled")]
    Cancelled,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Stable machine readable code sent to clients with the terminal error event.
    pub fn code(&self) -> String {
        match self {
            OrchestratorError::BudgetExhausted => "budget_exhausted".to_string(),
            OrchestratorError::TruncatedStream(_) => "truncated_stream".to_string(),
            OrchestratorError::Timeout(scope) => format!("{}_timeout", scope),
            OrchestratorError::Cancelled => "cancelled".to_string(),
            OrchestratorError::Provider(error) => format!("provider_{}", error.kind),
            OrchestratorError::State(_) | OrchestratorError::Store(_) => "internal".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_display() {
        let error = ProviderError::rate_limit("openai", "slow down", Some(Duration::from_secs(2)));
        assert_eq!(error.to_string(), "rate_limit error from openai: slow down");
        assert_eq!(error.retry_after, Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_provider_error_serializes_kind_in_snake_case() {
        let error = ProviderError::content_policy("anthropic", "refused");
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["kind"], "content_policy");
        assert!(value.get("retry_after").is_none());
    }

    #[test]
    fn test_orchestrator_error_codes() {
        assert_eq!(
            OrchestratorError::Timeout(TimeoutScope::Provider).code(),
            "provider_timeout"
        );
        assert_eq!(
            OrchestratorError::Provider(ProviderError::auth("openai", "bad key")).code(),
            "provider_auth"
        );
        assert_eq!(OrchestratorError::BudgetExhausted.code(), "budget_exhausted");
    }

    #[test]
    fn test_tool_error_constructors() {
        let error = ToolError::not_found("weather");
        assert_eq!(error.kind, ToolErrorKind::NotFound);
        assert_eq!(error.to_string(), "not_found error: no tool named weather");
    }
}
