//! Model endpoint seam.
//!
//! A [`ModelClient`] turns ticket text into raw model output. It is pure
//! request/response: no retries, no state across calls. The worker owns
//! retry policy because it has to bound and record attempts per item.
//!
//! [`OllamaClient`] talks to a locally hosted Ollama-style `/api/generate`
//! endpoint.

pub mod ollama;
pub mod prompt;

use async_trait::async_trait;

pub use ollama::OllamaClient;
pub use prompt::PromptTemplate;

/// How a model call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallFailureKind {
    Timeout,
    ConnectionError,
    /// Non-success status, or a body that is not the expected shape.
    ServerError,
}

impl std::fmt::Display for CallFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CallFailureKind::Timeout => "timeout",
            CallFailureKind::ConnectionError => "connection error",
            CallFailureKind::ServerError => "server error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct CallFailure {
    pub kind: CallFailureKind,
    pub message: String,
}

impl CallFailure {
    pub fn new(kind: CallFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(CallFailureKind::Timeout, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(CallFailureKind::ConnectionError, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(CallFailureKind::ServerError, message)
    }
}

/// Send ticket text to a model and return its raw reply.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn analyze(&self, ticket_text: &str) -> Result<String, CallFailure>;
}

#[async_trait]
impl<T: ModelClient + ?Sized> ModelClient for std::sync::Arc<T> {
    async fn analyze(&self, ticket_text: &str) -> Result<String, CallFailure> {
        (**self).analyze(ticket_text).await
    }
}
