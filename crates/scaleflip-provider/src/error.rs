//! Provider error types.

use thiserror::Error;

/// Errors surfaced by a provider gateway.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("credential error: {0}")]
    Credential(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("operation on {target} ended in state {status}: {message}")]
    OperationFailed {
        target: String,
        status: String,
        message: String,
    },

    #[error("unexpected provider response: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;
