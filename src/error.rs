//! Errors raised at the collaborator boundaries.
//!
//! Neither type escapes the core's public operations: they are logged and turned
//! into "no data" results by the callers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("graphql error: {0}")]
    GraphQl(String),

    #[error("response had no data")]
    MissingData,

    #[error("no api endpoint configured")]
    NotConfigured,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket went away; the caller is expected to resubscribe.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("transport not connected")]
    NotConnected,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::ConnectionClosed(_))
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
