//! Proxy client error types.

use thiserror::Error;

/// Proxy client error type.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Inbound frame could not be decoded
    #[error("Invalid frame: {0}")]
    Decode(String),

    /// Connection lost or refused
    #[error("Connection error: {0}")]
    Connection(String),

    /// The socket was closed while the operation was in flight
    #[error("Connection closed")]
    Closed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Proxy URL could not be parsed
    #[error("Invalid proxy URL: {0}")]
    Url(#[from] url::ParseError),
}

impl ProxyError {
    /// Whether this error means the socket is gone and the session should reconnect.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::WebSocket(_) | Self::Connection(_) | Self::Closed
        )
    }
}

/// Result type alias using ProxyError.
pub type ProxyResult<T> = Result<T, ProxyError>;
