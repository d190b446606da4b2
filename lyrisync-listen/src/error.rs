use lyrisync_core::CoreError;
use thiserror::Error;

/// Errors raised by the listen-together connection.
#[derive(Debug, Error)]
pub enum ListenError {
    /// Websocket handshake, send or receive failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The TLS connector could not be built.
    #[error("TLS setup failed: {0}")]
    Tls(#[from] native_tls::Error),

    /// A message could not be encoded or decoded.
    #[error("invalid message: {0}")]
    Decode(#[from] serde_json::Error),

    /// No connection is open.
    #[error("not connected")]
    NotConnected,

    /// The websocket handshake did not finish in time.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// The server closed the connection.
    #[error("connection closed by server")]
    Closed,
}

impl From<ListenError> for CoreError {
    fn from(err: ListenError) -> Self {
        Self::Transport {
            reason: err.to_string(),
        }
    }
}

/// Convenience type alias for Results with `ListenError`.
pub type Result<T> = std::result::Result<T, ListenError>;
