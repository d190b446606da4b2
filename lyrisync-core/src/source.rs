//! Event source abstraction used by the background timers.

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Connection lifecycle as seen from outside the event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A push-style source of playback events.
///
/// The connection manager implements this so the clock-sync timer and the
/// playback watchdog can drive it without knowing the transport.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Returns a human-readable name for this source.
    fn name(&self) -> &'static str;

    /// Current connection state.
    async fn status(&self) -> ConnectionStatus;

    /// Ask the peer for its current time. The reply arrives asynchronously.
    ///
    /// # Errors
    ///
    /// Returns an error if the source is not connected or the send fails.
    async fn request_time_sync(&self) -> Result<()>;

    /// Start a connection attempt unless one is open, in flight, or the
    /// retry delay of a previous failure has not elapsed yet.
    ///
    /// Returns `Ok(true)` when this call established the connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the attempt made by this call failed.
    async fn ensure_connected(&self) -> Result<bool>;

    /// Get the cancellation token for this source.
    fn cancel_token(&self) -> CancellationToken;

    /// Signal the source to stop.
    fn stop(&self) {
        self.cancel_token().cancel();
    }
}
