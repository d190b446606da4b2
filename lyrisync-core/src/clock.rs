//! Server/local clock offset estimation.

use crate::source::{ConnectionStatus, EventSource};
use crate::time::LocalClock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How often a fresh time sync is requested while connected
pub const CLOCK_SYNC_INTERVAL: Duration = Duration::from_secs(10);

/// Tracks `server_time - local_time` from the most recent time-sync reply.
///
/// Replies are not correlated with requests: whichever reply arrived last
/// defines the offset. Before the first reply the offset is zero.
pub struct ClockSync {
    local: Arc<dyn LocalClock>,
    offset_ms: AtomicI64,
}

impl ClockSync {
    #[must_use]
    pub fn new(local: Arc<dyn LocalClock>) -> Self {
        Self {
            local,
            offset_ms: AtomicI64::new(0),
        }
    }

    /// Current best-known offset in milliseconds
    #[must_use]
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    /// Local wall-clock time in milliseconds
    #[must_use]
    pub fn local_now_ms(&self) -> i64 {
        self.local.now_ms()
    }

    /// Estimated server time in milliseconds
    #[must_use]
    pub fn server_now_ms(&self) -> i64 {
        self.local.now_ms() + self.offset_ms()
    }

    /// Record a time-sync reply carrying the server's timestamp.
    pub fn handle_reply(&self, server_timestamp_ms: i64) {
        let offset = server_timestamp_ms - self.local.now_ms();
        let previous = self.offset_ms.swap(offset, Ordering::AcqRel);
        if previous == offset {
            debug!("Clock offset unchanged at {}ms", offset);
        } else {
            debug!("Clock offset updated: {}ms -> {}ms", previous, offset);
        }
    }

    /// Request a time sync every [`CLOCK_SYNC_INTERVAL`] while `source` is
    /// connected, until cancelled.
    pub async fn run_sync_timer(&self, source: &dyn EventSource, cancel_token: CancellationToken) {
        info!("Clock sync timer started for {}", source.name());
        let start = tokio::time::Instant::now() + CLOCK_SYNC_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, CLOCK_SYNC_INTERVAL);

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!("Clock sync timer shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if source.status().await != ConnectionStatus::Connected {
                        continue;
                    }
                    if let Err(e) = source.request_time_sync().await {
                        debug!("Time sync request failed: {}", e);
                    }
                }
            }
        }
    }
}
