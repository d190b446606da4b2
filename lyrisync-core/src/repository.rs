//! In-memory lyric sheet repository.

use crate::error::{CoreError, Result};
use crate::lrc::LyricSheet;
use crate::provider::LyricsProvider;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Upper bound on a single `get` miss, provider retries included
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Caches parsed sheets by song id for the lifetime of the process.
///
/// Entries are never evicted or replaced. Failed fetches are not cached, so
/// the next `get` for the same song tries the provider again.
pub struct LyricsRepository {
    provider: Arc<dyn LyricsProvider>,
    sheets: RwLock<HashMap<String, Arc<LyricSheet>>>,
    timeout: Duration,
}

impl LyricsRepository {
    /// Create a repository backed by `provider` with the default fetch timeout
    #[must_use]
    pub fn new(provider: Arc<dyn LyricsProvider>) -> Self {
        Self::with_timeout(provider, FETCH_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(provider: Arc<dyn LyricsProvider>, timeout: Duration) -> Self {
        Self {
            provider,
            sheets: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Get the sheet for a song, fetching and parsing it on a cache miss.
    ///
    /// # Errors
    ///
    /// Returns the provider's error, or [`CoreError::LyricsTimeout`] when the
    /// provider does not answer within the timeout.
    pub async fn get(&self, song_id: &str) -> Result<Arc<LyricSheet>> {
        if let Some(sheet) = self.cached(song_id).await {
            debug!("Using cached lyrics for {}", song_id);
            return Ok(sheet);
        }

        info!("Fetching lyrics for {} from {}", song_id, self.provider.name());
        let raw = match tokio::time::timeout(self.timeout, self.provider.fetch(song_id)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                warn!("Lyrics fetch for {} failed: {}", song_id, e);
                return Err(e);
            }
            Err(_) => {
                warn!("Lyrics fetch for {} timed out after {:?}", song_id, self.timeout);
                return Err(CoreError::LyricsTimeout {
                    song_id: song_id.to_string(),
                });
            }
        };

        let sheet = Arc::new(LyricSheet::parse(song_id, raw));
        info!("Parsed {} lyric lines for {}", sheet.len(), song_id);

        // A concurrent miss may have won the race; keep the first sheet
        let mut sheets = self.sheets.write().await;
        let sheet = sheets
            .entry(song_id.to_string())
            .or_insert(sheet)
            .clone();
        Ok(sheet)
    }

    /// Look up a sheet without fetching.
    pub async fn cached(&self, song_id: &str) -> Option<Arc<LyricSheet>> {
        self.sheets.read().await.get(song_id).cloned()
    }

    /// Number of cached sheets
    pub async fn len(&self) -> usize {
        self.sheets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sheets.read().await.is_empty()
    }
}
