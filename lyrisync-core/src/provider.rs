use crate::error::CoreError;
use async_trait::async_trait;

/// Trait for lyric sheet sources
#[async_trait]
pub trait LyricsProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &'static str;

    /// Fetch the raw time-tagged sheet for a song.
    ///
    /// Implementations return an error for any non-success response; an
    /// empty body is a valid (empty) sheet.
    async fn fetch(&self, song_id: &str) -> Result<String, CoreError>;
}
