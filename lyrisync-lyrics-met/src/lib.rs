use async_trait::async_trait;
use lyrisync_core::{CoreError, LyricsProvider, LyrisyncConfig};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use std::time::Duration;
use tracing::{debug, info, warn};

const PROVIDER_NAME: &str = "met";

/// Timeout for a single HTTP request (5 seconds)
const DEFAULT_TIMEOUT_SECS: u64 = 5;
/// Retries after a transient failure
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Lyric sheet provider backed by the music server's `songlyric_get` endpoint
pub struct MetLyricsProvider {
    client: ClientWithMiddleware,
    base_url: String,
}

impl MetLyricsProvider {
    /// Create a provider for `base_url` with a 5-second timeout and 2 retries.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, accept_invalid_certs: bool) -> Result<Self, CoreError> {
        let base_url = base_url.into();
        if accept_invalid_certs {
            warn!(
                "TLS certificate and hostname verification disabled for {}",
                base_url
            );
        }

        let base_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .user_agent(concat!("lyrisync/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()?;

        // Wrap with retry middleware (exponential backoff)
        let retry_policy =
            ExponentialBackoff::builder().build_with_max_retries(DEFAULT_MAX_RETRIES);
        let client = ClientBuilder::new(base_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { client, base_url })
    }

    /// Create a provider from the `[server]` section of the config.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn from_config(config: &LyrisyncConfig) -> Result<Self, CoreError> {
        Self::new(
            config.server.lyrics_url.clone(),
            config.server.accept_invalid_certs,
        )
    }

    fn lyric_url(&self, song_id: &str) -> String {
        format!(
            "{}?show=lyric&mid={}",
            self.base_url,
            urlencoding::encode(song_id)
        )
    }

    fn failure(song_id: &str, reason: impl Into<String>) -> CoreError {
        CoreError::LyricsProviderFailed {
            provider: PROVIDER_NAME.to_string(),
            song_id: song_id.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl LyricsProvider for MetLyricsProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn fetch(&self, song_id: &str) -> Result<String, CoreError> {
        if song_id.is_empty() {
            return Err(Self::failure(song_id, "empty song id"));
        }

        let url = self.lyric_url(song_id);
        debug!("GET {}", url);

        let response = self.client.get(&url).send().await.map_err(|e| match e {
            reqwest_middleware::Error::Reqwest(e) => CoreError::NetworkError(e),
            reqwest_middleware::Error::Middleware(e) => Self::failure(song_id, e.to_string()),
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!("Lyrics request for {} returned status: {}", song_id, status);
            return Err(Self::failure(song_id, format!("HTTP {}", status.as_u16())));
        }

        let body = response.text().await?;
        info!("Fetched lyrics for {} ({} bytes)", song_id, body.len());
        Ok(body)
    }
}
