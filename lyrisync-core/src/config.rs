use crate::error::{CoreError, Result};
use crate::paths;
use const_format::concatcp;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Default websocket endpoint of the listen-together event channel
pub const DEFAULT_LISTEN_URL: &str = "wss://music.met6.top:444/api-client/ws/listen";

/// Default lyric sheet endpoint
pub const DEFAULT_LYRICS_URL: &str = "https://music.met6.top:444/api/songlyric_get.php";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LyrisyncConfig {
    pub session: SessionConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session identity to subscribe to
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_url")]
    pub listen_url: String,
    #[serde(default = "default_lyrics_url")]
    pub lyrics_url: String,
    /// Skip TLS certificate and hostname verification for both endpoints.
    /// Must be opted into explicitly.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_listen_url() -> String {
    DEFAULT_LISTEN_URL.to_string()
}

fn default_lyrics_url() -> String {
    DEFAULT_LYRICS_URL.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_url: default_listen_url(),
            lyrics_url: default_lyrics_url(),
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write logs to ~/.config/lyrisync/lyrisync.log
    #[serde(default)]
    pub file: bool,
}

/// Config file written on first run
pub const CONFIG_TEMPLATE: &str = concatcp!(
    r#"[session]
# Required: the listen-together session to follow
id = ""

[server]
listen_url = ""#,
    DEFAULT_LISTEN_URL,
    r#""
lyrics_url = ""#,
    DEFAULT_LYRICS_URL,
    r#""
# The default server presents a certificate that does not verify.
# Setting this to true disables certificate and hostname checks for both
# endpoints; only do so for a server you trust.
accept_invalid_certs = false

[logging]
# Also write logs to ~/.config/lyrisync/lyrisync.log
file = false
"#
);

impl LyrisyncConfig {
    /// Get the default config file path
    #[must_use]
    pub fn config_path() -> PathBuf {
        paths::config_path()
    }

    /// Load the config from the default path, writing a template on first run.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigNotFound`] after creating the template, or
    /// an I/O or parse error.
    pub fn load_or_create() -> Result<Self> {
        Self::load_or_create_at(&Self::config_path())
    }

    /// Load the config from `path`, writing a template there if it is missing.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConfigNotFound`] after creating the template, or
    /// an I/O or parse error.
    pub fn load_or_create_at(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, CONFIG_TEMPLATE)?;
            info!("Created config template at {}", path.display());
            return Err(CoreError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate that required fields are present.
    ///
    /// # Errors
    ///
    /// Returns an error if required fields are missing or empty.
    pub fn validate(&self) -> Result<()> {
        if self.session.id.trim().is_empty() {
            return Err(CoreError::ConfigMissingField {
                field: "session.id".into(),
            });
        }
        for (field, url) in [
            ("server.listen_url", &self.server.listen_url),
            ("server.lyrics_url", &self.server.lyrics_url),
        ] {
            if url.trim().is_empty() {
                return Err(CoreError::ConfigMissingField {
                    field: field.into(),
                });
            }
        }
        if !self.server.listen_url.starts_with("ws://") && !self.server.listen_url.starts_with("wss://") {
            return Err(CoreError::ConfigInvalid {
                message: format!(
                    "server.listen_url must be a ws:// or wss:// URL, got {}",
                    self.server.listen_url
                ),
            });
        }
        Ok(())
    }
}
