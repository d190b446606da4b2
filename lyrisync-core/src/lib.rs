pub mod clock;
pub mod config;
pub mod error;
pub mod lrc;
pub mod paths;
pub mod playback;
pub mod provider;
pub mod repository;
pub mod scheduler;
pub mod source;
pub mod time;
pub mod tracker;

pub use clock::{ClockSync, CLOCK_SYNC_INTERVAL};
pub use config::{
    LoggingConfig, LyrisyncConfig, ServerConfig, SessionConfig, CONFIG_TEMPLATE,
    DEFAULT_LISTEN_URL, DEFAULT_LYRICS_URL,
};

pub use error::{CoreError, Result};
pub use lrc::{LyricLine, LyricSheet};
pub use paths::{
    config_dir, config_path, log_file_path, CONFIG_DIR_NAME, CONFIG_FILE_NAME, LOG_FILE_NAME,
};
pub use playback::{PlaybackState, StatusUpdate};
pub use provider::LyricsProvider;
pub use repository::{LyricsRepository, FETCH_TIMEOUT};
pub use scheduler::{LineCursor, LineScheduler, LineSink, SCHEDULER_TICK};
pub use source::{ConnectionStatus, EventSource};
pub use time::{DurationExt, LocalClock, SystemClock};
pub use tracker::{PauseReason, PlaybackTracker, SyncEvent, STALE_THRESHOLD, WATCHDOG_INTERVAL};
