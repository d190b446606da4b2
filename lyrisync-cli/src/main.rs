mod args;

use crate::args::{CliArgs, USAGE};
use lyrisync_core::{
    ClockSync, CoreError, LineSink, LyricsRepository, LyrisyncConfig, PlaybackTracker, SyncEvent,
    SystemClock,
};
use lyrisync_listen::{ListenClient, ListenOptions};
use lyrisync_lyrics_met::MetLyricsProvider;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() {
    let args = match CliArgs::from_env() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };
    if args.help {
        print!("{USAGE}");
        return;
    }

    let config_path = args.config_path();
    init_tracing(check_file_logging_enabled(&config_path));

    // Load config or create template on first run
    let mut config = match LyrisyncConfig::load_or_create_at(&config_path) {
        Ok(config) => config,
        Err(e @ CoreError::ConfigNotFound { .. }) if args.session.is_none() => {
            info!("{e}");
            std::process::exit(0);
        }
        Err(CoreError::ConfigNotFound { .. }) => {
            // Template was just written; the session comes from the command line
            match LyrisyncConfig::load_or_create_at(&config_path) {
                Ok(config) => config,
                Err(e) => {
                    error!("{e}");
                    std::process::exit(1);
                }
            }
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };
    args.apply(&mut config);

    if let Err(e) = config.validate() {
        error!("{e}");
        std::process::exit(1);
    }

    // Create tokio runtime for background tasks
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    // Create shared cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();

    // Set up Ctrl+C handler to trigger graceful shutdown
    let ctrlc_token = cancel_token.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received Ctrl+C, shutting down gracefully...");
        ctrlc_token.cancel();
    }) {
        error!("Failed to set Ctrl+C handler: {}", e);
    }

    if let Err(e) = runtime.block_on(run(&config, cancel_token)) {
        error!("{e}");
        std::process::exit(1);
    }
}

/// Wire the lyric pipeline together and run until cancelled.
async fn run(config: &LyrisyncConfig, cancel_token: CancellationToken) -> Result<(), CoreError> {
    let provider = Arc::new(MetLyricsProvider::from_config(config)?);
    let repository = Arc::new(LyricsRepository::new(provider));
    let clock = Arc::new(ClockSync::new(Arc::new(SystemClock)));
    let sink: Arc<dyn LineSink> = Arc::new(|text: &str| println!("\u{266a} {text}"));

    let tracker = PlaybackTracker::new(
        clock.clone(),
        repository,
        sink,
        Some(cancel_token.clone()),
    );
    let client = ListenClient::new(
        ListenOptions::from_config(config),
        clock,
        tracker.clone(),
        Some(cancel_token.clone()),
    );

    tokio::spawn(log_sync_events(tracker.subscribe(), cancel_token));

    // Returns once the connection is closed and every timer has stopped
    client.run().await;
    Ok(())
}

async fn log_sync_events(mut rx: broadcast::Receiver<SyncEvent>, cancel_token: CancellationToken) {
    loop {
        let event = tokio::select! {
            () = cancel_token.cancelled() => break,
            event = rx.recv() => event,
        };

        match event {
            Ok(SyncEvent::TrackChanged { song_id }) => info!("Now playing {:?}", song_id),
            Ok(SyncEvent::PlaybackResumed { song_id }) => debug!("Resumed {:?}", song_id),
            Ok(SyncEvent::PlaybackPaused { reason }) => debug!("Paused ({:?})", reason),
            Ok(SyncEvent::LyricsLoaded { song_id, lines }) => {
                info!("Lyrics loaded for {}: {} lines", song_id, lines);
            }
            Ok(SyncEvent::LyricsUnavailable { song_id }) => {
                warn!("No lyrics for {}", song_id);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Event logger lagged, skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Peek at `logging.file` before the full config load so the file layer
/// can be installed first.
fn check_file_logging_enabled(config_path: &Path) -> bool {
    // Minimal structs to parse just the logging.file field
    #[derive(serde::Deserialize)]
    struct PartialConfig {
        #[serde(default)]
        logging: PartialLoggingConfig,
    }
    #[derive(serde::Deserialize, Default)]
    struct PartialLoggingConfig {
        #[serde(default)]
        file: bool,
    }

    let Ok(content) = std::fs::read_to_string(config_path) else {
        return false;
    };

    toml::from_str::<PartialConfig>(&content)
        .map(|c| c.logging.file)
        .unwrap_or(false)
}

/// Initialize tracing with stderr output and optional file logging
fn init_tracing(file_logging_enabled: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tungstenite=warn"));

    // Lyrics own stdout
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    if file_logging_enabled {
        let log_path = lyrisync_core::paths::log_file_path();

        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        match File::create(&log_path) {
            Ok(file) => {
                let file_layer = tracing_subscriber::fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt_layer)
                    .with(file_layer)
                    .init();

                return;
            }
            Err(e) => {
                eprintln!("Failed to create log file at {}: {e}", log_path.display());
            }
        }
    }

    // Fallback: console only
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
