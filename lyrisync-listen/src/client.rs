//! Listen-together websocket connection manager.

use crate::error::{ListenError, Result};
use crate::protocol::{Inbound, Outbound};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use lyrisync_core::{
    ClockSync, ConnectionStatus, CoreError, EventSource, LyrisyncConfig, PlaybackTracker,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound for the websocket handshake
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay after a connect attempt made by the receive loop failed
pub const RETRY_AFTER_FAILED_CONNECT: Duration = Duration::from_secs(3);

/// Delay after an established connection dropped
pub const RETRY_AFTER_DROP: Duration = Duration::from_secs(1);

/// Delay after a connect attempt made by the watchdog failed
pub const RETRY_AFTER_WATCHDOG_CONNECT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Where to connect and which session to follow
#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub url: String,
    pub session_id: String,
    pub accept_invalid_certs: bool,
}

impl ListenOptions {
    #[must_use]
    pub fn from_config(config: &LyrisyncConfig) -> Self {
        Self {
            url: config.server.listen_url.clone(),
            session_id: config.session.id.clone(),
            accept_invalid_certs: config.server.accept_invalid_certs,
        }
    }
}

enum ConnState {
    Disconnected { retry_at: Option<Instant> },
    Connecting,
    Connected { sink: WsSink, link: CancellationToken },
}

impl ConnState {
    const fn status(&self) -> ConnectionStatus {
        match self {
            Self::Disconnected { .. } => ConnectionStatus::Disconnected,
            Self::Connecting => ConnectionStatus::Connecting,
            Self::Connected { .. } => ConnectionStatus::Connected,
        }
    }
}

struct Timers {
    watchdog: JoinHandle<()>,
    clock_sync: JoinHandle<()>,
}

impl Timers {
    fn is_running(&self) -> bool {
        !self.watchdog.is_finished() && !self.clock_sync.is_finished()
    }
}

/// Keeps a websocket open to the listen-together server and feeds its events
/// into the clock synchronizer and the playback tracker.
pub struct ListenClient {
    options: ListenOptions,
    clock: Arc<ClockSync>,
    tracker: Arc<PlaybackTracker>,
    state: tokio::sync::Mutex<ConnState>,
    /// Read half of a freshly opened connection, waiting for the receive loop
    pending: Mutex<Option<WsSource>>,
    state_changed: Notify,
    timers: Mutex<Option<Timers>>,
    cancel_token: CancellationToken,
}

impl ListenClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `options` - Server URL, session id and TLS posture
    /// * `clock` - Clock synchronizer fed by time replies
    /// * `tracker` - Playback tracker fed by status events
    /// * `cancel_token` - Optional external cancellation token for graceful shutdown
    #[must_use]
    pub fn new(
        options: ListenOptions,
        clock: Arc<ClockSync>,
        tracker: Arc<PlaybackTracker>,
        cancel_token: Option<CancellationToken>,
    ) -> Arc<Self> {
        if options.accept_invalid_certs {
            warn!(
                "TLS certificate and hostname verification disabled for {}",
                options.url
            );
        }

        Arc::new(Self {
            options,
            clock,
            tracker,
            state: tokio::sync::Mutex::new(ConnState::Disconnected { retry_at: None }),
            pending: Mutex::new(None),
            state_changed: Notify::new(),
            timers: Mutex::new(None),
            cancel_token: cancel_token.unwrap_or_default(),
        })
    }

    /// Start the receive loop in a background task
    #[must_use]
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run().await })
    }

    /// Connect, receive and reconnect until cancelled, then close the
    /// connection and stop every background task.
    pub async fn run(self: Arc<Self>) {
        info!("Listening to session {} at {}", self.options.session_id, self.options.url);

        loop {
            let pending = self
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(stream) = pending {
                self.ensure_timers();
                self.receive(stream).await;
                continue;
            }

            let attempt_at = self.next_attempt_at().await;
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                () = self.state_changed.notified() => continue,
                () = sleep_until(attempt_at) => {}
            }

            if let Err(e) = self.connect(RETRY_AFTER_FAILED_CONNECT).await {
                warn!(
                    "Connecting to {} failed, retrying in {:?}: {}",
                    self.options.url, RETRY_AFTER_FAILED_CONNECT, e
                );
            }
        }

        self.close().await;
        info!("Listen client stopped");
    }

    /// Open a connection unless one is open, in flight, or not yet due.
    /// A failed attempt schedules the next one `retry_delay` from now.
    async fn connect(&self, retry_delay: Duration) -> Result<bool> {
        {
            let mut state = self.state.lock().await;
            let due = match &*state {
                ConnState::Disconnected { retry_at } => {
                    !retry_at.is_some_and(|at| Instant::now() < at)
                }
                ConnState::Connecting | ConnState::Connected { .. } => false,
            };
            if !due {
                return Ok(false);
            }
            *state = ConnState::Connecting;
        }

        debug!("Connecting to {}", self.options.url);
        let result = self.open().await;

        let outcome = {
            let mut state = self.state.lock().await;
            match result {
                // Shutdown began mid-handshake; close() may already have run
                Ok((mut sink, _)) if self.cancel_token.is_cancelled() => {
                    *state = ConnState::Disconnected { retry_at: None };
                    drop(state);
                    debug!("Shut down while connecting to {}", self.options.url);
                    if let Err(e) = sink.close().await {
                        debug!("Error closing websocket: {}", e);
                    }
                    Ok(false)
                }
                Ok((sink, stream)) => {
                    *state = ConnState::Connected {
                        sink,
                        link: self.cancel_token.child_token(),
                    };
                    *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
                    info!("Connected to {}", self.options.url);
                    Ok(true)
                }
                Err(e) => {
                    *state = ConnState::Disconnected {
                        retry_at: Some(Instant::now() + retry_delay),
                    };
                    Err(e)
                }
            }
        };
        self.state_changed.notify_one();
        outcome
    }

    async fn open(&self) -> Result<(WsSink, WsSource)> {
        let connector = if self.options.accept_invalid_certs {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let handshake = tokio_tungstenite::connect_async_tls_with_config(
            self.options.url.as_str(),
            None,
            false,
            connector,
        );
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| ListenError::ConnectTimeout)??;

        let (mut sink, stream) = ws_stream.split();
        sink.send(Outbound::Time.to_message()?).await?;
        sink.send(Outbound::listen(&self.options.session_id).to_message()?)
            .await?;
        Ok((sink, stream))
    }

    async fn next_attempt_at(&self) -> Option<Instant> {
        match &*self.state.lock().await {
            ConnState::Disconnected { retry_at } => Some(retry_at.unwrap_or_else(Instant::now)),
            ConnState::Connecting | ConnState::Connected { .. } => None,
        }
    }

    async fn receive(&self, mut stream: WsSource) {
        let link = match &*self.state.lock().await {
            ConnState::Connected { link, .. } => link.clone(),
            _ => return,
        };

        loop {
            tokio::select! {
                () = link.cancelled() => {
                    debug!("Connection link cancelled");
                    break;
                }
                message = stream.next() => {
                    let result = match message {
                        Some(Ok(message)) => self.handle_message(message).await,
                        Some(Err(e)) => Err(e.into()),
                        None => Err(ListenError::Closed),
                    };
                    if let Err(e) = result {
                        warn!("Connection to {} lost: {}", self.options.url, e);
                        break;
                    }
                }
            }
        }

        if !self.cancel_token.is_cancelled() {
            self.drop_connection(RETRY_AFTER_DROP).await;
        }
    }

    async fn handle_message(&self, message: Message) -> Result<()> {
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    debug!("Skipping non-UTF-8 binary frame");
                    return Ok(());
                }
            },
            Message::Close(frame) => {
                debug!("Close frame received: {:?}", frame);
                return Err(ListenError::Closed);
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Ok(()),
        };
        self.dispatch(&text).await;
        Ok(())
    }

    /// Route one decoded text message.
    async fn dispatch(&self, text: &str) {
        let inbound = match Inbound::decode(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                debug!("Ignoring undecodable message: {}", e);
                return;
            }
        };

        match inbound {
            Inbound::Time(reply) => match reply.server_timestamp_ms() {
                Some(timestamp) => self.clock.handle_reply(timestamp),
                None => debug!("Ignoring time reply: {:?}", reply),
            },
            Inbound::Feedback(envelope) | Inbound::Play(envelope) => {
                match envelope.update_for(&self.options.session_id) {
                    Some(update) => {
                        let received_at = self.clock.local_now_ms();
                        self.tracker.on_status_update(update, received_at).await;
                    }
                    None => debug!("Ignoring event for another session"),
                }
            }
            Inbound::Other => debug!("Ignoring message: {}", text),
        }
    }

    /// Tear down the live connection, if any, and schedule a retry.
    async fn drop_connection(&self, retry_delay: Duration) {
        let mut state = self.state.lock().await;
        if let ConnState::Connected { link, .. } = &*state {
            link.cancel();
            *state = ConnState::Disconnected {
                retry_at: Some(Instant::now() + retry_delay),
            };
            info!("Disconnected from {}, retrying in {:?}", self.options.url, retry_delay);
        }
    }

    fn ensure_timers(self: &Arc<Self>) {
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        if timers.as_ref().is_some_and(Timers::is_running) {
            return;
        }
        if let Some(stale) = timers.take() {
            stale.watchdog.abort();
            stale.clock_sync.abort();
        }

        let watchdog = {
            let client = Arc::clone(self);
            let token = self.cancel_token.child_token();
            tokio::spawn(async move { client.tracker.run_watchdog(client.as_ref(), token).await })
        };
        let clock_sync = {
            let client = Arc::clone(self);
            let token = self.cancel_token.child_token();
            tokio::spawn(async move { client.clock.run_sync_timer(client.as_ref(), token).await })
        };
        *timers = Some(Timers {
            watchdog,
            clock_sync,
        });
    }

    async fn close(&self) {
        // Timers first, so a watchdog connect in flight settles before teardown
        let timers = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(timers) = timers {
            let _ = tokio::join!(timers.watchdog, timers.clock_sync);
        }

        let previous = std::mem::replace(
            &mut *self.state.lock().await,
            ConnState::Disconnected { retry_at: None },
        );
        if let ConnState::Connected { mut sink, link } = previous {
            link.cancel();
            if let Err(e) = sink.close().await {
                debug!("Error closing websocket: {}", e);
            }
        }
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.tracker.shutdown();
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl EventSource for ListenClient {
    fn name(&self) -> &'static str {
        "listen"
    }

    async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status()
    }

    async fn request_time_sync(&self) -> std::result::Result<(), CoreError> {
        let message = Outbound::Time.to_message()?;
        let mut state = self.state.lock().await;
        let ConnState::Connected { sink, .. } = &mut *state else {
            return Err(ListenError::NotConnected.into());
        };
        let sent = sink.send(message).await;
        if let Err(e) = sent {
            drop(state);
            self.drop_connection(RETRY_AFTER_DROP).await;
            return Err(ListenError::from(e).into());
        }
        Ok(())
    }

    async fn ensure_connected(&self) -> std::result::Result<bool, CoreError> {
        Ok(self.connect(RETRY_AFTER_WATCHDOG_CONNECT).await?)
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}
