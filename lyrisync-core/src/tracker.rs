//! Playback tracking, staleness detection and scheduler lifecycle.

use crate::clock::ClockSync;
use crate::playback::{PlaybackState, StatusUpdate};
use crate::repository::LyricsRepository;
use crate::scheduler::{LineScheduler, LineSink};
use crate::source::{ConnectionStatus, EventSource};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often the watchdog checks for staleness and a dropped connection
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Playing state without any event for longer than this is treated as paused
pub const STALE_THRESHOLD: Duration = Duration::from_secs(12);

/// Why playback was marked paused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// The event source reported a pause
    Reported,
    /// No event arrived within [`STALE_THRESHOLD`]
    Stale,
}

/// Events emitted by the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A different song started playing
    TrackChanged { song_id: String },
    /// Playback resumed on the same song
    PlaybackResumed { song_id: String },
    /// Playback was paused
    PlaybackPaused { reason: PauseReason },
    /// Lyrics were fetched for a song
    LyricsLoaded { song_id: String, lines: usize },
    /// No lyrics could be fetched for a song
    LyricsUnavailable { song_id: String },
}

struct SchedulerRun {
    cancel_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Keeps the playback state current and runs the line scheduler while playing.
pub struct PlaybackTracker {
    state: Arc<RwLock<PlaybackState>>,
    clock: Arc<ClockSync>,
    repository: Arc<LyricsRepository>,
    scheduler: LineScheduler,
    run: Mutex<Option<SchedulerRun>>,
    event_tx: broadcast::Sender<SyncEvent>,
    cancel_token: CancellationToken,
}

impl PlaybackTracker {
    /// Create a new tracker
    ///
    /// # Arguments
    /// * `clock` - Clock synchronizer used for position estimates
    /// * `repository` - Lyrics repository to prefetch sheets into
    /// * `sink` - Receiver of line changes
    /// * `cancel_token` - Optional external cancellation token for graceful shutdown
    pub fn new(
        clock: Arc<ClockSync>,
        repository: Arc<LyricsRepository>,
        sink: Arc<dyn LineSink>,
        cancel_token: Option<CancellationToken>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        let state = Arc::new(RwLock::new(PlaybackState::default()));
        let scheduler = LineScheduler::new(state.clone(), clock.clone(), repository.clone(), sink);

        Arc::new(Self {
            state,
            clock,
            repository,
            scheduler,
            run: Mutex::new(None),
            event_tx,
            cancel_token: cancel_token.unwrap_or_default(),
        })
    }

    /// Subscribe to tracker events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Get a snapshot of the current playback state
    pub async fn state(&self) -> PlaybackState {
        self.state.read().await.clone()
    }

    /// Apply a status update received at local time `received_at_ms`.
    pub async fn on_status_update(&self, update: StatusUpdate, received_at_ms: i64) {
        if !update.is_playing {
            self.pause(PauseReason::Reported).await;
            return;
        }

        let server_start_ms = update.server_start_ms();
        let (track_changed, resumed) = {
            let mut state = self.state.write().await;
            let track_changed = state.song_id != update.song_id;
            let resumed = !state.is_playing;
            *state = PlaybackState {
                is_playing: true,
                song_id: update.song_id.clone(),
                server_start_ms,
                last_event_ms: received_at_ms,
            };
            // Scheduler changes are ordered by the state lock.
            // A new song starts the cursor over; otherwise keep the running loop
            self.ensure_scheduler(track_changed);
            (track_changed, resumed)
        };

        debug!(
            "Playing {} from server time {} (position {}s)",
            update.song_id, server_start_ms, update.current_position_sec
        );

        if track_changed {
            info!("Track changed to {:?}", update.song_id);
            let _ = self.event_tx.send(SyncEvent::TrackChanged {
                song_id: update.song_id.clone(),
            });
            if !update.song_id.is_empty() {
                self.prefetch(update.song_id);
            }
        } else if resumed {
            info!("Playback resumed");
            let _ = self.event_tx.send(SyncEvent::PlaybackResumed {
                song_id: update.song_id,
            });
        }
    }

    /// Mark playback paused and stop the scheduler.
    pub async fn pause(&self, reason: PauseReason) {
        let was_playing = {
            let mut state = self.state.write().await;
            self.pause_locked(&mut state)
        };
        if was_playing {
            self.paused(reason);
        }
    }

    /// Pause if playing state has gone stale. Returns whether it had.
    pub async fn check_staleness(&self) -> bool {
        let stale = {
            let mut state = self.state.write().await;
            // Re-checked under the write lock
            let now = self.clock.local_now_ms();
            state.is_stale(now, STALE_THRESHOLD) && self.pause_locked(&mut state)
        };
        if stale {
            warn!(
                "No playback event for over {:?}, treating playback as paused",
                STALE_THRESHOLD
            );
            self.paused(PauseReason::Stale);
        }
        stale
    }

    fn pause_locked(&self, state: &mut PlaybackState) -> bool {
        let was_playing = std::mem::replace(&mut state.is_playing, false);
        self.stop_scheduler();
        was_playing
    }

    fn paused(&self, reason: PauseReason) {
        info!("Playback paused ({:?})", reason);
        let _ = self.event_tx.send(SyncEvent::PlaybackPaused { reason });
    }

    /// Every [`WATCHDOG_INTERVAL`], check for staleness and reconnect
    /// `source` if it is disconnected, until cancelled.
    pub async fn run_watchdog(&self, source: &dyn EventSource, cancel_token: CancellationToken) {
        info!("Playback watchdog started for {}", source.name());
        let start = tokio::time::Instant::now() + WATCHDOG_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, WATCHDOG_INTERVAL);

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!("Playback watchdog shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.check_staleness().await;

                    if source.status().await != ConnectionStatus::Disconnected {
                        continue;
                    }
                    match source.ensure_connected().await {
                        Ok(true) => info!("Watchdog re-established connection to {}", source.name()),
                        Ok(false) => {}
                        Err(e) => warn!("Watchdog reconnect to {} failed: {}", source.name(), e),
                    }
                }
            }
        }
    }

    /// Whether a scheduler loop is currently running
    pub fn is_scheduler_running(&self) -> bool {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|run| !run.handle.is_finished())
    }

    /// Stop the scheduler. Further status updates may start it again.
    pub fn shutdown(&self) {
        self.stop_scheduler();
    }

    fn ensure_scheduler(&self, restart: bool) {
        let mut run = self.run.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = run.as_ref() {
            if !restart && !current.handle.is_finished() {
                return;
            }
            current.cancel_token.cancel();
        }

        let cancel_token = self.cancel_token.child_token();
        let scheduler = self.scheduler.clone();
        let task_token = cancel_token.clone();
        let handle = tokio::spawn(async move { scheduler.run(task_token).await });
        *run = Some(SchedulerRun {
            cancel_token,
            handle,
        });
    }

    fn stop_scheduler(&self) {
        let run = self.run.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(run) = run {
            run.cancel_token.cancel();
        }
    }

    fn prefetch(&self, song_id: String) {
        let repository = Arc::clone(&self.repository);
        let event_tx = self.event_tx.clone();
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = cancel_token.cancelled() => {}
                result = repository.get(&song_id) => {
                    let event = match result {
                        Ok(sheet) => SyncEvent::LyricsLoaded {
                            song_id,
                            lines: sheet.len(),
                        },
                        Err(e) => {
                            warn!("No lyrics available for {}: {}", song_id, e);
                            SyncEvent::LyricsUnavailable { song_id }
                        }
                    };
                    let _ = event_tx.send(event);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::testing::FakeProvider;
    use crate::scheduler::testing::RecordingSink;
    use crate::source::testing::FakeSource;
    use crate::time::testing::{ManualClock, TokioClock};
    use crate::time::LocalClock;

    struct Harness {
        tracker: Arc<PlaybackTracker>,
        provider: Arc<FakeProvider>,
        sink: Arc<RecordingSink>,
    }

    fn harness(local: Arc<dyn LocalClock>, provider: FakeProvider) -> Harness {
        let provider = Arc::new(provider);
        let repository = Arc::new(LyricsRepository::new(provider.clone()));
        let clock = Arc::new(ClockSync::new(local));
        let sink = Arc::new(RecordingSink::default());
        let tracker = PlaybackTracker::new(clock, repository, sink.clone(), None);
        Harness {
            tracker,
            provider,
            sink,
        }
    }

    fn playing(song_id: &str, system_time: i64, position_sec: f64) -> StatusUpdate {
        StatusUpdate {
            is_playing: true,
            song_id: song_id.to_string(),
            server_system_time_ms: system_time,
            current_position_sec: position_sec,
        }
    }

    fn paused(song_id: &str) -> StatusUpdate {
        StatusUpdate {
            is_playing: false,
            ..playing(song_id, 0, 0.0)
        }
    }

    #[tokio::test]
    async fn test_play_records_state_and_starts_scheduler() {
        let h = harness(Arc::new(ManualClock::new(5_000)), FakeProvider::default());
        let mut events = h.tracker.subscribe();

        h.tracker
            .on_status_update(playing("abc", 100_000, 2.5), 5_000)
            .await;

        let state = h.tracker.state().await;
        assert!(state.is_playing);
        assert_eq!(state.song_id, "abc");
        assert_eq!(state.server_start_ms, 97_500);
        assert_eq!(state.last_event_ms, 5_000);
        assert!(h.tracker.is_scheduler_running());
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::TrackChanged {
                song_id: "abc".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_prefetch_only_on_song_change() {
        let provider = FakeProvider::with_sheet("abc", "[00:01]a");
        provider.insert("def", "[00:01]d");
        let h = harness(Arc::new(ManualClock::new(0)), provider);
        let mut events = h.tracker.subscribe();

        h.tracker.on_status_update(playing("abc", 1_000, 0.0), 0).await;
        h.tracker.on_status_update(playing("abc", 2_000, 1.0), 0).await;

        // TrackChanged, then the prefetch result
        events.recv().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::LyricsLoaded {
                song_id: "abc".to_string(),
                lines: 1
            }
        );
        assert_eq!(h.provider.calls(), 1);

        h.tracker.on_status_update(playing("def", 3_000, 0.0), 0).await;
        events.recv().await.unwrap();
        events.recv().await.unwrap();
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_lyrics_reported() {
        let h = harness(Arc::new(ManualClock::new(0)), FakeProvider::default());
        let mut events = h.tracker.subscribe();

        h.tracker.on_status_update(playing("abc", 1_000, 0.0), 0).await;
        events.recv().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::LyricsUnavailable {
                song_id: "abc".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_empty_song_id_is_not_fetched() {
        let h = harness(Arc::new(ManualClock::new(0)), FakeProvider::default());
        h.tracker.on_status_update(playing("", 1_000, 0.0), 0).await;
        tokio::task::yield_now().await;
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_pause_stops_scheduler() {
        let h = harness(Arc::new(ManualClock::new(0)), FakeProvider::default());
        let mut events = h.tracker.subscribe();

        h.tracker.on_status_update(playing("abc", 1_000, 0.0), 0).await;
        assert!(h.tracker.is_scheduler_running());

        h.tracker.on_status_update(paused("abc"), 0).await;
        assert!(!h.tracker.state().await.is_playing);
        assert!(!h.tracker.is_scheduler_running());

        events.recv().await.unwrap();
        // Skip the prefetch outcome
        loop {
            match events.recv().await.unwrap() {
                SyncEvent::PlaybackPaused { reason } => {
                    assert_eq!(reason, PauseReason::Reported);
                    break;
                }
                SyncEvent::LyricsUnavailable { .. } => {}
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_pause_keeps_song_id() {
        let h = harness(Arc::new(ManualClock::new(0)), FakeProvider::with_sheet("abc", ""));
        let mut events = h.tracker.subscribe();

        h.tracker.on_status_update(playing("abc", 1_000, 0.0), 0).await;
        while !matches!(events.recv().await.unwrap(), SyncEvent::LyricsLoaded { .. }) {}

        h.tracker.on_status_update(paused("other"), 0).await;
        h.tracker.on_status_update(playing("abc", 2_000, 0.0), 0).await;
        tokio::task::yield_now().await;

        // Resuming the same song is not a track change
        assert_eq!(h.tracker.state().await.song_id, "abc");
        assert_eq!(h.provider.calls(), 1);
        assert_eq!(events.recv().await.unwrap(), SyncEvent::PlaybackPaused { reason: PauseReason::Reported });
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::PlaybackResumed {
                song_id: "abc".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_staleness_forces_pause() {
        let local = Arc::new(ManualClock::new(10_000));
        let h = harness(local.clone(), FakeProvider::default());
        h.tracker.on_status_update(playing("abc", 1_000, 0.0), 10_000).await;

        local.set(22_000);
        assert!(!h.tracker.check_staleness().await);
        assert!(h.tracker.state().await.is_playing);

        local.set(22_001);
        assert!(h.tracker.check_staleness().await);
        assert!(!h.tracker.state().await.is_playing);
        assert!(!h.tracker.is_scheduler_running());
    }

    #[tokio::test]
    async fn test_fresh_event_clears_staleness() {
        let local = Arc::new(ManualClock::new(10_000));
        let h = harness(local.clone(), FakeProvider::default());
        h.tracker.on_status_update(playing("abc", 1_000, 0.0), 10_000).await;

        local.set(30_000);
        h.tracker.on_status_update(playing("abc", 21_000, 20.0), 30_000).await;

        assert!(!h.tracker.check_staleness().await);
        assert!(h.tracker.state().await.is_playing);
        assert!(h.tracker.is_scheduler_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_stale_check_and_update_agree_on_scheduler() {
        let local = Arc::new(ManualClock::new(0));
        let h = harness(local.clone(), FakeProvider::default());
        h.tracker.on_status_update(playing("abc", 1_000, 0.0), 0).await;

        for round in 1..=50_i64 {
            // Every round starts stale
            let now = round * 20_000;
            local.set(now);

            let checker = {
                let tracker = h.tracker.clone();
                tokio::spawn(async move { tracker.check_staleness().await })
            };
            let updater = {
                let tracker = h.tracker.clone();
                tokio::spawn(async move {
                    tracker
                        .on_status_update(playing("abc", now, 0.0), now)
                        .await;
                })
            };
            checker.await.unwrap();
            updater.await.unwrap();

            assert_eq!(
                h.tracker.state().await.is_playing,
                h.tracker.is_scheduler_running(),
                "round {round}"
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_detects_staleness_within_one_tick() {
        let h = harness(Arc::new(TokioClock::new(0)), FakeProvider::default());
        let source = Arc::new(FakeSource::new(ConnectionStatus::Connected));
        let cancel = CancellationToken::new();

        h.tracker.on_status_update(playing("abc", 1_000, 0.0), 0).await;

        let task = {
            let tracker = h.tracker.clone();
            let source = source.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tracker.run_watchdog(source.as_ref(), cancel).await })
        };

        // Ticks at 5s and 10s see a fresh state
        tokio::time::sleep(Duration::from_millis(14_900)).await;
        assert!(h.tracker.state().await.is_playing);

        // Threshold crossed at 12s, caught by the 15s tick
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!h.tracker.state().await.is_playing);
        assert_eq!(source.connect_attempts(), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_reconnects_when_disconnected() {
        let h = harness(Arc::new(TokioClock::new(0)), FakeProvider::default());
        let source = Arc::new(FakeSource::new(ConnectionStatus::Disconnected));
        let cancel = CancellationToken::new();

        let task = {
            let tracker = h.tracker.clone();
            let source = source.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tracker.run_watchdog(source.as_ref(), cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(source.connect_attempts(), 2);

        source.set_status(ConnectionStatus::Connecting);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(source.connect_attempts(), 2);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_song_change_emits_first_line_once() {
        // Local clock starts one second before the song's zero position
        let h = harness(
            Arc::new(TokioClock::new(99_000)),
            FakeProvider::with_sheet("abc", "[00:00.00]Intro\n[00:05.00]Verse"),
        );

        h.tracker
            .on_status_update(playing("abc", 100_000, 0.0), 99_000)
            .await;
        assert_eq!(h.tracker.state().await.server_start_ms, 100_000);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(h.sink.lines().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.sink.lines(), vec!["Intro".to_string()]);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.sink.lines(), vec!["Intro".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_restarts_scheduler_fresh() {
        let h = harness(
            Arc::new(TokioClock::new(100_000)),
            FakeProvider::with_sheet("abc", "[00:00.00]Intro"),
        );

        h.tracker.on_status_update(playing("abc", 100_000, 0.0), 100_000).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.sink.lines().len(), 1);

        h.tracker.on_status_update(paused("abc"), 100_200).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.tracker.on_status_update(playing("abc", 100_400, 0.4), 100_400).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Fresh cursor after resume selects the line again
        assert_eq!(h.sink.lines(), vec!["Intro".to_string(), "Intro".to_string()]);
    }
}
