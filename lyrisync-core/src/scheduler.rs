//! Per-playback loop that turns the estimated position into line changes.

use crate::clock::ClockSync;
use crate::lrc::{LyricLine, LyricSheet};
use crate::playback::PlaybackState;
use crate::repository::LyricsRepository;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Interval between line selections
pub const SCHEDULER_TICK: Duration = Duration::from_millis(50);

/// Receiver of line-change notifications.
///
/// Called from the scheduler task, so implementations must return quickly.
pub trait LineSink: Send + Sync {
    fn on_line(&self, text: &str);
}

impl<F> LineSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn on_line(&self, text: &str) {
        self(text);
    }
}

/// Remembers the last emitted line so each change is emitted once.
#[derive(Debug, Default)]
pub struct LineCursor {
    song_id: String,
    index: Option<usize>,
}

impl LineCursor {
    /// Line to emit for `position_ms`, or `None` when nothing changed.
    pub fn advance<'a>(&mut self, sheet: &'a LyricSheet, position_ms: i64) -> Option<&'a LyricLine> {
        if self.song_id != sheet.song_id {
            self.song_id.clone_from(&sheet.song_id);
            self.index = None;
        }

        let index = sheet.active_index(position_ms)?;
        if self.index == Some(index) {
            return None;
        }
        self.index = Some(index);
        sheet.lines.get(index)
    }

    /// Index of the last emitted line
    #[must_use]
    pub const fn index(&self) -> Option<usize> {
        self.index
    }
}

/// Drives a [`LineCursor`] from the shared playback state every tick.
#[derive(Clone)]
pub struct LineScheduler {
    state: Arc<RwLock<PlaybackState>>,
    clock: Arc<ClockSync>,
    repository: Arc<LyricsRepository>,
    sink: Arc<dyn LineSink>,
}

impl LineScheduler {
    pub fn new(
        state: Arc<RwLock<PlaybackState>>,
        clock: Arc<ClockSync>,
        repository: Arc<LyricsRepository>,
        sink: Arc<dyn LineSink>,
    ) -> Self {
        Self {
            state,
            clock,
            repository,
            sink,
        }
    }

    /// Run until playback pauses or the token is cancelled.
    pub async fn run(&self, cancel_token: CancellationToken) {
        debug!("Line scheduler started");
        let mut cursor = LineCursor::default();
        let mut ticker = tokio::time::interval(SCHEDULER_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.tick(&mut cursor).await {
                        break;
                    }
                }
            }
        }
        debug!("Line scheduler stopped");
    }

    /// Select the active line once. Returns `false` once playback is paused.
    pub async fn tick(&self, cursor: &mut LineCursor) -> bool {
        // Snapshot so the composite state is read consistently
        let state = self.state.read().await.clone();
        let Some(position) = state.position_ms(self.clock.server_now_ms()) else {
            return false;
        };

        let Some(sheet) = self.repository.cached(&state.song_id).await else {
            trace!("No lyrics for {} yet", state.song_id);
            return true;
        };

        if let Some(line) = cursor.advance(&sheet, position) {
            debug!("Line {:?} at {}ms: {}", cursor.index(), position, line.text);
            self.sink.on_line(&line.text);
        }
        true
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;
    use crate::repository::testing::FakeProvider;
    use crate::time::testing::{ManualClock, TokioClock};

    fn sheet() -> LyricSheet {
        LyricSheet::parse("song", "[00:01]one\n[00:03]two\n[00:05]three")
    }

    #[test]
    fn test_cursor_emits_once_per_index() {
        let sheet = sheet();
        let mut cursor = LineCursor::default();

        assert!(cursor.advance(&sheet, 999).is_none());
        assert_eq!(cursor.advance(&sheet, 1000).unwrap().text, "one");
        for position in 1001..3000 {
            assert!(cursor.advance(&sheet, position).is_none());
        }
        assert_eq!(cursor.advance(&sheet, 3200).unwrap().text, "two");
        assert!(cursor.advance(&sheet, 3250).is_none());
        assert_eq!(cursor.advance(&sheet, 5000).unwrap().text, "three");
        assert_eq!(cursor.index(), Some(2));
    }

    #[test]
    fn test_cursor_resets_on_new_song() {
        let first = sheet();
        let second = LyricSheet::parse("other", "[00:01]uno\n[00:03]dos");
        let mut cursor = LineCursor::default();

        assert_eq!(cursor.advance(&first, 1500).unwrap().text, "one");
        // Same index, different song
        assert_eq!(cursor.advance(&second, 1500).unwrap().text, "uno");
    }

    #[test]
    fn test_closure_sink() {
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |text: &str| seen.lock().unwrap().push(text.to_string());
        sink.on_line("hello");
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_emits_each_line_once_then_stops_on_pause() {
        let local = Arc::new(TokioClock::new(100_000));
        let clock = Arc::new(ClockSync::new(local));
        let provider = Arc::new(FakeProvider::with_sheet(
            "song",
            "[00:00.10]one\n[00:00.30]two",
        ));
        let repository = Arc::new(LyricsRepository::new(provider));
        repository.get("song").await.unwrap();

        let state = Arc::new(RwLock::new(PlaybackState {
            is_playing: true,
            song_id: "song".to_string(),
            server_start_ms: 100_000,
            last_event_ms: 100_000,
        }));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = LineScheduler::new(state.clone(), clock, repository, sink.clone());

        let task = tokio::spawn(async move { scheduler.run(CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(sink.lines().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(sink.lines(), vec!["one".to_string(), "two".to_string()]);

        state.write().await.is_playing = false;
        tokio::time::timeout(Duration::from_millis(200), task)
            .await
            .expect("scheduler should stop once paused")
            .unwrap();
    }

    #[tokio::test]
    async fn test_tick_without_lyrics_keeps_running() {
        let clock = Arc::new(ClockSync::new(Arc::new(ManualClock::new(10_000))));
        let repository = Arc::new(LyricsRepository::new(Arc::new(FakeProvider::default())));
        let state = Arc::new(RwLock::new(PlaybackState {
            is_playing: true,
            song_id: "missing".to_string(),
            ..Default::default()
        }));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = LineScheduler::new(state, clock, repository, sink.clone());

        let mut cursor = LineCursor::default();
        assert!(scheduler.tick(&mut cursor).await);
        assert!(sink.lines().is_empty());
    }

    #[tokio::test]
    async fn test_tick_applies_clock_offset() {
        let local = Arc::new(ManualClock::new(100_000));
        let clock = Arc::new(ClockSync::new(local));
        // Server is 3.2s ahead of us
        clock.handle_reply(103_200);

        let provider = Arc::new(FakeProvider::with_sheet("song", "[00:01]one\n[00:03]two\n[00:05]three"));
        let repository = Arc::new(LyricsRepository::new(provider));
        repository.get("song").await.unwrap();

        let state = Arc::new(RwLock::new(PlaybackState {
            is_playing: true,
            song_id: "song".to_string(),
            server_start_ms: 100_000,
            last_event_ms: 100_000,
        }));
        let sink = Arc::new(RecordingSink::default());
        let scheduler = LineScheduler::new(state, clock, repository, sink.clone());

        let mut cursor = LineCursor::default();
        assert!(scheduler.tick(&mut cursor).await);
        assert!(scheduler.tick(&mut cursor).await);
        assert_eq!(sink.lines(), vec!["two".to_string()]);
    }
}
