use std::time::Duration;

use crate::time::DurationExt;

/// Playback state of the remote session, as last reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackState {
    /// Whether music is currently playing
    pub is_playing: bool,
    /// Identifier of the current song ("" before the first event)
    pub song_id: String,
    /// Server time at which the current song was at position zero.
    /// Meaningless while paused.
    pub server_start_ms: i64,
    /// Local time at which the last playing event was received
    pub last_event_ms: i64,
}

impl PlaybackState {
    /// Position within the song at the given server time, if playing.
    #[must_use]
    pub fn position_ms(&self, server_now_ms: i64) -> Option<i64> {
        self.is_playing
            .then(|| server_now_ms - self.server_start_ms)
    }

    /// Whether playing state has gone without an event for longer than
    /// `threshold`.
    #[must_use]
    pub fn is_stale(&self, local_now_ms: i64, threshold: Duration) -> bool {
        self.is_playing && local_now_ms - self.last_event_ms > threshold.as_millis_i64()
    }
}

/// A play/pause/song-change report from the event source.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub is_playing: bool,
    pub song_id: String,
    /// Server time when the event was produced
    pub server_system_time_ms: i64,
    /// Playback position in seconds at `server_system_time_ms`
    pub current_position_sec: f64,
}

impl StatusUpdate {
    /// Server time corresponding to position zero of the song.
    #[must_use]
    pub fn server_start_ms(&self) -> i64 {
        // Positions are seconds with sub-ms noise; rounding keeps them exact
        #[allow(clippy::cast_possible_truncation)]
        let position_ms = (self.current_position_sec * 1000.0).round() as i64;
        self.server_system_time_ms - position_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(system_time: i64, position_sec: f64) -> StatusUpdate {
        StatusUpdate {
            is_playing: true,
            song_id: "abc".to_string(),
            server_system_time_ms: system_time,
            current_position_sec: position_sec,
        }
    }

    #[test]
    fn test_playback_state_default() {
        let state = PlaybackState::default();
        assert!(!state.is_playing);
        assert!(state.song_id.is_empty());
        assert_eq!(state.position_ms(1_000), None);
    }

    #[test]
    fn test_server_start_at_position_zero() {
        assert_eq!(update(100_000, 0.0).server_start_ms(), 100_000);
    }

    #[test]
    fn test_server_start_rounds_position() {
        assert_eq!(update(100_000, 12.5).server_start_ms(), 87_500);
        // 0.1 * 3 * 1000 is 300.00000000000006
        assert_eq!(update(100_000, 0.1 * 3.0).server_start_ms(), 99_700);
        assert_eq!(update(100_000, 1.2346).server_start_ms(), 98_765);
    }

    #[test]
    fn test_position_only_while_playing() {
        let mut state = PlaybackState {
            is_playing: true,
            song_id: "abc".to_string(),
            server_start_ms: 100_000,
            last_event_ms: 0,
        };
        assert_eq!(state.position_ms(103_200), Some(3_200));

        state.is_playing = false;
        assert_eq!(state.position_ms(103_200), None);
    }

    #[test]
    fn test_is_stale() {
        let state = PlaybackState {
            is_playing: true,
            last_event_ms: 10_000,
            ..Default::default()
        };
        let threshold = Duration::from_secs(12);

        assert!(!state.is_stale(22_000, threshold));
        assert!(state.is_stale(22_001, threshold));

        let paused = PlaybackState {
            is_playing: false,
            ..state
        };
        assert!(!paused.is_stale(60_000, threshold));
    }
}
