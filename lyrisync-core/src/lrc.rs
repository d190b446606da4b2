//! Time-tagged lyric sheet parsing and line lookup.

use std::num::ParseIntError;
use std::ops::Range;
use thiserror::Error;

/// A single lyric line with the offset at which it becomes active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LyricLine {
    /// Milliseconds from the start of the song
    pub offset_ms: u64,
    /// Display text with all time tags stripped
    pub text: String,
}

/// Parsed lyric sheet for one song.
#[derive(Debug, Clone, Default)]
pub struct LyricSheet {
    pub song_id: String,
    /// Raw sheet text as fetched
    pub raw: String,
    /// Lines sorted by `offset_ms`, stable among equal offsets
    pub lines: Vec<LyricLine>,
}

/// A time tag that matched the `[m:ss.fff]` shape but could not be converted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeTagError {
    #[error("invalid number in time tag: {0}")]
    InvalidNumber(#[from] ParseIntError),

    #[error("time tag out of range")]
    OutOfRange,
}

impl LyricSheet {
    /// Parse raw sheet text for a song.
    pub fn parse(song_id: impl Into<String>, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let lines = parse_lines(&raw);
        Self {
            song_id: song_id.into(),
            raw,
            lines,
        }
    }

    /// Index of the active line at `position_ms`.
    ///
    /// This is the greatest index whose offset is not after the position, so
    /// among lines sharing an offset the last one wins. Returns `None` before
    /// the first line.
    #[must_use]
    pub fn active_index(&self, position_ms: i64) -> Option<usize> {
        let position = u64::try_from(position_ms).ok()?;
        let mut found = None;
        for (index, line) in self.lines.iter().enumerate() {
            if line.offset_ms > position {
                break;
            }
            found = Some(index);
        }
        found
    }

    /// Active line at `position_ms`, see [`Self::active_index`].
    #[must_use]
    pub fn active_line(&self, position_ms: i64) -> Option<&LyricLine> {
        self.active_index(position_ms).map(|i| &self.lines[i])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Parse time-tagged text into lyric lines sorted by offset.
///
/// Every `[m:ss]` or `[m:ss.fff]` tag on a line yields one entry sharing the
/// line's text. Lines without a tag, and lines whose text is empty once tags
/// are stripped, produce nothing.
#[must_use]
pub fn parse_lines(input: &str) -> Vec<LyricLine> {
    let mut lines = Vec::new();

    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let tags = find_time_tags(line);
        if tags.is_empty() {
            continue;
        }

        let text = strip_tags(line, &tags);
        if text.is_empty() {
            continue;
        }

        for tag in &tags {
            match tag.offset_ms(line) {
                Ok(offset_ms) => lines.push(LyricLine {
                    offset_ms,
                    text: text.clone(),
                }),
                Err(e) => tracing::debug!("Skipping time tag {:?}: {}", &line[tag.span.clone()], e),
            }
        }
    }

    // Stable: equal offsets keep their encounter order
    lines.sort_by_key(|l| l.offset_ms);
    lines
}

/// Location of a `[m:ss(.fff)]` tag within a line.
#[derive(Debug, Clone)]
struct TimeTag {
    span: Range<usize>,
    minutes: Range<usize>,
    seconds: Range<usize>,
    fraction: Option<Range<usize>>,
}

impl TimeTag {
    fn offset_ms(&self, line: &str) -> Result<u64, TimeTagError> {
        let minutes: u64 = line[self.minutes.clone()].parse()?;
        let seconds: u64 = line[self.seconds.clone()].parse()?;
        let millis: u64 = match &self.fraction {
            // Right-pad to millisecond precision: ".5" is 500ms, ".05" is 50ms
            Some(range) => format!("{:0<3}", &line[range.clone()]).parse()?,
            None => 0,
        };

        minutes
            .checked_mul(60)
            .and_then(|m| m.checked_add(seconds))
            .and_then(|s| s.checked_mul(1000))
            .and_then(|ms| ms.checked_add(millis))
            .ok_or(TimeTagError::OutOfRange)
    }
}

/// Find all non-overlapping time tags, scanning left to right.
fn find_time_tags(line: &str) -> Vec<TimeTag> {
    let bytes = line.as_bytes();
    let mut tags = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes[pos] == b'[' {
            if let Some(tag) = match_time_tag(bytes, pos) {
                pos = tag.span.end;
                tags.push(tag);
                continue;
            }
        }
        pos += 1;
    }

    tags
}

/// Match `[` 1-2 digits `:` 2 digits, optionally `.` 1-3 digits, then `]`.
fn match_time_tag(bytes: &[u8], start: usize) -> Option<TimeTag> {
    let mut pos = start + 1;

    let minutes_len = count_digits(bytes, pos, 2);
    if minutes_len == 0 {
        return None;
    }
    let minutes = pos..pos + minutes_len;
    pos += minutes_len;

    if bytes.get(pos) != Some(&b':') {
        return None;
    }
    pos += 1;

    if count_digits(bytes, pos, 2) != 2 {
        return None;
    }
    let seconds = pos..pos + 2;
    pos += 2;

    let mut fraction = None;
    if bytes.get(pos) == Some(&b'.') {
        let fraction_len = count_digits(bytes, pos + 1, 3);
        if fraction_len > 0 {
            fraction = Some(pos + 1..pos + 1 + fraction_len);
            pos += 1 + fraction_len;
        }
    }

    if bytes.get(pos) != Some(&b']') {
        return None;
    }

    Some(TimeTag {
        span: start..pos + 1,
        minutes,
        seconds,
        fraction,
    })
}

fn count_digits(bytes: &[u8], from: usize, max: usize) -> usize {
    bytes
        .iter()
        .skip(from)
        .take(max)
        .take_while(|b| b.is_ascii_digit())
        .count()
}

fn strip_tags(line: &str, tags: &[TimeTag]) -> String {
    let mut text = String::with_capacity(line.len());
    let mut last = 0;
    for tag in tags {
        text.push_str(&line[last..tag.span.start]);
        last = tag.span.end;
    }
    text.push_str(&line[last..]);
    text.trim().to_string()
}
