//! JSON messages exchanged over the listen-together websocket.

use crate::error::Result;
use lyrisync_core::StatusUpdate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// Messages sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound<'a> {
    /// Ask for the server's current time
    Time,
    /// Subscribe to a session's playback events
    Listen {
        #[serde(rename = "SessionId")]
        session_id: [&'a str; 1],
    },
}

impl<'a> Outbound<'a> {
    #[must_use]
    pub const fn listen(session_id: &'a str) -> Self {
        Self::Listen {
            session_id: [session_id],
        }
    }

    /// Encode as a websocket text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_message(&self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?))
    }
}

/// Messages received from the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Time(TimeReply),
    Feedback(StatusEnvelope),
    Play(StatusEnvelope),
    #[serde(other)]
    Other,
}

impl Inbound {
    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a recognizable message.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Reply to a time request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TimeReply {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

impl TimeReply {
    /// Server time in milliseconds, if the reply is ok and carries a number.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn server_timestamp_ms(&self) -> Option<i64> {
        if self.status.as_deref() != Some("ok") {
            return None;
        }
        let timestamp = self.timestamp.as_ref()?;
        timestamp
            .as_i64()
            .or_else(|| timestamp.as_f64().map(|ms| ms as i64))
    }
}

/// Session identity field: either a single id or a list of ids.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SessionTarget {
    One(String),
    Many(Vec<String>),
}

impl SessionTarget {
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        match self {
            Self::One(id) => id == session_id,
            Self::Many(ids) => ids.iter().any(|id| id == session_id),
        }
    }
}

/// A `feedback` or `play` event
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusEnvelope {
    #[serde(rename = "SessionId", default)]
    pub session_id: Option<SessionTarget>,
    /// Absent when the event carries no data or an empty one
    #[serde(default, deserialize_with = "truthy_payload")]
    pub data: Option<StatusPayload>,
}

impl StatusEnvelope {
    /// The carried status update, if the event targets `session_id`.
    #[must_use]
    pub fn update_for(self, session_id: &str) -> Option<StatusUpdate> {
        let matched = self
            .session_id
            .as_ref()
            .is_some_and(|target| target.contains(session_id));
        if !matched {
            return None;
        }
        self.data.map(StatusPayload::into_update)
    }
}

/// Playback status as reported by the session host.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    #[serde(default, deserialize_with = "lenient_bool")]
    pub status: bool,
    #[serde(default)]
    pub song_mid: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub system_time: i64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub current_time: f64,
}

impl StatusPayload {
    #[must_use]
    pub fn into_update(self) -> StatusUpdate {
        StatusUpdate {
            is_playing: self.status,
            song_id: self.song_mid.unwrap_or_default(),
            server_system_time_ms: self.system_time,
            current_position_sec: self.current_time,
        }
    }
}

/// JSON truthiness: null, false, zero and empty values are false.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n.abs() > 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

fn truthy_payload<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<StatusPayload>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    if !is_truthy(&value) {
        return Ok(None);
    }
    StatusPayload::deserialize(value)
        .map(Some)
        .map_err(serde::de::Error::custom)
}

fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    Ok(is_truthy(&Value::deserialize(deserializer)?))
}

#[allow(clippy::cast_possible_truncation)]
fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}
