//! Protocol event types for the outbound stream
//!
//! Every unit delivered to a client is a [`ProtocolEvent`]: a typed payload
//! plus the per-stream sequence number assigned at enqueue time. On the wire
//! an event is `{"type": ..., "data": {...}, "sequence": n}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ArachneError;

/// Event payload discriminant, serialized as `type` + `data`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    /// A research run started
    Start {},
    /// Human-readable progress update with completion percentage in [0, 100]
    Progress { message: String, progress: f32 },
    /// A discovered source (citation card material)
    Source {
        url: String,
        title: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        #[serde(default)]
        image: Option<String>,
    },
    /// A chunk of the final report; chunks concatenate in sequence order
    Report { content: String },
    /// Terminal success, carrying the analyzed target when there is one
    Complete {
        #[serde(skip_serializing_if = "Option::is_none")]
        #[serde(default)]
        url: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Terminal failure with a short user-visible message and a reason code
    Error { message: String, code: String },
}

impl EventPayload {
    /// Terminal payloads close the stream; nothing may follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Create a progress payload
    pub fn progress(message: impl Into<String>, progress: f32) -> Self {
        Self::Progress {
            message: message.into(),
            progress: progress.clamp(0.0, 100.0),
        }
    }

    /// Create a source payload
    pub fn source(url: impl Into<String>, title: impl Into<String>, image: Option<String>) -> Self {
        Self::Source {
            url: url.into(),
            title: title.into(),
            image,
        }
    }

    /// Create a report chunk payload
    pub fn report(content: impl Into<String>) -> Self {
        Self::Report {
            content: content.into(),
        }
    }

    /// Create a completion payload with the current timestamp
    pub fn complete(url: Option<String>) -> Self {
        Self::Complete {
            url,
            timestamp: Utc::now(),
        }
    }

    /// Create an error payload from a structured error.
    ///
    /// Only the display message and the stable reason code cross the wire;
    /// anything diagnostic stays in the logs.
    pub fn error(err: &ArachneError) -> Self {
        Self::Error {
            message: err.to_string(),
            code: err.reason_code().to_string(),
        }
    }
}

/// One sequenced unit of the outbound stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProtocolEvent {
    /// Monotonically increasing per-stream counter, assigned at enqueue
    pub sequence: u64,
    /// Event payload
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl ProtocolEvent {
    /// Wrap a payload with its sequence number
    pub fn new(sequence: u64, payload: EventPayload) -> Self {
        Self { sequence, payload }
    }

    /// Whether this event terminates the stream
    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let event = ProtocolEvent::new(3, EventPayload::progress("Searching the web...", 25.0));
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "progress");
        assert_eq!(json["sequence"], 3);
        assert_eq!(json["data"]["message"], "Searching the web...");
        assert_eq!(json["data"]["progress"], 25.0);
    }

    #[test]
    fn test_start_has_empty_data() {
        let json = serde_json::to_value(ProtocolEvent::new(0, EventPayload::Start {})).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["data"], serde_json::json!({}));
    }

    #[test]
    fn test_source_omits_missing_image() {
        let json = serde_json::to_value(EventPayload::source(
            "https://example.com",
            "Example",
            None,
        ))
        .unwrap();
        assert!(json["data"].get("image").is_none());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(EventPayload::complete(None).is_terminal());
        assert!(EventPayload::error(&ArachneError::Other("x".into())).is_terminal());
        assert!(!EventPayload::Start {}.is_terminal());
        assert!(!EventPayload::report("chunk").is_terminal());
    }

    #[test]
    fn test_progress_is_clamped() {
        match EventPayload::progress("done", 120.0) {
            EventPayload::Progress { progress, .. } => assert_eq!(progress, 100.0),
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn test_round_trip() {
        let event = ProtocolEvent::new(
            7,
            EventPayload::source("https://a.dev", "A", Some("https://a.dev/logo.png".into())),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: ProtocolEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
