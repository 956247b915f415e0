//! Event trait and the record types that flow through the event log.
//!
//! Events represent facts about things that have happened in the past and are
//! immutable once appended.
//!
//! # Record types
//!
//! - [`SerializedEvent`]: an event on its way into the store (type tag, payload, metadata)
//! - [`RecordedEvent`]: an event as the store returns it, with its stream version,
//!   global position and timestamp
//! - [`EventView`]: the borrowed view folds operate on
//!
//! Payloads are serialized with `bincode`. The store treats them as opaque bytes
//! and returns them exactly as written.
//!
//! # Example
//!
//! ```
//! use eventline_core::event::Event;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct VideoUploaded {
//!     title: String,
//! }
//!
//! impl Event for VideoUploaded {
//!     fn event_type(&self) -> &'static str {
//!         "VideoUploaded.v1"
//!     }
//! }
//! ```

use crate::stream::{GlobalPosition, StreamId, Version};
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// An event that can be stored in an event store and replayed to reconstruct state.
///
/// # Event Naming Convention
///
/// `event_type()` returns a stable tag that includes a version suffix, for
/// example `"VideoViewed.v1"`. The tag is what aggregates and projections
/// dispatch on.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type tag for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// belong to a different event type.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// A serialized event ready for storage.
///
/// Contains the event type tag and the serialized bytes, along with optional
/// metadata (correlation id, causation id, acting user).
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedEvent {
    /// The event type tag (e.g., "VideoUploaded.v1").
    pub event_type: String,

    /// The bincode-serialized event data.
    pub data: Vec<u8>,

    /// Optional metadata in JSON format.
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    #[must_use]
    pub const fn new(
        event_type: String,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }

    /// Create a serialized event from an `Event`.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventline_core::event::{Event, SerializedEvent};
    /// # use serde::{Serialize, Deserialize};
    /// # #[derive(Clone, Debug, Serialize, Deserialize)]
    /// # struct VideoUploaded { title: String }
    /// # impl Event for VideoUploaded {
    /// #     fn event_type(&self) -> &'static str { "VideoUploaded.v1" }
    /// # }
    ///
    /// let event = VideoUploaded { title: "Title A".to_string() };
    /// let serialized = SerializedEvent::from_event(&event, None).unwrap();
    /// assert_eq!(serialized.event_type, "VideoUploaded.v1");
    /// ```
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            data: event.to_bytes()?,
            metadata,
        })
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}

/// An event as stored in the event log.
///
/// Immutable once appended. `version` is the event's sequence number within its
/// stream (starting at 1) and `global_position` its place in the total order
/// across all streams.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedEvent {
    /// The stream this event belongs to.
    pub stream_id: StreamId,
    /// The entity type of the stream (e.g. "video").
    pub entity_type: String,
    /// Sequence number within the stream.
    pub version: Version,
    /// Position across all streams.
    pub global_position: GlobalPosition,
    /// The event type tag.
    pub event_type: String,
    /// The bincode-serialized event data.
    pub data: Vec<u8>,
    /// Optional metadata in JSON format.
    pub metadata: Option<serde_json::Value>,
    /// When the writer recorded the event.
    pub recorded_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// Borrow this event as an [`EventView`] for folding.
    #[must_use]
    pub fn view(&self) -> EventView<'_> {
        EventView {
            stream_id: &self.stream_id,
            version: self.version,
            event_type: &self.event_type,
            data: &self.data,
            recorded_at: self.recorded_at,
        }
    }

    /// Decode the payload as `T`.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the payload is malformed.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        self.view().decode()
    }
}

/// What an aggregate fold gets to see of an event.
///
/// Deliberately excludes the global position: folds run on pending events
/// before the store has assigned one, and must produce the same state when the
/// stored events are replayed later.
#[derive(Clone, Copy, Debug)]
pub struct EventView<'a> {
    /// The stream this event belongs to.
    pub stream_id: &'a StreamId,
    /// Sequence number within the stream.
    pub version: Version,
    /// The event type tag.
    pub event_type: &'a str,
    /// The serialized payload.
    pub data: &'a [u8],
    /// When the writer recorded the event.
    pub recorded_at: DateTime<Utc>,
}

impl EventView<'_> {
    /// Decode the payload as `T`.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the payload is malformed.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, EventError> {
        bincode::deserialize(self.data)
            .map_err(|e| EventError::DeserializationError(format!("{}: {e}", self.event_type)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    struct Renamed {
        title: String,
    }

    impl Event for Renamed {
        fn event_type(&self) -> &'static str {
            "Renamed.v1"
        }
    }

    fn recorded(data: Vec<u8>) -> RecordedEvent {
        RecordedEvent {
            stream_id: StreamId::new("video-1"),
            entity_type: "video".to_string(),
            version: Version::new(1),
            global_position: GlobalPosition::new(9),
            event_type: "Renamed.v1".to_string(),
            data,
            metadata: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    #[allow(clippy::expect_used)] // Panics: Test will fail if serialization fails
    fn serialized_event_from_event_keeps_metadata() {
        let metadata = serde_json::json!({ "correlation_id": "corr-456" });
        let serialized = SerializedEvent::from_event(
            &Renamed {
                title: "New".to_string(),
            },
            Some(metadata.clone()),
        )
        .expect("serialization should succeed");

        assert_eq!(serialized.event_type, "Renamed.v1");
        assert!(!serialized.data.is_empty());
        assert_eq!(serialized.metadata, Some(metadata));
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn recorded_event_decodes_its_payload() {
        let original = Renamed {
            title: "Title A".to_string(),
        };
        let event = recorded(original.to_bytes().expect("serialize"));

        let decoded: Renamed = event.decode().expect("decode should succeed");
        assert_eq!(decoded, original);
        assert_eq!(event.view().version, Version::new(1));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn malformed_payload_names_the_event_type() {
        let event = recorded(vec![0xff]);
        let error = event.decode::<Renamed>().unwrap_err();
        assert!(error.to_string().contains("Renamed.v1"));
    }

    #[test]
    fn serialized_event_display() {
        let serialized = SerializedEvent::new("Renamed.v1".to_string(), vec![1, 2, 3, 4, 5], None);
        let display = format!("{serialized}");
        assert!(display.contains("Renamed.v1"));
        assert!(display.contains("5 bytes"));
    }
}
