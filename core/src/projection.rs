//! Projection system for building read models from events across many streams.
//!
//! # Overview
//!
//! Projections are the **query side**: they fold events from the global log
//! into views optimized for reading. A multi-stream projection routes each
//! event it cares about to a view row chosen by [`Projection::view_id`]; when
//! that id is a constant, every matching event from every stream lands in one
//! singleton row.
//!
//! ## Key Concepts
//!
//! - **Projection**: the fold, keyed by event-type interest
//! - **Projection Store**: backend storage for view rows
//! - **Checkpoint**: the projection's cursor into the global log
//!
//! ```text
//! Write side                              Read side
//! ┌──────────────────┐   read_all_since   ┌──────────────────┐
//! │ events (all      │ ─────────────────▶ │ projection daemon│
//! │ streams, global  │                    │  fold + commit   │
//! │ position order)  │                    └────────┬─────────┘
//! └──────────────────┘                             ▼
//!                                  view rows + cursor (one transaction)
//! ```

use crate::event::RecordedEvent;
use crate::stream::GlobalPosition;
use crate::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;

/// Error type for projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Folding an event into a view failed.
    ///
    /// The cursor stays before the failing event until the fold succeeds.
    #[error("Replay error at global position {position} ({event_type}): {reason}")]
    Replay {
        /// Global position of the failing event.
        position: GlobalPosition,
        /// The failing event's type tag.
        event_type: String,
        /// Why the fold failed.
        reason: String,
    },

    /// Reading the event log failed.
    #[error("Event source error: {0}")]
    EventSource(String),

    /// Another process already runs this projection.
    #[error("Projection {0} is already running elsewhere")]
    LeaseHeld(String),

    /// The daemon task has exited.
    #[error("Projection daemon stopped")]
    Stopped,
}

impl ProjectionError {
    /// Build a replay error for `event`.
    #[must_use]
    pub fn replay(event: &RecordedEvent, reason: impl std::fmt::Display) -> Self {
        Self::Replay {
            position: event.global_position,
            event_type: event.event_type.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// A projection folds events from the global log into view rows.
///
/// # Contract
///
/// - `create` and `apply` must be deterministic
/// - Only events whose type is listed in [`Projection::event_types`] reach the folds
/// - Views are `bincode`-encoded by the daemon
///
/// # Example
///
/// ```ignore
/// impl Projection for GlobalVideoCounterProjection {
///     type View = GlobalVideoCounter;
///
///     fn name(&self) -> &str { "global_video_counter" }
///     fn event_types(&self) -> &[&'static str] { &["VideoViewed.v1"] }
///     fn view_id(&self, _: &RecordedEvent) -> String { "GlobalVideoCounter".into() }
///     fn create(&self, _: &RecordedEvent) -> Result<GlobalVideoCounter> { /* 1 view */ }
///     fn apply(&self, view: &mut GlobalVideoCounter, _: &RecordedEvent) -> Result<()> {
///         view.total_video_views += 1;
///         Ok(())
///     }
/// }
/// ```
pub trait Projection: Send + Sync + 'static {
    /// The row type this projection maintains.
    type View: Clone + Serialize + DeserializeOwned + Send + Sync;

    /// Unique projection name, used for the cursor and row keys.
    fn name(&self) -> &str;

    /// Event type tags this projection folds.
    fn event_types(&self) -> &[&'static str];

    /// Whether `event` is of interest.
    fn handles(&self, event: &RecordedEvent) -> bool {
        self.event_types().contains(&event.event_type.as_str())
    }

    /// Identity of the row `event` folds into.
    fn view_id(&self, event: &RecordedEvent) -> String;

    /// Build a new row from the first event routed to it.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Replay`] if the event cannot be folded.
    fn create(&self, event: &RecordedEvent) -> Result<Self::View>;

    /// Fold a subsequent event into an existing row.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Replay`] if the event cannot be folded.
    fn apply(&self, view: &mut Self::View, event: &RecordedEvent) -> Result<()>;
}

/// Store key of a projection's row.
#[must_use]
pub fn view_key(projection_name: &str, view_id: &str) -> String {
    format!("{projection_name}:{view_id}")
}

/// Encode a view row.
///
/// # Errors
///
/// Returns [`ProjectionError::Serialization`] if encoding fails.
pub fn encode_view<V: Serialize>(view: &V) -> Result<Vec<u8>> {
    bincode::serialize(view).map_err(|e| ProjectionError::Serialization(e.to_string()))
}

/// Decode a view row.
///
/// # Errors
///
/// Returns [`ProjectionError::Serialization`] if the bytes do not decode as `V`.
pub fn decode_view<V: DeserializeOwned>(bytes: &[u8]) -> Result<V> {
    bincode::deserialize(bytes).map_err(|e| ProjectionError::Serialization(e.to_string()))
}

/// A row written by a projection commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewRow {
    /// Store key (see [`view_key`]).
    pub key: String,
    /// Encoded view.
    pub data: Vec<u8>,
}

/// Storage backend for projection rows.
///
/// Implementations handle upserts and must make [`ProjectionStore::commit`]
/// atomic: the rows and the cursor are written together or not at all.
pub trait ProjectionStore: Send + Sync {
    /// Save projection data to storage (upsert).
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if save fails.
    fn save(&self, key: &str, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Get projection data by key.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if retrieval fails.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Delete projection data by key.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if deletion fails.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Check if projection data exists.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the check fails.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }

    /// Upsert `rows` and advance `projection_name`'s cursor to `position` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the transaction fails; nothing is written then.
    fn commit(
        &self,
        projection_name: &str,
        rows: Vec<ViewRow>,
        position: EventPosition,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete every row of a projection and reset its cursor to the start.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the reset fails.
    fn reset(&self, projection_name: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Checkpoint tracking for projection progress through the global log.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns so it can be used
/// as `Arc<dyn ProjectionCheckpoint>` by monitoring code.
pub trait ProjectionCheckpoint: Send + Sync {
    /// Save the current position.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if save fails.
    fn save_position(
        &self,
        projection_name: &str,
        position: EventPosition,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Load the last saved position for a projection.
    ///
    /// Returns `None` for a projection that has never committed.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if load fails.
    fn load_position(
        &self,
        projection_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventPosition>>> + Send + '_>>;
}

/// Position in the global log (for checkpoint resumption).
///
/// `offset` is the global position of the last event the projection has
/// processed, whether or not the event matched its interest.
///
/// # Example
///
/// ```
/// use eventline_core::projection::EventPosition;
/// use chrono::Utc;
///
/// let position = EventPosition::new(1000, Utc::now());
/// assert_eq!(position.global_position().value(), 1000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPosition {
    /// Global position of the last processed event.
    pub offset: u64,

    /// Timestamp when this position was reached
    pub timestamp: DateTime<Utc>,
}

impl EventPosition {
    /// Create a new event position.
    #[must_use]
    pub const fn new(offset: u64, timestamp: DateTime<Utc>) -> Self {
        Self { offset, timestamp }
    }

    /// Create a position at the beginning of the log.
    #[must_use]
    pub fn beginning() -> Self {
        Self {
            offset: 0,
            timestamp: Utc::now(),
        }
    }

    /// The offset as a [`GlobalPosition`].
    #[must_use]
    pub const fn global_position(&self) -> GlobalPosition {
        GlobalPosition::new(self.offset)
    }
}
