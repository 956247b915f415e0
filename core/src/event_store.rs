//! Event store trait and related types for event sourcing.
//!
//! This module defines the core abstraction for an event store: append-only
//! per-entity streams with optimistic concurrency control, transactionally
//! coupled aggregate snapshots, and a global read order for projections.
//!
//! # Design
//!
//! The single write primitive is [`EventStore::commit`]. It takes a batch of
//! [`StreamCommit`]s and applies all of them in one transaction: every
//! expected-version check passes and every event and snapshot is written, or
//! nothing is. The familiar operations are provided on top of it:
//!
//! - [`EventStore::append_events`]: compare-and-append to one stream
//! - [`EventStore::start_stream`]: create a stream, failing if it exists
//! - [`EventStore::append_with_snapshot`]: append and upsert the snapshot atomically
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `eventline-postgres`): Production implementation
//! - `InMemoryEventStore` (in `eventline-testing`): Fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use eventline_core::event_store::{EventStore, EventStoreError};
//! use eventline_core::stream::{StreamId, Version};
//!
//! async fn example<E: EventStore>(store: &E) -> Result<(), EventStoreError> {
//!     let stream_id = StreamId::new("video-1");
//!
//!     let events = vec![/* ... */];
//!     let version = store
//!         .append_events(stream_id.clone(), "video", Some(Version::new(1)), events)
//!         .await?;
//!
//!     let all_events = store.load_events(stream_id, None).await?;
//!     assert_eq!(all_events.len() as u64, version.value());
//!     Ok(())
//! }
//! ```

use crate::event::{RecordedEvent, SerializedEvent};
use crate::stream::{ExpectedVersion, GlobalPosition, StreamId, Version};
use chrono::{DateTime, SubsecRound, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by the dyn-compatible store traits.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur during event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// Optimistic concurrency conflict: expected version doesn't match current version.
    ///
    /// Another writer advanced the stream between this writer's read and its
    /// append. Recoverable by re-reading the stream and retrying.
    #[error("Concurrency conflict on stream {stream_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The stream ID where the conflict occurred.
        stream_id: StreamId,
        /// The version we expected the stream to be at.
        expected: Version,
        /// The actual current version of the stream.
        actual: Version,
    },

    /// A start-stream commit targeted an id that is already in use.
    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(StreamId),

    /// Stream not found in the event store.
    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    /// The stream exists under a different entity type.
    #[error("Stream {stream_id} belongs to entity type {actual}, not {expected}")]
    EntityTypeMismatch {
        /// The stream ID.
        stream_id: StreamId,
        /// The entity type the writer used.
        expected: String,
        /// The entity type the stream was started with.
        actual: String,
    },

    /// The commit request itself is malformed.
    #[error("Invalid commit: {0}")]
    InvalidCommit(String),

    /// Database connection error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl EventStoreError {
    /// Whether this error is a data conflict (lost update or id collision).
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. } | Self::StreamAlreadyExists(_)
        )
    }
}

/// A stream's identity and current version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    /// The stream ID.
    pub stream_id: StreamId,
    /// The entity type the stream was started with.
    pub entity_type: String,
    /// Sequence number of the last appended event.
    pub version: Version,
}

/// A persisted aggregate snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    /// The stream version the snapshot reflects.
    pub version: Version,
    /// The bincode-serialized aggregate state.
    pub state: Vec<u8>,
}

/// One stream's share of an atomic commit.
#[derive(Clone, Debug)]
pub struct StreamCommit {
    /// Target stream.
    pub stream_id: StreamId,
    /// Entity type of the target stream.
    pub entity_type: String,
    /// Version check performed before appending.
    pub expected: ExpectedVersion,
    /// Events to append, in order.
    pub events: Vec<SerializedEvent>,
    /// Snapshot state to upsert at the resulting version, if any.
    pub snapshot: Option<Vec<u8>>,
    /// Timestamp recorded on every event of this commit.
    pub recorded_at: DateTime<Utc>,
}

impl StreamCommit {
    /// Create a commit stamped with the current time.
    #[must_use]
    pub fn new(
        stream_id: StreamId,
        entity_type: impl Into<String>,
        expected: ExpectedVersion,
        events: Vec<SerializedEvent>,
    ) -> Self {
        Self {
            stream_id,
            entity_type: entity_type.into(),
            expected,
            events,
            snapshot: None,
            recorded_at: storage_timestamp(Utc::now()),
        }
    }

    /// Attach a snapshot to upsert in the same transaction.
    #[must_use]
    pub fn with_snapshot(mut self, state: Vec<u8>) -> Self {
        self.snapshot = Some(state);
        self
    }

    /// Override the recorded-at timestamp.
    #[must_use]
    pub fn with_recorded_at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = storage_timestamp(recorded_at);
        self
    }

    /// The version the stream will be at once this commit succeeds.
    #[must_use]
    pub fn resulting_version(&self) -> Version {
        self.expected.version() + self.events.len() as u64
    }
}

/// Truncate a timestamp to the microsecond precision the stores persist.
///
/// Folds see the truncated value both when a command folds its pending events
/// and when a stream is replayed, so snapshots match replays exactly.
#[must_use]
pub fn storage_timestamp(time: DateTime<Utc>) -> DateTime<Utc> {
    time.trunc_subsecs(6)
}

/// Check a stream's current state against a commit's expectation.
///
/// Shared by every store implementation so the rules are identical:
///
/// - `NoStream` on an existing stream fails with `StreamAlreadyExists`
/// - `Exact(v)` fails with `ConcurrencyConflict` unless the stream is at `v`
///   (a missing stream is at version 0)
/// - an existing stream must match the commit's entity type
///
/// # Errors
///
/// Returns the violated rule as an [`EventStoreError`].
pub fn check_expectation(
    commit: &StreamCommit,
    current: Option<&StreamInfo>,
) -> Result<(), EventStoreError> {
    if commit.expected == ExpectedVersion::NoStream && commit.events.is_empty() {
        return Err(EventStoreError::InvalidCommit(format!(
            "cannot start stream {} without events",
            commit.stream_id
        )));
    }

    match (commit.expected, current) {
        (ExpectedVersion::NoStream, Some(_)) => {
            return Err(EventStoreError::StreamAlreadyExists(commit.stream_id.clone()));
        }
        (ExpectedVersion::NoStream, None) => {}
        (ExpectedVersion::Exact(expected), current) => {
            let actual = current.map_or(Version::INITIAL, |info| info.version);
            if expected != actual {
                return Err(EventStoreError::ConcurrencyConflict {
                    stream_id: commit.stream_id.clone(),
                    expected,
                    actual,
                });
            }
        }
    }

    match current {
        Some(info) if info.entity_type != commit.entity_type => {
            Err(EventStoreError::EntityTypeMismatch {
                stream_id: commit.stream_id.clone(),
                expected: commit.entity_type.clone(),
                actual: info.entity_type.clone(),
            })
        }
        _ => Ok(()),
    }
}

/// Reject batches that name the same stream twice.
///
/// # Errors
///
/// Returns `EventStoreError::InvalidCommit` on a duplicate stream id.
pub fn check_distinct_streams(commits: &[StreamCommit]) -> Result<(), EventStoreError> {
    let mut seen = std::collections::HashSet::new();
    for commit in commits {
        if !seen.insert(&commit.stream_id) {
            return Err(EventStoreError::InvalidCommit(format!(
                "stream {} appears twice in one commit",
                commit.stream_id
            )));
        }
    }
    Ok(())
}

/// Event store abstraction for storing and retrieving event streams.
///
/// # Guarantees
///
/// - The expected-version check and the append are atomic (compare-and-append)
/// - Events of a commit and its snapshot are written in one transaction
/// - Sequence numbers within a stream start at 1 and have no gaps
/// - Global positions are assigned in commit order, so [`EventStore::read_all_since`]
///   never returns a position while a lower one is still uncommitted
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be used as `Arc<dyn EventStore>` by repositories and the
/// projection daemon.
pub trait EventStore: Send + Sync {
    /// Apply a batch of stream commits atomically.
    ///
    /// Returns the resulting version of each stream, in input order.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: an `Exact` expectation did not hold
    /// - `StreamAlreadyExists`: a `NoStream` expectation did not hold
    /// - `EntityTypeMismatch`: a stream exists under another entity type
    /// - `InvalidCommit`: duplicate streams in the batch, or a start without events
    /// - `DatabaseError`: storage failure (nothing was written)
    fn commit(
        &self,
        commits: Vec<StreamCommit>,
    ) -> StoreFuture<'_, Result<Vec<Version>, EventStoreError>>;

    /// Load events from a stream in ascending version order.
    ///
    /// - `from_version`: `Some(v)` loads events with version `>= v`; `None` loads all.
    ///
    /// Returns an empty vector if the stream doesn't exist.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: Database connection or query failed
    fn load_events(
        &self,
        stream_id: StreamId,
        from_version: Option<Version>,
    ) -> StoreFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>>;

    /// Read up to `limit` events with a global position strictly greater than `after`,
    /// across all streams, in global order.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: Database connection or query failed
    fn read_all_since(
        &self,
        after: GlobalPosition,
        limit: usize,
    ) -> StoreFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>>;

    /// The highest committed global position (`GlobalPosition::START` when empty).
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: Database connection or query failed
    fn head_position(&self) -> StoreFuture<'_, Result<GlobalPosition, EventStoreError>>;

    /// Look up a stream's entity type and current version.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: Database connection or query failed
    fn stream_info(
        &self,
        stream_id: StreamId,
    ) -> StoreFuture<'_, Result<Option<StreamInfo>, EventStoreError>>;

    /// Load the snapshot persisted for a stream, if any.
    ///
    /// # Errors
    ///
    /// - `DatabaseError`: Database connection or query failed
    fn load_snapshot(
        &self,
        stream_id: StreamId,
    ) -> StoreFuture<'_, Result<Option<Snapshot>, EventStoreError>>;

    /// Append events to a stream with optimistic concurrency control.
    ///
    /// `expected_version` must equal the stream's current version; `None` (or
    /// `Some(Version::INITIAL)`) expects a stream with no events.
    ///
    /// Returns the new version: a stream at version 5 that receives 3 events
    /// is at version 8.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: Version mismatch (concurrent modification detected)
    /// - `DatabaseError`: Database connection or query failed
    fn append_events(
        &self,
        stream_id: StreamId,
        entity_type: &str,
        expected_version: Option<Version>,
        events: Vec<SerializedEvent>,
    ) -> StoreFuture<'_, Result<Version, EventStoreError>> {
        let commit = StreamCommit::new(stream_id, entity_type, expected_version.into(), events);
        Box::pin(async move { single_version(self.commit(vec![commit]).await?) })
    }

    /// Start a new stream with its first event(s).
    ///
    /// # Errors
    ///
    /// - `StreamAlreadyExists`: the id is already in use
    /// - `DatabaseError`: Database connection or query failed
    fn start_stream(
        &self,
        stream_id: StreamId,
        entity_type: &str,
        events: Vec<SerializedEvent>,
    ) -> StoreFuture<'_, Result<Version, EventStoreError>> {
        let commit = StreamCommit::new(stream_id, entity_type, ExpectedVersion::NoStream, events);
        Box::pin(async move { single_version(self.commit(vec![commit]).await?) })
    }

    /// Append events and upsert the stream's snapshot in one transaction.
    ///
    /// # Errors
    ///
    /// Same as [`EventStore::append_events`].
    fn append_with_snapshot(
        &self,
        stream_id: StreamId,
        entity_type: &str,
        expected: ExpectedVersion,
        events: Vec<SerializedEvent>,
        snapshot: Vec<u8>,
    ) -> StoreFuture<'_, Result<Version, EventStoreError>> {
        let commit =
            StreamCommit::new(stream_id, entity_type, expected, events).with_snapshot(snapshot);
        Box::pin(async move { single_version(self.commit(vec![commit]).await?) })
    }
}

fn single_version(versions: Vec<Version>) -> Result<Version, EventStoreError> {
    versions
        .into_iter()
        .next()
        .ok_or_else(|| EventStoreError::DatabaseError("commit returned no version".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(expected: ExpectedVersion, events: usize) -> StreamCommit {
        let events = (0..events)
            .map(|_| SerializedEvent::new("VideoViewed.v1".to_string(), vec![1], None))
            .collect();
        StreamCommit::new(StreamId::new("video-1"), "video", expected, events)
    }

    fn info(version: u64) -> StreamInfo {
        StreamInfo {
            stream_id: StreamId::new("video-1"),
            entity_type: "video".to_string(),
            version: Version::new(version),
        }
    }

    #[test]
    fn concurrency_conflict_error_display() {
        let error = EventStoreError::ConcurrencyConflict {
            stream_id: StreamId::new("video-1"),
            expected: Version::new(1),
            actual: Version::new(2),
        };

        let display = format!("{error}");
        assert!(display.contains("expected version 1"));
        assert!(display.contains("found 2"));
        assert!(error.is_conflict());
    }

    #[test]
    fn stream_not_found_is_not_a_conflict() {
        let error = EventStoreError::StreamNotFound(StreamId::new("missing-stream"));
        assert!(format!("{error}").contains("missing-stream"));
        assert!(!error.is_conflict());
    }

    #[test]
    fn exact_expectation_on_matching_stream_passes() {
        let at_two = commit(ExpectedVersion::Exact(Version::new(2)), 1);
        assert!(check_expectation(&at_two, Some(&info(2))).is_ok());
        let empty = commit(ExpectedVersion::Exact(Version::INITIAL), 1);
        assert!(check_expectation(&empty, None).is_ok());
    }

    #[test]
    fn stale_expectation_is_a_conflict() {
        let stale = commit(ExpectedVersion::Exact(Version::new(1)), 1);
        let result = check_expectation(&stale, Some(&info(2)));
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { expected, actual, .. })
                if expected == Version::new(1) && actual == Version::new(2)
        ));
    }

    #[test]
    fn exact_expectation_on_missing_stream_is_a_conflict() {
        let result = check_expectation(&commit(ExpectedVersion::Exact(Version::new(3)), 1), None);
        assert!(matches!(
            result,
            Err(EventStoreError::ConcurrencyConflict { actual, .. }) if actual == Version::INITIAL
        ));
    }

    #[test]
    fn start_on_existing_stream_already_exists() {
        let result = check_expectation(&commit(ExpectedVersion::NoStream, 1), Some(&info(1)));
        assert!(matches!(result, Err(EventStoreError::StreamAlreadyExists(_))));
    }

    #[test]
    fn start_without_events_is_invalid() {
        let result = check_expectation(&commit(ExpectedVersion::NoStream, 0), None);
        assert!(matches!(result, Err(EventStoreError::InvalidCommit(_))));
    }

    #[test]
    fn entity_type_must_match() {
        let mut other = info(1);
        other.entity_type = "user".to_string();
        let result = check_expectation(
            &commit(ExpectedVersion::Exact(Version::new(1)), 1),
            Some(&other),
        );
        assert!(matches!(result, Err(EventStoreError::EntityTypeMismatch { .. })));
    }

    #[test]
    fn duplicate_streams_in_one_batch_are_rejected() {
        let batch = vec![
            commit(ExpectedVersion::NoStream, 1),
            commit(ExpectedVersion::Exact(Version::new(1)), 1),
        ];
        assert!(matches!(
            check_distinct_streams(&batch),
            Err(EventStoreError::InvalidCommit(_))
        ));
    }

    #[test]
    fn resulting_version_counts_events() {
        assert_eq!(
            commit(ExpectedVersion::Exact(Version::new(5)), 3).resulting_version(),
            Version::new(8)
        );
        assert_eq!(commit(ExpectedVersion::NoStream, 1).resulting_version(), Version::new(1));
    }

    #[test]
    fn storage_timestamp_drops_nanoseconds() {
        let time = storage_timestamp(Utc::now());
        assert_eq!(time.timestamp_subsec_nanos() % 1_000, 0);
    }
}
