//! Inline snapshot writer: the command-write path for aggregates.
//!
//! Every state-changing command goes through an [`AggregateRepository`]:
//!
//! 1. Load the current state and version (snapshot plus any newer events)
//! 2. The caller derives new events from that state
//! 3. The events are folded onto the state and the result is encoded as the
//!    stream's snapshot
//! 4. Events and snapshot are committed together with `expected = loaded version`
//!
//! A [`EventStoreError::ConcurrencyConflict`] means another writer got there
//! first. Nothing was written; re-load and decide again.
//!
//! # Example
//!
//! ```ignore
//! let videos = AggregateRepository::<Video>::new(store.clone(), clock.clone());
//!
//! let video = videos
//!     .execute(&video_id, |video| {
//!         Ok::<_, RepositoryError>(vec![SerializedEvent::from_event(
//!             &VideoViewed { video_id: video.id.clone(), user_id },
//!             None,
//!         )?])
//!     })
//!     .await?;
//! ```

use crate::aggregate::{
    Aggregate, AggregateError, EventFolds, decode_snapshot, encode_snapshot, fold_onto,
};
use crate::environment::Clock;
use crate::event::{EventError, EventView, RecordedEvent, SerializedEvent};
use crate::event_store::{EventStore, EventStoreError, StreamCommit, storage_timestamp};
use crate::stream::{ExpectedVersion, StreamId, Version};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;

/// Errors from the aggregate write path.
#[derive(Error, Debug)]
pub enum RepositoryError {
    /// The event store rejected the read or write.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// Folding events into the aggregate failed.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// A new event could not be serialized.
    #[error(transparent)]
    Event(#[from] EventError),

    /// A start-stream request whose events never create the aggregate.
    #[error("Events for new stream {0} contain no creating event")]
    NoCreatingEvent(StreamId),
}

impl RepositoryError {
    /// Whether this is a lost update or id collision.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(error) if error.is_conflict())
    }

    /// Whether the target stream does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(EventStoreError::StreamNotFound(_)))
    }
}

/// Aggregate state together with the stream version it reflects.
#[derive(Clone, Debug, PartialEq)]
pub struct Versioned<A> {
    /// The stream the state was derived from.
    pub stream_id: StreamId,
    /// The aggregate state.
    pub state: A,
    /// Sequence number of the last event folded into `state`.
    pub version: Version,
}

/// Reads and writes one aggregate type, keeping its snapshot in step with its stream.
pub struct AggregateRepository<A: Aggregate> {
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
    folds: EventFolds<A>,
}

impl<A: Aggregate> AggregateRepository<A> {
    /// Create a repository; the aggregate's fold table is built here, once.
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            folds: A::folds(),
        }
    }

    /// The underlying event store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    /// Load current state from the snapshot plus any events newer than it.
    ///
    /// Returns `Ok(None)` if the stream does not exist or has no creating event.
    ///
    /// # Errors
    ///
    /// - `EntityTypeMismatch`: the stream belongs to another aggregate type
    /// - storage and fold failures
    pub async fn load(
        &self,
        stream_id: &StreamId,
    ) -> Result<Option<Versioned<A>>, RepositoryError> {
        let Some(info) = self.store.stream_info(stream_id.clone()).await? else {
            return Ok(None);
        };
        if info.entity_type != A::ENTITY_TYPE {
            return Err(EventStoreError::EntityTypeMismatch {
                stream_id: stream_id.clone(),
                expected: A::ENTITY_TYPE.to_string(),
                actual: info.entity_type,
            }
            .into());
        }

        let (state, version) = match self.store.load_snapshot(stream_id.clone()).await? {
            Some(snapshot) => match decode_snapshot::<A>(&snapshot.state) {
                Ok(state) => (Some(state), snapshot.version),
                Err(error) => {
                    tracing::warn!(
                        stream_id = %stream_id,
                        entity_type = A::ENTITY_TYPE,
                        error = %error,
                        "Unreadable snapshot, replaying stream from the start"
                    );
                    (None, Version::INITIAL)
                }
            },
            None => (None, Version::INITIAL),
        };

        if version >= info.version && state.is_some() {
            return Ok(state.map(|state| Versioned {
                stream_id: stream_id.clone(),
                state,
                version,
            }));
        }

        let tail = self
            .store
            .load_events(stream_id.clone(), Some(version.next()))
            .await?;
        self.fold_recorded(stream_id, state, version, &tail)
    }

    /// Load current state, failing if the stream does not exist.
    ///
    /// # Errors
    ///
    /// - `StreamNotFound`: no stream (or no creating event) for this id
    /// - everything [`AggregateRepository::load`] returns
    pub async fn get(&self, stream_id: &StreamId) -> Result<Versioned<A>, RepositoryError> {
        self.load(stream_id)
            .await?
            .ok_or_else(|| EventStoreError::StreamNotFound(stream_id.clone()).into())
    }

    /// Rebuild state by replaying the whole stream, ignoring the snapshot.
    ///
    /// # Errors
    ///
    /// Storage and fold failures.
    pub async fn replay(
        &self,
        stream_id: &StreamId,
    ) -> Result<Option<Versioned<A>>, RepositoryError> {
        let events = self.store.load_events(stream_id.clone(), None).await?;
        self.fold_recorded(stream_id, None, Version::INITIAL, &events)
    }

    /// Build the commit that starts a new stream, plus the state it produces.
    ///
    /// # Errors
    ///
    /// - `NoCreatingEvent`: none of the events creates the aggregate
    /// - fold and snapshot encoding failures
    pub fn prepare_start(
        &self,
        stream_id: StreamId,
        events: Vec<SerializedEvent>,
    ) -> Result<(StreamCommit, Versioned<A>), RepositoryError> {
        let recorded_at = storage_timestamp(self.clock.now());
        let state = self
            .fold_pending(&stream_id, None, Version::INITIAL, &events, recorded_at)?
            .ok_or_else(|| RepositoryError::NoCreatingEvent(stream_id.clone()))?;
        let version = Version::new(events.len() as u64);
        let commit = StreamCommit::new(
            stream_id.clone(),
            A::ENTITY_TYPE,
            ExpectedVersion::NoStream,
            events,
        )
        .with_recorded_at(recorded_at)
        .with_snapshot(encode_snapshot(&state)?);

        Ok((
            commit,
            Versioned {
                stream_id,
                state,
                version,
            },
        ))
    }

    /// Build the commit that appends to a loaded stream, plus the state it produces.
    ///
    /// The commit expects the stream to still be at `current.version`.
    ///
    /// # Errors
    ///
    /// Fold and snapshot encoding failures.
    pub fn prepare_append(
        &self,
        current: &Versioned<A>,
        events: Vec<SerializedEvent>,
    ) -> Result<(StreamCommit, Versioned<A>), RepositoryError> {
        let recorded_at = storage_timestamp(self.clock.now());
        let state = self
            .fold_pending(
                &current.stream_id,
                Some(current.state.clone()),
                current.version,
                &events,
                recorded_at,
            )?
            .ok_or_else(|| RepositoryError::NoCreatingEvent(current.stream_id.clone()))?;
        let version = current.version + events.len() as u64;
        let commit = StreamCommit::new(
            current.stream_id.clone(),
            A::ENTITY_TYPE,
            ExpectedVersion::Exact(current.version),
            events,
        )
        .with_recorded_at(recorded_at)
        .with_snapshot(encode_snapshot(&state)?);

        Ok((
            commit,
            Versioned {
                stream_id: current.stream_id.clone(),
                state,
                version,
            },
        ))
    }

    /// Start a new stream.
    ///
    /// # Errors
    ///
    /// - `StreamAlreadyExists`: the id is in use
    /// - everything [`AggregateRepository::prepare_start`] returns
    pub async fn start(
        &self,
        stream_id: StreamId,
        events: Vec<SerializedEvent>,
    ) -> Result<Versioned<A>, RepositoryError> {
        let (commit, next) = self.prepare_start(stream_id, events)?;
        self.store.commit(vec![commit]).await?;
        tracing::debug!(
            stream_id = %next.stream_id,
            entity_type = A::ENTITY_TYPE,
            version = %next.version,
            "Stream started"
        );
        Ok(next)
    }

    /// Append events to a loaded stream and persist the new snapshot.
    ///
    /// Appending no events returns `current` without touching the store.
    ///
    /// # Errors
    ///
    /// - `ConcurrencyConflict`: the stream moved past `current.version`
    /// - everything [`AggregateRepository::prepare_append`] returns
    pub async fn append(
        &self,
        current: &Versioned<A>,
        events: Vec<SerializedEvent>,
    ) -> Result<Versioned<A>, RepositoryError> {
        if events.is_empty() {
            return Ok(current.clone());
        }
        let (commit, next) = self.prepare_append(current, events)?;
        self.store.commit(vec![commit]).await?;
        tracing::debug!(
            stream_id = %next.stream_id,
            entity_type = A::ENTITY_TYPE,
            version = %next.version,
            "Events appended"
        );
        Ok(next)
    }

    /// Load the aggregate, let `decide` derive events from it, and append them.
    ///
    /// # Errors
    ///
    /// - `StreamNotFound`: updates never create streams
    /// - `ConcurrencyConflict`: another writer advanced the stream meanwhile
    /// - whatever `decide` returns
    pub async fn execute<F, E>(&self, stream_id: &StreamId, decide: F) -> Result<Versioned<A>, E>
    where
        F: FnOnce(&A) -> Result<Vec<SerializedEvent>, E>,
        E: From<RepositoryError>,
    {
        let current = self.get(stream_id).await?;
        let events = decide(&current.state)?;
        Ok(self.append(&current, events).await?)
    }

    fn fold_recorded(
        &self,
        stream_id: &StreamId,
        state: Option<A>,
        version: Version,
        events: &[RecordedEvent],
    ) -> Result<Option<Versioned<A>>, RepositoryError> {
        let version = events.last().map_or(version, |event| event.version);
        let state = fold_onto(&self.folds, state, events.iter().map(RecordedEvent::view))?;
        Ok(state.map(|state| Versioned {
            stream_id: stream_id.clone(),
            state,
            version,
        }))
    }

    fn fold_pending(
        &self,
        stream_id: &StreamId,
        state: Option<A>,
        base: Version,
        events: &[SerializedEvent],
        recorded_at: DateTime<Utc>,
    ) -> Result<Option<A>, AggregateError> {
        let views = events.iter().zip(1_u64..).map(|(event, offset)| EventView {
            stream_id,
            version: base + offset,
            event_type: &event.event_type,
            data: &event.data,
            recorded_at,
        });
        fold_onto(&self.folds, state, views)
    }
}

impl<A: Aggregate> Clone for AggregateRepository<A> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            folds: A::folds(),
        }
    }
}
