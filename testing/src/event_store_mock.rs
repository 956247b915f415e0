//! In-memory event store for fast, deterministic tests.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use eventline_core::event::RecordedEvent;
use eventline_core::event_store::{
    EventStore, EventStoreError, Snapshot, StoreFuture, StreamCommit, StreamInfo,
    check_distinct_streams, check_expectation,
};
use eventline_core::stream::{GlobalPosition, StreamId, Version};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct StoreState {
    streams: HashMap<StreamId, StreamInfo>,
    log: Vec<RecordedEvent>,
    snapshots: HashMap<StreamId, Snapshot>,
}

impl StoreState {
    fn head(&self) -> GlobalPosition {
        self.log
            .last()
            .map_or(GlobalPosition::START, |event| event.global_position)
    }
}

/// `HashMap`-backed [`EventStore`] with the same commit rules as the Postgres store.
///
/// A single lock guards streams, log and snapshots, so every commit is
/// all-or-nothing and global positions are handed out in commit order.
///
/// # Example
///
/// ```
/// use eventline_testing::InMemoryEventStore;
/// use eventline_core::event::SerializedEvent;
/// use eventline_core::event_store::EventStore;
/// use eventline_core::stream::{StreamId, Version};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryEventStore::new();
/// let event = SerializedEvent::new("VideoUploaded.v1".to_string(), vec![1, 2, 3], None);
///
/// let version = store
///     .start_stream(StreamId::new("video-1"), "video", vec![event])
///     .await?;
/// assert_eq!(version, Version::new(1));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events across all streams.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.state.read().unwrap().log.len()
    }

    /// Number of streams.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.state.read().unwrap().streams.len()
    }

    /// Whether a snapshot exists for `stream_id`.
    #[must_use]
    pub fn has_snapshot(&self, stream_id: &StreamId) -> bool {
        self.state.read().unwrap().snapshots.contains_key(stream_id)
    }

    /// Overwrite a stream's snapshot bytes, bypassing the commit path.
    ///
    /// Lets tests simulate a stale or corrupt snapshot.
    pub fn put_snapshot(&self, stream_id: StreamId, snapshot: Snapshot) {
        self.state
            .write()
            .unwrap()
            .snapshots
            .insert(stream_id, snapshot);
    }

    /// Overwrite an event's payload in the log, bypassing the commit path.
    ///
    /// Lets tests simulate a malformed payload already in storage.
    pub fn corrupt_event(&self, position: GlobalPosition, data: Vec<u8>) {
        let mut state = self.state.write().unwrap();
        if let Some(event) = state
            .log
            .iter_mut()
            .find(|event| event.global_position == position)
        {
            event.data = data;
        }
    }

    /// Remove all streams, events and snapshots.
    pub fn clear(&self) {
        *self.state.write().unwrap() = StoreState::default();
    }

    fn apply(&self, commits: Vec<StreamCommit>) -> Result<Vec<Version>, EventStoreError> {
        check_distinct_streams(&commits)?;

        let mut state = self.state.write().unwrap();
        for commit in &commits {
            check_expectation(commit, state.streams.get(&commit.stream_id))?;
        }

        let mut position = state.head();
        let mut versions = Vec::with_capacity(commits.len());
        for commit in commits {
            let mut version = commit.expected.version();
            for event in commit.events {
                version = version.next();
                position = position.next();
                state.log.push(RecordedEvent {
                    stream_id: commit.stream_id.clone(),
                    entity_type: commit.entity_type.clone(),
                    version,
                    global_position: position,
                    event_type: event.event_type,
                    data: event.data,
                    metadata: event.metadata,
                    recorded_at: commit.recorded_at,
                });
            }

            if version > Version::INITIAL {
                state.streams.insert(
                    commit.stream_id.clone(),
                    StreamInfo {
                        stream_id: commit.stream_id.clone(),
                        entity_type: commit.entity_type,
                        version,
                    },
                );
            }
            if let Some(snapshot) = commit.snapshot {
                state.snapshots.insert(
                    commit.stream_id,
                    Snapshot {
                        version,
                        state: snapshot,
                    },
                );
            }
            versions.push(version);
        }

        tracing::trace!(head = %position, "In-memory commit applied");
        Ok(versions)
    }
}

impl EventStore for InMemoryEventStore {
    fn commit(
        &self,
        commits: Vec<StreamCommit>,
    ) -> StoreFuture<'_, Result<Vec<Version>, EventStoreError>> {
        Box::pin(async move { self.apply(commits) })
    }

    fn load_events(
        &self,
        stream_id: StreamId,
        from_version: Option<Version>,
    ) -> StoreFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>> {
        Box::pin(async move {
            let from = from_version.unwrap_or(Version::INITIAL);
            Ok(self
                .state
                .read()
                .unwrap()
                .log
                .iter()
                .filter(|event| event.stream_id == stream_id && event.version >= from)
                .cloned()
                .collect())
        })
    }

    fn read_all_since(
        &self,
        after: GlobalPosition,
        limit: usize,
    ) -> StoreFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>> {
        Box::pin(async move {
            let state = self.state.read().unwrap();
            // Positions are dense and start at 1, so `after` is also the log index.
            let start = usize::try_from(after.value()).unwrap_or(usize::MAX);
            Ok(state.log.iter().skip(start).take(limit).cloned().collect())
        })
    }

    fn head_position(&self) -> StoreFuture<'_, Result<GlobalPosition, EventStoreError>> {
        Box::pin(async move { Ok(self.state.read().unwrap().head()) })
    }

    fn stream_info(
        &self,
        stream_id: StreamId,
    ) -> StoreFuture<'_, Result<Option<StreamInfo>, EventStoreError>> {
        Box::pin(async move { Ok(self.state.read().unwrap().streams.get(&stream_id).cloned()) })
    }

    fn load_snapshot(
        &self,
        stream_id: StreamId,
    ) -> StoreFuture<'_, Result<Option<Snapshot>, EventStoreError>> {
        Box::pin(async move {
            Ok(self
                .state
                .read()
                .unwrap()
                .snapshots
                .get(&stream_id)
                .cloned())
        })
    }
}
