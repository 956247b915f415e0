//! In-memory projection testing utilities
//!
//! Provides fast, deterministic testing infrastructure for projections:
//! - [`InMemoryProjectionStore`]: `HashMap`-based row storage with atomic row-plus-cursor commits
//! - [`ProjectionTestHarness`]: Fluent API for asserting on projection folds

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use eventline_core::event::RecordedEvent;
use eventline_core::projection::{
    EventPosition, Projection, ProjectionCheckpoint, ProjectionStore, Result, ViewRow,
    decode_view, view_key,
};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct Tables {
    rows: HashMap<String, Vec<u8>>,
    positions: HashMap<String, EventPosition>,
}

/// In-memory projection store for fast, deterministic testing.
///
/// Rows and cursors share one lock, so [`ProjectionStore::commit`] is atomic
/// just like the Postgres implementation's transaction.
///
/// # Example
///
/// ```
/// use eventline_testing::InMemoryProjectionStore;
/// use eventline_core::projection::ProjectionStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryProjectionStore::new();
///
/// store.save("counter:GlobalVideoCounter", b"view data").await?;
///
/// let data = store.get("counter:GlobalVideoCounter").await?;
/// assert!(data.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryProjectionStore {
    tables: Arc<RwLock<Tables>>,
    failing_commits: Arc<RwLock<usize>>,
    failing_loads: Arc<RwLock<usize>>,
}

impl InMemoryProjectionStore {
    /// Create a new empty in-memory projection store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all rows and cursors (for test isolation)
    pub fn clear(&self) {
        *self.tables.write().unwrap() = Tables::default();
    }

    /// Get the number of stored rows
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().unwrap().rows.len()
    }

    /// Check if the store has no rows
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.read().unwrap().rows.is_empty()
    }

    /// Get all row keys in the store
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.tables.read().unwrap().rows.keys().cloned().collect()
    }

    /// Make the next `count` commits fail with a storage error.
    ///
    /// Simulates a lost database connection in the middle of a batch.
    pub fn fail_next_commits(&self, count: usize) {
        *self.failing_commits.write().unwrap() = count;
    }

    /// Make the next `count` cursor loads fail with a checkpoint error.
    pub fn fail_next_loads(&self, count: usize) {
        *self.failing_loads.write().unwrap() = count;
    }

    /// Decode the row `view_id` of `projection_name`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the stored bytes do not decode.
    pub fn view<V: serde::de::DeserializeOwned>(
        &self,
        projection_name: &str,
        view_id: &str,
    ) -> Result<Option<V>> {
        let key = view_key(projection_name, view_id);
        self.tables
            .read()
            .unwrap()
            .rows
            .get(&key)
            .map(|bytes| decode_view(bytes))
            .transpose()
    }
}

impl ProjectionStore for InMemoryProjectionStore {
    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        self.tables
            .write()
            .unwrap()
            .rows
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.read().unwrap().rows.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.tables.write().unwrap().rows.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.tables.read().unwrap().rows.contains_key(key))
    }

    async fn commit(
        &self,
        projection_name: &str,
        rows: Vec<ViewRow>,
        position: EventPosition,
    ) -> Result<()> {
        {
            let mut failing = self.failing_commits.write().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(eventline_core::projection::ProjectionError::Storage(
                    "simulated commit failure".to_string(),
                ));
            }
        }

        let mut tables = self.tables.write().unwrap();
        for row in rows {
            tables.rows.insert(row.key, row.data);
        }
        tables
            .positions
            .insert(projection_name.to_string(), position);
        Ok(())
    }

    async fn reset(&self, projection_name: &str) -> Result<()> {
        let prefix = view_key(projection_name, "");
        let mut tables = self.tables.write().unwrap();
        tables.rows.retain(|key, _| !key.starts_with(&prefix));
        tables.positions.remove(projection_name);
        Ok(())
    }
}

impl ProjectionCheckpoint for InMemoryProjectionStore {
    fn save_position(
        &self,
        projection_name: &str,
        position: EventPosition,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let projection_name = projection_name.to_string();
        Box::pin(async move {
            self.tables
                .write()
                .unwrap()
                .positions
                .insert(projection_name, position);
            Ok(())
        })
    }

    fn load_position(
        &self,
        projection_name: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<EventPosition>>> + Send + '_>> {
        let projection_name = projection_name.to_string();
        Box::pin(async move {
            {
                let mut failing = self.failing_loads.write().unwrap();
                if *failing > 0 {
                    *failing -= 1;
                    return Err(eventline_core::projection::ProjectionError::Checkpoint(
                        "simulated cursor read failure".to_string(),
                    ));
                }
            }
            Ok(self
                .tables
                .read()
                .unwrap()
                .positions
                .get(&projection_name)
                .copied())
        })
    }
}

/// Test harness for projections providing a fluent testing API.
///
/// Folds events through a projection's `create`/`apply` in memory, without a
/// store or daemon, so fold logic can be asserted on directly.
///
/// # Example
///
/// ```ignore
/// let mut harness = ProjectionTestHarness::new(GlobalVideoCounterProjection);
///
/// harness.given_events(&[viewed_1, viewed_2])?;
/// assert_eq!(harness.view("GlobalVideoCounter").unwrap().total_video_views, 2);
/// ```
pub struct ProjectionTestHarness<P: Projection> {
    projection: P,
    views: HashMap<String, P::View>,
}

impl<P: Projection> ProjectionTestHarness<P> {
    /// Create a new test harness for the given projection.
    #[must_use]
    pub fn new(projection: P) -> Self {
        Self {
            projection,
            views: HashMap::new(),
        }
    }

    /// Fold a series of events, skipping those the projection does not handle.
    ///
    /// # Errors
    ///
    /// Returns the first fold failure.
    pub fn given_events(&mut self, events: &[RecordedEvent]) -> Result<&mut Self> {
        for event in events {
            self.given_event(event)?;
        }
        Ok(self)
    }

    /// Fold a single event.
    ///
    /// # Errors
    ///
    /// Returns the fold failure.
    pub fn given_event(&mut self, event: &RecordedEvent) -> Result<&mut Self> {
        if !self.projection.handles(event) {
            return Ok(self);
        }
        let view_id = self.projection.view_id(event);
        match self.views.get_mut(&view_id) {
            Some(view) => self.projection.apply(view, event)?,
            None => {
                let view = self.projection.create(event)?;
                self.views.insert(view_id, view);
            }
        }
        Ok(self)
    }

    /// The current row for `view_id`.
    #[must_use]
    pub fn view(&self, view_id: &str) -> Option<&P::View> {
        self.views.get(view_id)
    }

    /// Number of rows the events produced.
    #[must_use]
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Whether no rows have been produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Get a reference to the projection.
    #[must_use]
    pub const fn projection(&self) -> &P {
        &self.projection
    }
}
