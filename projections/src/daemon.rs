//! `ProjectionDaemon`: folds the global event log into a projection's rows.
//!
//! # Overview
//!
//! The daemon is a single long-lived task per projection:
//!
//! ```text
//!          ┌──────────────────────────────────────────────┐
//!          ▼                                              │
//!  Idle ─▶ Polling ─▶ Applying ─▶ Persisting ─────────────┘
//!            │ read_all_since   fold matching    rows + cursor
//!            │ (cursor, batch)  events in order  in one commit
//!            ▼
//!      empty: back off
//! ```
//!
//! # Delivery
//!
//! Rows and cursor are committed together through
//! [`ProjectionStore::commit`], so an event is folded exactly once: a crash
//! before the commit replays the batch, a crash after it resumes past it.
//!
//! # Failures
//!
//! When a fold fails the daemon commits the part of the batch it got
//! through, logs the failure, and keeps retrying the failing event with
//! backoff. Progress for that projection stalls until the event can be
//! folded; the daemon itself never exits on its own.
//!
//! # Single instance
//!
//! Running two daemons for the same projection would double count. Hold a
//! `DaemonLease` (see [`crate::postgres::PostgresProjectionStore::acquire_lease`])
//! for as long as the daemon runs.
//!
//! # Example
//!
//! ```ignore
//! let daemon = ProjectionDaemon::new(
//!     GlobalVideoCounterProjection,
//!     event_store.clone(),
//!     projection_store.clone(),
//!     DaemonConfig::default(),
//! );
//!
//! let handle = daemon.spawn();
//! handle.wait_for_position(GlobalPosition::new(42)).await?;
//! handle.shutdown().await?;
//! ```

use eventline_core::event::RecordedEvent;
use eventline_core::event_store::EventStore;
use eventline_core::projection::{
    EventPosition, Projection, ProjectionCheckpoint, ProjectionError, ProjectionStore, Result,
    ViewRow, decode_view, encode_view, view_key,
};
use eventline_core::stream::GlobalPosition;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Polling and backoff settings for a [`ProjectionDaemon`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonConfig {
    /// Maximum number of events read and committed per cycle.
    pub batch_size: usize,
    /// Delay after the first empty poll or failure.
    pub poll_interval: Duration,
    /// Upper bound for the doubling delay.
    pub max_backoff: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Where the daemon is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Waiting before the next poll.
    Idle,
    /// Reading the log past the cursor.
    Polling,
    /// Folding a batch in memory.
    Applying,
    /// Committing rows and cursor.
    Persisting,
    /// A fold or storage failure; retrying after backoff.
    Stalled,
    /// Shut down.
    Stopped,
}

/// State and committed cursor, published on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonProgress {
    /// Current state.
    pub state: DaemonState,
    /// Last committed global position.
    pub position: GlobalPosition,
}

/// Outcome of one Polling → Applying → Persisting cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Events read from the log (matching or not).
    pub processed: usize,
    /// Events folded into rows.
    pub applied: usize,
    /// Cursor after the cycle.
    pub position: GlobalPosition,
}

impl CycleReport {
    /// Whether the poll found nothing new.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.processed == 0
    }
}

/// Folds events from all streams into one projection, tracking its own cursor.
///
/// # Type Parameters
///
/// - `P`: the projection
/// - `S`: row and cursor storage; must commit both atomically
pub struct ProjectionDaemon<P, S>
where
    P: Projection,
{
    projection: Arc<P>,
    events: Arc<dyn EventStore>,
    store: Arc<S>,
    config: DaemonConfig,
    progress: watch::Sender<DaemonProgress>,
}

impl<P, S> ProjectionDaemon<P, S>
where
    P: Projection,
    S: ProjectionStore + ProjectionCheckpoint + 'static,
{
    /// Create a daemon; nothing runs until [`ProjectionDaemon::spawn`] or
    /// [`ProjectionDaemon::run_once`].
    #[must_use]
    pub fn new(
        projection: P,
        events: Arc<dyn EventStore>,
        store: Arc<S>,
        config: DaemonConfig,
    ) -> Self {
        let (progress, _) = watch::channel(DaemonProgress {
            state: DaemonState::Idle,
            position: GlobalPosition::START,
        });
        Self {
            projection: Arc::new(projection),
            events,
            store,
            config,
            progress,
        }
    }

    /// The managed projection.
    #[must_use]
    pub fn projection(&self) -> &P {
        &self.projection
    }

    /// Last committed cursor ([`GlobalPosition::START`] if never committed).
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] if the cursor cannot be read.
    pub async fn position(&self) -> Result<GlobalPosition> {
        Ok(self
            .store
            .load_position(self.projection.name())
            .await?
            .map_or(GlobalPosition::START, |position| position.global_position()))
    }

    /// Number of committed events the projection has not processed yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor or the log head cannot be read.
    pub async fn lag(&self) -> Result<u64> {
        let position = self.position().await?;
        let head = self
            .events
            .head_position()
            .await
            .map_err(|e| ProjectionError::EventSource(e.to_string()))?;
        Ok(head.value().saturating_sub(position.value()))
    }

    /// Delete the projection's rows and reset its cursor to the start.
    ///
    /// The next cycle replays the whole log. Do not call while a spawned
    /// daemon for the same projection is running.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the reset fails.
    pub async fn rebuild(&self) -> Result<()> {
        let name = self.projection.name();
        tracing::info!(projection = name, "Rebuilding projection");
        self.store.reset(name).await?;
        self.publish(DaemonState::Idle, GlobalPosition::START);
        tracing::info!(projection = name, "Projection reset, replaying from the start");
        Ok(())
    }

    /// Run a single Polling → Applying → Persisting cycle.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Replay`]: a fold failed; events before it were committed
    /// - [`ProjectionError::EventSource`] / [`ProjectionError::Storage`]: I/O failure
    pub async fn run_once(&self) -> Result<CycleReport> {
        let name = self.projection.name();
        let cursor = self.position().await?;

        self.publish(DaemonState::Polling, cursor);
        let batch = self
            .events
            .read_all_since(cursor, self.config.batch_size)
            .await
            .map_err(|e| ProjectionError::EventSource(e.to_string()))?;
        if batch.is_empty() {
            return Ok(CycleReport {
                processed: 0,
                applied: 0,
                position: cursor,
            });
        }

        self.publish(DaemonState::Applying, cursor);
        let mut views: HashMap<String, P::View> = HashMap::new();
        let mut last: Option<&RecordedEvent> = None;
        let mut processed = 0;
        let mut applied = 0;
        let mut failure = None;
        for event in &batch {
            if self.projection.handles(event) {
                if let Err(error) = self.fold(&mut views, event).await {
                    failure = Some(error);
                    break;
                }
                applied += 1;
            }
            last = Some(event);
            processed += 1;
        }

        let position = match last {
            Some(event) => {
                self.publish(DaemonState::Persisting, cursor);
                self.persist(views, event).await?;
                event.global_position
            }
            None => cursor,
        };

        if applied > 0 {
            metrics::counter!(
                "eventline_projection_events_applied_total",
                "projection" => name.to_string()
            )
            .increment(applied as u64);
        }
        #[allow(clippy::cast_precision_loss)]
        let gauge_value = position.value() as f64;
        metrics::gauge!("eventline_projection_position", "projection" => name.to_string())
            .set(gauge_value);

        match failure {
            Some(error) => Err(error),
            None => {
                tracing::debug!(
                    projection = name,
                    processed,
                    applied,
                    position = %position,
                    "Batch committed"
                );
                Ok(CycleReport {
                    processed,
                    applied,
                    position,
                })
            }
        }
    }

    /// Run cycles until `shutdown` turns `true`.
    ///
    /// Full batches are followed immediately by the next poll; empty polls
    /// and failures wait `poll_interval`, doubling up to `max_backoff`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.projection.name().to_string();
        tracing::info!(projection = %name, "Starting projection daemon");

        let mut backoff = self.config.poll_interval;
        let mut committed = match self.position().await {
            Ok(position) => {
                tracing::info!(projection = %name, position = %position, "Resuming from cursor");
                position
            }
            Err(error) => {
                tracing::warn!(
                    projection = %name,
                    error = %error,
                    "Failed to read cursor at startup, retrying in the first cycle"
                );
                GlobalPosition::START
            }
        };

        while !*shutdown.borrow() {
            let wait = match self.run_once().await {
                Ok(report) if !report.is_empty() => {
                    committed = report.position;
                    backoff = self.config.poll_interval;
                    None
                }
                Ok(report) => {
                    committed = report.position;
                    let wait = backoff;
                    backoff = self.next_backoff(backoff);
                    Some((DaemonState::Idle, wait))
                }
                Err(error) => {
                    metrics::counter!(
                        "eventline_projection_failures_total",
                        "projection" => name.clone()
                    )
                    .increment(1);
                    tracing::error!(
                        projection = %name,
                        error = %error,
                        retry_in_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "Projection stalled"
                    );
                    if let Ok(position) = self.position().await {
                        committed = position;
                    }
                    let wait = backoff;
                    backoff = self.next_backoff(backoff);
                    Some((DaemonState::Stalled, wait))
                }
            };

            match wait {
                Some((state, delay)) => {
                    self.publish(state, committed);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                None => self.publish(DaemonState::Idle, committed),
            }
        }

        self.publish(DaemonState::Stopped, committed);
        tracing::info!(projection = %name, position = %committed, "Projection daemon stopped");
    }

    /// Run the daemon on a background task.
    #[must_use]
    pub fn spawn(self) -> DaemonHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let progress = self.progress.subscribe();
        let task = tokio::spawn(self.run(shutdown_rx));
        DaemonHandle {
            shutdown: shutdown_tx,
            progress,
            task,
        }
    }

    async fn fold(
        &self,
        views: &mut HashMap<String, P::View>,
        event: &RecordedEvent,
    ) -> Result<()> {
        let view_id = self.projection.view_id(event);
        if !views.contains_key(&view_id) {
            let key = view_key(self.projection.name(), &view_id);
            if let Some(bytes) = self.store.get(&key).await? {
                views.insert(view_id.clone(), decode_view(&bytes)?);
            }
        }

        // Fold into a copy so a failed apply leaves the cached view untouched.
        let next = match views.get(&view_id) {
            Some(current) => {
                let mut next = current.clone();
                self.projection.apply(&mut next, event)?;
                next
            }
            None => self.projection.create(event)?,
        };
        views.insert(view_id, next);
        Ok(())
    }

    async fn persist(&self, views: HashMap<String, P::View>, last: &RecordedEvent) -> Result<()> {
        let name = self.projection.name();
        let rows = views
            .iter()
            .map(|(view_id, view)| {
                Ok(ViewRow {
                    key: view_key(name, view_id),
                    data: encode_view(view)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let position = EventPosition::new(last.global_position.value(), last.recorded_at);
        self.store.commit(name, rows, position).await
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.config.max_backoff)
    }

    fn publish(&self, state: DaemonState, position: GlobalPosition) {
        self.progress.send_replace(DaemonProgress { state, position });
    }
}

/// Control handle for a spawned [`ProjectionDaemon`].
pub struct DaemonHandle {
    shutdown: watch::Sender<bool>,
    progress: watch::Receiver<DaemonProgress>,
    task: JoinHandle<()>,
}

impl DaemonHandle {
    /// Latest published progress.
    #[must_use]
    pub fn progress(&self) -> DaemonProgress {
        *self.progress.borrow()
    }

    /// A receiver that observes every progress update.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DaemonProgress> {
        self.progress.clone()
    }

    /// Wait until the committed cursor reaches `target`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Stopped`] if the daemon exits first.
    pub async fn wait_for_position(&self, target: GlobalPosition) -> Result<DaemonProgress> {
        let mut progress = self.progress.clone();
        let reached = progress
            .wait_for(|p| p.position >= target || p.state == DaemonState::Stopped)
            .await
            .map(|p| *p)
            .map_err(|_| ProjectionError::Stopped)?;
        if reached.position >= target {
            Ok(reached)
        } else {
            Err(ProjectionError::Stopped)
        }
    }

    /// Signal shutdown and wait for the daemon to finish its current cycle.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Stopped`] if the daemon task panicked.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.map_err(|_| ProjectionError::Stopped)
    }
}
