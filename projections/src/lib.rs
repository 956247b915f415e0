//! Projection daemon and `PostgreSQL` read-side storage for Eventline.
//!
//! # Overview
//!
//! - [`ProjectionDaemon`]: folds the global event log into a projection's
//!   rows, committing rows and cursor together
//! - [`PostgresProjectionStore`]: durable rows, cursors and the
//!   single-instance [`DaemonLease`]
//!
//! Any store implementing both `ProjectionStore` and `ProjectionCheckpoint`
//! works with the daemon; tests use `eventline_testing::InMemoryProjectionStore`.
//!
//! # Example
//!
//! ```ignore
//! use eventline_projections::{DaemonConfig, PostgresProjectionStore, ProjectionDaemon};
//!
//! let store = Arc::new(PostgresProjectionStore::from_pool(pool));
//! store.migrate().await?;
//! let _lease = store.acquire_lease("GlobalVideoCounter").await?;
//!
//! let handle = ProjectionDaemon::new(counter, events, store, DaemonConfig::default()).spawn();
//! // ...
//! handle.shutdown().await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod daemon;
pub mod postgres;

pub use daemon::{
    CycleReport, DaemonConfig, DaemonHandle, DaemonProgress, DaemonState, ProjectionDaemon,
};
pub use postgres::{DaemonLease, PostgresProjectionStore};
