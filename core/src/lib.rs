//! # Eventline Core
//!
//! Core traits and types for an event-sourced persistence layer.
//!
//! Every entity is an append-only stream of immutable events. Current state is
//! a left fold of those events; a snapshot of the folded state is written in
//! the same transaction as the events so reads rarely replay. A projection
//! daemon tails the global log to maintain cross-stream read models.
//!
//! ## Core Concepts
//!
//! - **Stream**: ordered, versioned event sequence of one entity ([`stream`])
//! - **Event Store**: atomic multi-stream commits with optimistic concurrency ([`event_store`])
//! - **Aggregate**: typed create/apply folds per event tag ([`aggregate`])
//! - **Repository**: load-decide-append with inline snapshots ([`repository`])
//! - **Projection**: multi-stream read models with a persisted cursor ([`projection`])
//!
//! ## Example
//!
//! ```ignore
//! use eventline_core::prelude::*;
//!
//! let videos = AggregateRepository::<Video>::new(store, Arc::new(SystemClock));
//!
//! let video = videos
//!     .start(
//!         StreamId::new("video-1"),
//!         vec![SerializedEvent::from_event(&VideoUploaded { title: "Intro".into() }, None)?],
//!     )
//!     .await?;
//! assert_eq!(video.version, Version::new(1));
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod aggregate;
pub mod environment;
pub mod event;
pub mod event_store;
pub mod projection;
pub mod repository;
pub mod stream;

/// Everything needed to define aggregates and drive the write path.
pub mod prelude {
    pub use crate::aggregate::{Aggregate, AggregateError, EventFolds};
    pub use crate::environment::{Clock, SystemClock};
    pub use crate::event::{Event, EventError, EventView, RecordedEvent, SerializedEvent};
    pub use crate::event_store::{EventStore, EventStoreError, StreamCommit};
    pub use crate::projection::{Projection, ProjectionError};
    pub use crate::repository::{AggregateRepository, RepositoryError, Versioned};
    pub use crate::stream::{ExpectedVersion, GlobalPosition, StreamId, Version};
}
