//! `PostgreSQL` event store implementation for Eventline.
//!
//! This crate provides a PostgreSQL-based event store that implements the
//! `EventStore` trait from `eventline-core`. It uses sqlx and supports:
//!
//! - Event persistence with optimistic concurrency
//! - Snapshots written in the same transaction as their events
//! - Atomic commits spanning several streams
//! - A gap-free global position for projections
//! - Connection pooling
//!
//! # Example
//!
//! ```ignore
//! use eventline_postgres::PostgresEventStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let event_store = PostgresEventStore::new("postgres://localhost/eventline").await?;
//!     event_store.migrate().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod event_store;

pub use event_store::{DEFAULT_MAX_CONNECTIONS, PostgresEventStore};
