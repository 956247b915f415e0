//! # Eventline Testing
//!
//! Testing utilities and helpers for Eventline.
//!
//! This crate provides:
//! - In-memory implementations of the event store and projection store
//! - A fixed clock for deterministic timestamps
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```ignore
//! use eventline_testing::{InMemoryEventStore, test_clock};
//!
//! #[tokio::test]
//! async fn test_start_stream() {
//!     let store = Arc::new(InMemoryEventStore::new());
//!     let videos = AggregateRepository::<Video>::new(store, Arc::new(test_clock()));
//!
//!     let video = videos.start(StreamId::new("video-1"), vec![uploaded("Intro")]).await.unwrap();
//!     assert_eq!(video.version, Version::new(1));
//! }
//! ```

use chrono::{DateTime, Utc};
use eventline_core::environment::Clock;

pub mod event_store_mock;
pub mod projection_mocks;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use eventline_testing::mocks::FixedClock;
    /// use eventline_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use eventline_core::event::SerializedEvent;

    /// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
    ///
    /// Safe to call from every test; later calls are no-ops.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// An opaque event with the given type tag and payload.
    #[must_use]
    pub fn raw_event(event_type: &str, data: Vec<u8>) -> SerializedEvent {
        SerializedEvent::new(event_type.to_string(), data, None)
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use eventline_core::stream::StreamId;
    use proptest::prelude::*;

    /// Stream ids drawn from a small pool, so generated commits collide.
    pub fn stream_id() -> impl Strategy<Value = StreamId> {
        (0_u8..4).prop_map(|n| StreamId::new(format!("stream-{n}")))
    }

    /// Batch sizes for generated appends (1 to 5 events).
    pub fn batch_size() -> impl Strategy<Value = usize> {
        1_usize..=5
    }

    /// A sequence of (stream, batch size) appends.
    pub fn append_plan() -> impl Strategy<Value = Vec<(StreamId, usize)>> {
        prop::collection::vec((stream_id(), batch_size()), 1..20)
    }
}

// Re-export commonly used items
pub use event_store_mock::InMemoryEventStore;
pub use mocks::{FixedClock, test_clock};
pub use projection_mocks::{InMemoryProjectionStore, ProjectionTestHarness};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }
}
