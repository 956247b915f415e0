//! Aggregate reconstruction: folding a stream's events into current state.
//!
//! Each aggregate type owns an [`EventFolds`] table mapping event-type tags to
//! fold functions:
//!
//! - a **create** fold builds the aggregate from its first recognized event
//! - an **apply** fold mutates an existing aggregate
//!
//! Tags the table does not know are skipped. Reconstruction is pure: it reads
//! events it is given and never touches storage.
//!
//! # Example
//!
//! ```
//! use eventline_core::aggregate::{reconstruct, Aggregate, EventFolds};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
//! struct Counter {
//!     hits: u32,
//! }
//!
//! impl Aggregate for Counter {
//!     const ENTITY_TYPE: &'static str = "counter";
//!
//!     fn folds() -> EventFolds<Self> {
//!         EventFolds::new()
//!             .on_create("Opened.v1", |_| Ok(Counter { hits: 0 }))
//!             .on_apply("Hit.v1", |counter, _| {
//!                 counter.hits += 1;
//!                 Ok(())
//!             })
//!     }
//! }
//!
//! let folds = Counter::folds();
//! let state = reconstruct(&folds, std::iter::empty()).unwrap();
//! assert!(state.is_none());
//! ```

use crate::event::{EventError, EventView};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Errors raised while folding events into an aggregate.
#[derive(Error, Debug)]
pub enum AggregateError {
    /// A recognized event's payload could not be decoded.
    #[error("Failed to decode {event_type} at version {version}: {reason}")]
    Decode {
        /// The event type tag.
        event_type: String,
        /// The event's version in its stream.
        version: u64,
        /// Decoder message.
        reason: String,
    },

    /// The fold rejected an event it recognized.
    #[error("Invalid event {event_type}: {reason}")]
    InvalidEvent {
        /// The event type tag.
        event_type: String,
        /// Why the event was rejected.
        reason: String,
    },

    /// Snapshot state could not be encoded or decoded.
    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl AggregateError {
    /// Wrap an event decoding failure with the event's identity.
    #[must_use]
    pub fn decode(event: &EventView<'_>, error: &EventError) -> Self {
        Self::Decode {
            event_type: event.event_type.to_string(),
            version: event.version.value(),
            reason: error.to_string(),
        }
    }
}

/// Fold that builds an aggregate from its first event.
pub type CreateFold<A> = fn(&EventView<'_>) -> Result<A, AggregateError>;

/// Fold that mutates an existing aggregate.
pub type ApplyFold<A> = fn(&mut A, &EventView<'_>) -> Result<(), AggregateError>;

/// Tag-dispatched fold table for one aggregate type.
pub struct EventFolds<A> {
    create: HashMap<&'static str, CreateFold<A>>,
    apply: HashMap<&'static str, ApplyFold<A>>,
}

impl<A> EventFolds<A> {
    /// Create an empty fold table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            create: HashMap::new(),
            apply: HashMap::new(),
        }
    }

    /// Register the create fold for an event type.
    #[must_use]
    pub fn on_create(mut self, event_type: &'static str, fold: CreateFold<A>) -> Self {
        self.create.insert(event_type, fold);
        self
    }

    /// Register the apply fold for an event type.
    #[must_use]
    pub fn on_apply(mut self, event_type: &'static str, fold: ApplyFold<A>) -> Self {
        self.apply.insert(event_type, fold);
        self
    }

    /// Whether any fold is registered for this event type.
    #[must_use]
    pub fn recognizes(&self, event_type: &str) -> bool {
        self.create.contains_key(event_type) || self.apply.contains_key(event_type)
    }

    /// Fold one event onto the current state.
    ///
    /// - No state yet: the event's create fold runs; events without one are skipped.
    /// - Existing state: the event's apply fold runs; events without one are skipped.
    ///
    /// # Errors
    ///
    /// Returns whatever the fold returns.
    pub fn fold(
        &self,
        state: Option<A>,
        event: &EventView<'_>,
    ) -> Result<Option<A>, AggregateError> {
        match state {
            None => match self.create.get(event.event_type) {
                Some(create) => create(event).map(Some),
                None => {
                    tracing::trace!(
                        event_type = event.event_type,
                        stream_id = %event.stream_id,
                        "Skipping event before aggregate creation"
                    );
                    Ok(None)
                }
            },
            Some(mut current) => {
                if let Some(apply) = self.apply.get(event.event_type) {
                    apply(&mut current, event)?;
                }
                Ok(Some(current))
            }
        }
    }
}

impl<A> Default for EventFolds<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> fmt::Debug for EventFolds<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut create: Vec<_> = self.create.keys().collect();
        let mut apply: Vec<_> = self.apply.keys().collect();
        create.sort();
        apply.sort();
        f.debug_struct("EventFolds")
            .field("create", &create)
            .field("apply", &apply)
            .finish()
    }
}

/// An event-sourced aggregate type.
///
/// Aggregates are owned, cloneable values so that a repository can fold
/// pending events onto a copy and snapshot the result with `bincode`.
pub trait Aggregate: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The entity type recorded on this aggregate's streams (e.g. "video").
    const ENTITY_TYPE: &'static str;

    /// Build this aggregate's fold table.
    ///
    /// Called once when a repository is constructed.
    fn folds() -> EventFolds<Self>;
}

/// Reconstruct an aggregate by folding events in order.
///
/// Returns `Ok(None)` (not found) when the sequence is empty or contains no
/// event with a create fold.
///
/// # Errors
///
/// Returns the first fold error encountered.
pub fn reconstruct<'a, A>(
    folds: &EventFolds<A>,
    events: impl IntoIterator<Item = EventView<'a>>,
) -> Result<Option<A>, AggregateError> {
    fold_onto(folds, None, events)
}

/// Fold events onto an existing (or absent) state.
///
/// # Errors
///
/// Returns the first fold error encountered.
pub fn fold_onto<'a, A>(
    folds: &EventFolds<A>,
    state: Option<A>,
    events: impl IntoIterator<Item = EventView<'a>>,
) -> Result<Option<A>, AggregateError> {
    events
        .into_iter()
        .try_fold(state, |state, event| folds.fold(state, &event))
}

/// Encode aggregate state for the snapshot table.
///
/// # Errors
///
/// Returns `AggregateError::Snapshot` if the state cannot be serialized.
pub fn encode_snapshot<A: Aggregate>(state: &A) -> Result<Vec<u8>, AggregateError> {
    bincode::serialize(state).map_err(|e| AggregateError::Snapshot(e.to_string()))
}

/// Decode aggregate state from the snapshot table.
///
/// # Errors
///
/// Returns `AggregateError::Snapshot` if the bytes do not decode as `A`.
pub fn decode_snapshot<A: Aggregate>(bytes: &[u8]) -> Result<A, AggregateError> {
    bincode::deserialize(bytes).map_err(|e| AggregateError::Snapshot(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamId, Version};
    use chrono::{DateTime, TimeZone, Utc};
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Tally {
        label: String,
        hits: u32,
        opened_at: DateTime<Utc>,
    }

    impl Aggregate for Tally {
        const ENTITY_TYPE: &'static str = "tally";

        fn folds() -> EventFolds<Self> {
            EventFolds::new()
                .on_create("Opened.v1", |event| {
                    let label: String = event
                        .decode()
                        .map_err(|e| AggregateError::decode(event, &e))?;
                    Ok(Self {
                        label,
                        hits: 0,
                        opened_at: event.recorded_at,
                    })
                })
                .on_apply("Opened.v1", |tally, event| {
                    tally.label = event.decode().map_err(|e| AggregateError::decode(event, &e))?;
                    Ok(())
                })
                .on_apply("Hit.v1", |tally, _| {
                    tally.hits += 1;
                    Ok(())
                })
        }
    }

    struct Owned {
        stream_id: StreamId,
        version: Version,
        event_type: String,
        data: Vec<u8>,
    }

    #[allow(clippy::unwrap_used)]
    fn owned(version: u64, event_type: &str, payload: &str) -> Owned {
        Owned {
            stream_id: StreamId::new("tally-1"),
            version: Version::new(version),
            event_type: event_type.to_string(),
            data: bincode::serialize(payload).unwrap(),
        }
    }

    #[allow(clippy::unwrap_used)]
    fn views(events: &[Owned]) -> Vec<EventView<'_>> {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        events
            .iter()
            .map(|e| EventView {
                stream_id: &e.stream_id,
                version: e.version,
                event_type: &e.event_type,
                data: &e.data,
                recorded_at: at,
            })
            .collect()
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn empty_sequence_is_not_found() {
        let state = reconstruct(&Tally::folds(), Vec::new()).unwrap();
        assert!(state.is_none());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn create_then_apply() {
        let events = vec![
            owned(1, "Opened.v1", "first"),
            owned(2, "Hit.v1", ""),
            owned(3, "Hit.v1", ""),
            owned(4, "Opened.v1", "renamed"),
        ];
        let state = reconstruct(&Tally::folds(), views(&events)).unwrap().unwrap();
        assert_eq!(state.label, "renamed");
        assert_eq!(state.hits, 2);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn unknown_tags_are_ignored() {
        let events = vec![
            owned(1, "Opened.v1", "first"),
            owned(2, "Archived.v1", ""),
            owned(3, "Hit.v1", ""),
        ];
        let state = reconstruct(&Tally::folds(), views(&events)).unwrap().unwrap();
        assert_eq!(state.hits, 1);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn events_before_creation_are_skipped() {
        let events = vec![owned(1, "Hit.v1", ""), owned(2, "Opened.v1", "late")];
        let state = reconstruct(&Tally::folds(), views(&events)).unwrap().unwrap();
        assert_eq!(state.label, "late");
        assert_eq!(state.hits, 0);

        let never_created = vec![owned(1, "Hit.v1", "")];
        assert!(reconstruct(&Tally::folds(), views(&never_created)).unwrap().is_none());
    }

    #[test]
    fn malformed_payload_is_a_decode_error() {
        let events = vec![Owned {
            stream_id: StreamId::new("tally-1"),
            version: Version::new(1),
            event_type: "Opened.v1".to_string(),
            data: vec![0xff],
        }];
        let result = reconstruct(&Tally::folds(), views(&events));
        assert!(matches!(
            result,
            Err(AggregateError::Decode { version: 1, .. })
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn snapshot_encoding_round_trips_state() {
        let events = vec![owned(1, "Opened.v1", "first"), owned(2, "Hit.v1", "")];
        let state = reconstruct(&Tally::folds(), views(&events)).unwrap().unwrap();
        let decoded: Tally = decode_snapshot(&encode_snapshot(&state).unwrap()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn folds_debug_lists_tags() {
        let debug = format!("{:?}", Tally::folds());
        assert!(debug.contains("Opened.v1"));
        assert!(debug.contains("Hit.v1"));
    }

    fn arb_event() -> impl Strategy<Value = (String, String)> {
        prop_oneof![
            "[a-z]{0,8}".prop_map(|label| ("Opened.v1".to_string(), label)),
            Just(("Hit.v1".to_string(), String::new())),
            Just(("Unknown.v1".to_string(), String::new())),
        ]
    }

    proptest! {
        #[test]
        #[allow(clippy::unwrap_used)]
        fn replay_is_deterministic(raw in prop::collection::vec(arb_event(), 0..40)) {
            let events: Vec<Owned> = raw
                .iter()
                .enumerate()
                .map(|(i, (event_type, label))| owned(i as u64 + 1, event_type, label))
                .collect();
            let folds = Tally::folds();

            let first = reconstruct(&folds, views(&events)).unwrap();
            let second = reconstruct(&folds, views(&events)).unwrap();
            prop_assert_eq!(first, second);
        }

        #[test]
        #[allow(clippy::unwrap_used)]
        fn folding_in_two_parts_matches_one_pass(
            raw in prop::collection::vec(arb_event(), 0..40),
            split in 0usize..40,
        ) {
            let events: Vec<Owned> = raw
                .iter()
                .enumerate()
                .map(|(i, (event_type, label))| owned(i as u64 + 1, event_type, label))
                .collect();
            let split = split.min(events.len());
            let folds = Tally::folds();
            let all = views(&events);

            let whole = reconstruct(&folds, all.clone()).unwrap();
            let head = reconstruct(&folds, all[..split].to_vec()).unwrap();
            let resumed = fold_onto(&folds, head, all[split..].to_vec()).unwrap();
            prop_assert_eq!(whole, resumed);
        }
    }
}
