//! `ProjectionDaemon` against the in-memory stores.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use eventline_core::event::{RecordedEvent, SerializedEvent};
use eventline_core::event_store::EventStore;
use eventline_core::projection::{Projection, ProjectionCheckpoint, ProjectionError, Result};
use eventline_core::stream::{GlobalPosition, StreamId};
use eventline_projections::{DaemonConfig, DaemonState, ProjectionDaemon};
use eventline_testing::helpers::init_tracing;
use eventline_testing::{InMemoryEventStore, InMemoryProjectionStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const NAME: &str = "listening_totals";

#[derive(Serialize, Deserialize)]
struct Played {
    seconds: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Totals {
    plays: u64,
    seconds: u64,
}

/// One global row summing every `Played.v1` event.
struct ListeningTotals;

impl ListeningTotals {
    fn decode(event: &RecordedEvent) -> Result<Played> {
        bincode::deserialize(&event.data).map_err(|e| ProjectionError::replay(event, e))
    }
}

impl Projection for ListeningTotals {
    type View = Totals;

    fn name(&self) -> &str {
        NAME
    }

    fn event_types(&self) -> &[&'static str] {
        &["Played.v1"]
    }

    fn view_id(&self, _event: &RecordedEvent) -> String {
        "all".to_string()
    }

    fn create(&self, event: &RecordedEvent) -> Result<Totals> {
        let played = Self::decode(event)?;
        Ok(Totals {
            plays: 1,
            seconds: u64::from(played.seconds),
        })
    }

    fn apply(&self, view: &mut Totals, event: &RecordedEvent) -> Result<()> {
        let played = Self::decode(event)?;
        view.plays += 1;
        view.seconds += u64::from(played.seconds);
        Ok(())
    }
}

fn played(seconds: u32) -> SerializedEvent {
    SerializedEvent::new(
        "Played.v1".to_string(),
        bincode::serialize(&Played { seconds }).unwrap(),
        None,
    )
}

fn skipped() -> SerializedEvent {
    SerializedEvent::new("Skipped.v1".to_string(), vec![], None)
}

async fn start(events: &InMemoryEventStore, stream: &str, batch: Vec<SerializedEvent>) {
    events
        .start_stream(StreamId::new(stream), "track", batch)
        .await
        .unwrap();
}

fn daemon(
    events: &InMemoryEventStore,
    store: &Arc<InMemoryProjectionStore>,
    batch_size: usize,
) -> ProjectionDaemon<ListeningTotals, InMemoryProjectionStore> {
    ProjectionDaemon::new(
        ListeningTotals,
        Arc::new(events.clone()),
        Arc::clone(store),
        DaemonConfig {
            batch_size,
            poll_interval: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
        },
    )
}

async fn drain(daemon: &ProjectionDaemon<ListeningTotals, InMemoryProjectionStore>) {
    while !daemon.run_once().await.unwrap().is_empty() {}
}

fn totals(store: &InMemoryProjectionStore) -> Option<Totals> {
    store.view::<Totals>(NAME, "all").unwrap()
}

#[tokio::test]
async fn folds_events_from_every_stream_in_global_order() {
    init_tracing();
    let events = InMemoryEventStore::new();
    let store = Arc::new(InMemoryProjectionStore::new());
    start(&events, "track-1", vec![played(30), played(40)]).await;
    start(&events, "track-2", vec![played(5)]).await;
    start(&events, "track-3", vec![skipped(), played(25)]).await;

    let daemon = daemon(&events, &store, 2);
    drain(&daemon).await;

    assert_eq!(totals(&store), Some(Totals { plays: 4, seconds: 100 }));
    assert_eq!(daemon.position().await.unwrap(), GlobalPosition::new(5));
    assert_eq!(daemon.lag().await.unwrap(), 0);
}

#[tokio::test]
async fn unrelated_events_still_advance_the_cursor() {
    let events = InMemoryEventStore::new();
    let store = Arc::new(InMemoryProjectionStore::new());
    start(&events, "track-1", vec![skipped(), skipped()]).await;

    let daemon = daemon(&events, &store, 10);
    let report = daemon.run_once().await.unwrap();

    assert_eq!(report.processed, 2);
    assert_eq!(report.applied, 0);
    assert_eq!(report.position, GlobalPosition::new(2));
    assert!(store.is_empty());
    assert_eq!(
        store.load_position(NAME).await.unwrap().unwrap().offset,
        2
    );
}

#[tokio::test]
async fn restarted_daemon_resumes_without_double_counting() {
    let events = InMemoryEventStore::new();
    let store = Arc::new(InMemoryProjectionStore::new());
    for i in 0..5 {
        start(&events, &format!("track-{i}"), vec![played(10)]).await;
    }

    let first = daemon(&events, &store, 2);
    first.run_once().await.unwrap();
    drop(first);
    assert_eq!(totals(&store), Some(Totals { plays: 2, seconds: 20 }));

    let second = daemon(&events, &store, 2);
    assert_eq!(second.lag().await.unwrap(), 3);
    drain(&second).await;

    assert_eq!(totals(&store), Some(Totals { plays: 5, seconds: 50 }));
}

#[tokio::test]
async fn malformed_payload_stalls_until_it_can_be_folded() {
    let events = InMemoryEventStore::new();
    let store = Arc::new(InMemoryProjectionStore::new());
    start(&events, "track-1", vec![played(10), played(20), played(30)]).await;
    events.corrupt_event(GlobalPosition::new(2), vec![0xFF]);

    let daemon = daemon(&events, &store, 10);
    for _ in 0..3 {
        match daemon.run_once().await {
            Err(ProjectionError::Replay { position, .. }) => {
                assert_eq!(position, GlobalPosition::new(2));
            }
            other => panic!("expected replay failure, got {other:?}"),
        }
    }

    // The prefix before the bad event is committed exactly once.
    assert_eq!(daemon.position().await.unwrap(), GlobalPosition::new(1));
    assert_eq!(totals(&store), Some(Totals { plays: 1, seconds: 10 }));

    events.corrupt_event(
        GlobalPosition::new(2),
        bincode::serialize(&Played { seconds: 20 }).unwrap(),
    );
    drain(&daemon).await;

    assert_eq!(totals(&store), Some(Totals { plays: 3, seconds: 60 }));
}

#[tokio::test]
async fn failed_commit_is_retried_from_the_same_cursor() {
    let events = InMemoryEventStore::new();
    let store = Arc::new(InMemoryProjectionStore::new());
    start(&events, "track-1", vec![played(10), played(15)]).await;

    let daemon = daemon(&events, &store, 10);
    store.fail_next_commits(1);
    assert!(matches!(
        daemon.run_once().await,
        Err(ProjectionError::Storage(_))
    ));
    assert_eq!(totals(&store), None);
    assert_eq!(daemon.position().await.unwrap(), GlobalPosition::START);

    drain(&daemon).await;
    assert_eq!(totals(&store), Some(Totals { plays: 2, seconds: 25 }));
}

#[tokio::test]
async fn rebuild_replays_the_whole_log() {
    let events = InMemoryEventStore::new();
    let store = Arc::new(InMemoryProjectionStore::new());
    start(&events, "track-1", vec![played(10), played(15)]).await;
    start(&events, "track-2", vec![played(5)]).await;

    let daemon = daemon(&events, &store, 10);
    drain(&daemon).await;
    let before = totals(&store);

    daemon.rebuild().await.unwrap();
    assert_eq!(totals(&store), None);
    assert_eq!(daemon.position().await.unwrap(), GlobalPosition::START);

    drain(&daemon).await;
    assert_eq!(totals(&store), before);
}

#[tokio::test]
async fn spawned_daemon_follows_new_events_and_stops_on_shutdown() {
    init_tracing();
    let events = InMemoryEventStore::new();
    let store = Arc::new(InMemoryProjectionStore::new());
    start(&events, "track-1", vec![played(10)]).await;

    let handle = daemon(&events, &store, 10).spawn();
    tokio::time::timeout(
        Duration::from_secs(5),
        handle.wait_for_position(GlobalPosition::new(1)),
    )
    .await
    .unwrap()
    .unwrap();

    start(&events, "track-2", vec![played(20), played(30)]).await;
    let progress = tokio::time::timeout(
        Duration::from_secs(5),
        handle.wait_for_position(GlobalPosition::new(3)),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(progress.position >= GlobalPosition::new(3));
    assert_eq!(totals(&store), Some(Totals { plays: 3, seconds: 60 }));

    let mut progress = handle.subscribe();
    handle.shutdown().await.unwrap();
    assert_eq!(progress.borrow_and_update().state, DaemonState::Stopped);
}

#[tokio::test]
async fn spawned_daemon_keeps_running_while_stalled() {
    let events = InMemoryEventStore::new();
    let store = Arc::new(InMemoryProjectionStore::new());
    start(&events, "track-1", vec![played(10), played(20)]).await;
    events.corrupt_event(GlobalPosition::new(2), vec![]);

    let handle = daemon(&events, &store, 10).spawn();
    let mut progress = handle.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        progress.wait_for(|p| p.state == DaemonState::Stalled),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(handle.progress().position, GlobalPosition::new(1));

    events.corrupt_event(
        GlobalPosition::new(2),
        bincode::serialize(&Played { seconds: 20 }).unwrap(),
    );
    tokio::time::timeout(
        Duration::from_secs(5),
        handle.wait_for_position(GlobalPosition::new(2)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(totals(&store), Some(Totals { plays: 2, seconds: 30 }));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn spawned_daemon_recovers_from_an_unreadable_cursor_at_startup() {
    init_tracing();
    let events = InMemoryEventStore::new();
    let store = Arc::new(InMemoryProjectionStore::new());
    start(&events, "track-1", vec![played(10), played(20)]).await;
    drain(&daemon(&events, &store, 10)).await;
    start(&events, "track-2", vec![played(5)]).await;

    // Startup read fails, then the first cycle's read fails too.
    store.fail_next_loads(2);
    let handle = daemon(&events, &store, 10).spawn();
    tokio::time::timeout(
        Duration::from_secs(5),
        handle.wait_for_position(GlobalPosition::new(3)),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(totals(&store), Some(Totals { plays: 3, seconds: 35 }));
    handle.shutdown().await.unwrap();
}
