use std::sync::Arc;

use recorder_core::{
    spawn_dispatcher, Action, DispatchBus, StopResponder, TabTracker, DEFAULT_OUTCOME_CAPACITY,
};
use shared::{
    domain::{AssignmentId, NodeId, NodeRecord, TabId, TabInfo, TabState},
    protocol::{Outcome, TabStateResponse},
};
use storage::Storage;

fn example_tab() -> TabInfo {
    TabInfo {
        title: "Example".into(),
        url: "http://x".into(),
    }
}

async fn sqlite_tracker() -> (Arc<TabTracker>, DispatchBus, Storage) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (bus, _actions) = DispatchBus::new(DEFAULT_OUTCOME_CAPACITY);
    let tracker = TabTracker::new(Arc::new(storage.clone()), &bus);
    (tracker, bus, storage)
}

#[tokio::test]
async fn recording_lifecycle_against_sqlite() {
    let (tracker, _bus, storage) = sqlite_tracker().await;

    // Tab 1 starts recording.
    tracker.tab_created(TabId(1), None);
    let (assignment, node) = tracker
        .start_recording(TabId(1), example_tab())
        .await
        .expect("start recording");
    assert_eq!(assignment.local_id, AssignmentId(1));
    assert!(assignment.title.starts_with("Untitled ("));
    assert_eq!(
        node,
        NodeRecord {
            local_id: NodeId(1),
            local_assignment_id: AssignmentId(1),
            tab_id: TabId(1),
            title: "Example".into(),
            url: "http://x".into(),
        }
    );
    assert_eq!(tracker.state_of(TabId(1)), TabState::Recording);

    let response = tracker.request_tab_state(TabId(1)).await;
    assert!(response.recording);
    assert_eq!(
        response.assignment.map(|assignment| assignment.local_id),
        Some(AssignmentId(1))
    );

    // Tab 2 opened from tab 1 inherits without touching the store.
    assert_eq!(
        tracker.tab_created(TabId(2), Some(TabId(1))),
        TabState::Recording
    );
    assert_eq!(storage.list_assignments().await.expect("list").len(), 1);
    assert!(storage
        .nodes_for_tab(TabId(2))
        .await
        .expect("nodes")
        .is_empty());

    // Closing tab 2 forgets it.
    tracker
        .handle(Action::TabClosed { tab_id: TabId(2) })
        .await
        .expect("close");
    assert_eq!(tracker.state_of(TabId(2)), TabState::Untracked);
    assert_eq!(
        tracker.request_tab_state(TabId(2)).await,
        TabStateResponse::not_recording()
    );

    // Stopping keeps the records.
    tracker
        .stop_recording(TabId(1), StopResponder::noop())
        .expect("stop");
    assert_eq!(tracker.state_of(TabId(1)), TabState::Idle);
    assert_eq!(
        storage
            .nodes_for_assignment(AssignmentId(1))
            .await
            .expect("nodes")
            .len(),
        1
    );
}

#[tokio::test]
async fn restarting_a_tab_creates_a_fresh_assignment() {
    let (tracker, _bus, storage) = sqlite_tracker().await;
    tracker.tab_created(TabId(5), None);

    tracker
        .start_recording(TabId(5), example_tab())
        .await
        .expect("first start");
    tracker
        .stop_recording(TabId(5), StopResponder::noop())
        .expect("stop");
    let (second, _) = tracker
        .start_recording(TabId(5), example_tab())
        .await
        .expect("second start");

    assert_eq!(second.local_id, AssignmentId(2));
    let response = tracker.request_tab_state(TabId(5)).await;
    assert_eq!(
        response.assignment.map(|assignment| assignment.local_id),
        Some(AssignmentId(2))
    );
    assert_eq!(storage.nodes_for_tab(TabId(5)).await.expect("nodes").len(), 2);
}

#[tokio::test]
async fn rolled_back_start_leaves_tab_idle() {
    let (tracker, bus, storage) = sqlite_tracker().await;
    sqlx::query(
        "CREATE TRIGGER reject_node BEFORE INSERT ON nodes
         BEGIN SELECT RAISE(ABORT, 'node rejected'); END",
    )
    .execute(storage.pool())
    .await
    .expect("trigger");
    tracker.tab_created(TabId(1), None);
    let mut outcomes = bus.subscribe();

    tracker
        .start_recording(TabId(1), example_tab())
        .await
        .expect_err("start should fail");

    assert_eq!(tracker.state_of(TabId(1)), TabState::Idle);
    assert!(storage.list_assignments().await.expect("list").is_empty());
    assert!(matches!(
        outcomes.recv().await.expect("outcome"),
        Outcome::StartRecordingFail { tab_id: TabId(1), .. }
    ));
}

#[tokio::test]
async fn queued_start_and_stop_resolve_in_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let (bus, actions) = DispatchBus::new(DEFAULT_OUTCOME_CAPACITY);
    let tracker = TabTracker::new(Arc::new(storage.clone()), &bus);
    let dispatcher = spawn_dispatcher(tracker.clone(), actions);
    let mut outcomes = bus.subscribe();

    bus.dispatch(Action::StartRecording {
        tab_id: TabId(1),
        tab: example_tab(),
    })
    .expect("dispatch start");
    let (on_done, done) = StopResponder::channel();
    bus.dispatch(Action::StopRecording {
        tab_id: TabId(1),
        on_done,
    })
    .expect("dispatch stop");
    drop(bus);

    dispatcher.await.expect("dispatcher");
    done.await.expect("stop responder fired");

    let mut terminal = Vec::new();
    while let Ok(outcome) = outcomes.try_recv() {
        if matches!(
            outcome,
            Outcome::StartRecordingSuccess { .. }
                | Outcome::StartRecordingFail { .. }
                | Outcome::StopRecordingSuccess { .. }
                | Outcome::StopRecordingFail { .. }
        ) {
            terminal.push(outcome);
        }
    }
    assert_eq!(
        terminal,
        vec![
            Outcome::StartRecordingSuccess { tab_id: TabId(1) },
            Outcome::StopRecordingSuccess { tab_id: TabId(1) },
        ]
    );
    assert_eq!(tracker.state_of(TabId(1)), TabState::Idle);
    assert_eq!(storage.list_assignments().await.expect("list").len(), 1);
}
