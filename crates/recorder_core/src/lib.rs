use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{
        AssignmentId, AssignmentRecord, NewAssignment, NewNode, NodeRecord, TabId, TabInfo,
        TabState,
    },
    protocol::{
        ActionKind, Outcome, RecordingTab, StartRecordingFailReason, StopRecordingFailReason,
        TabEventKind, TabStateResponse, TrackedState, TrackedStateSnapshot, TrackedTab,
    },
};
use tab_events::EventSourceAdapter;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod bus;
pub mod names;

pub use bus::{
    spawn_dispatcher, Action, ActionReceiver, BusError, DispatchBus, OutcomePublisher,
    StopResponder, DEFAULT_OUTCOME_CAPACITY,
};

/// Durable storage for assignments and their nodes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persists both records in one transaction and returns them with their
    /// store-assigned ids. Either both rows exist afterwards or neither does.
    async fn create_assignment_with_node(
        &self,
        assignment: NewAssignment,
        node: NewNode,
    ) -> Result<(AssignmentRecord, NodeRecord)>;

    /// Nodes recorded for `tab_id`, oldest first.
    async fn nodes_for_tab(&self, tab_id: TabId) -> Result<Vec<NodeRecord>>;

    async fn latest_node_for_tab(&self, tab_id: TabId) -> Result<Option<NodeRecord>> {
        Ok(self.nodes_for_tab(tab_id).await?.pop())
    }

    async fn assignment(&self, assignment_id: AssignmentId) -> Result<Option<AssignmentRecord>>;
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("transition {} is not implemented (tab {tab_id})", .action.as_str())]
    UnimplementedTransition { action: ActionKind, tab_id: TabId },
    #[error("tab {tab_id} is already recording")]
    AlreadyRecording { tab_id: TabId },
    #[error("tab {tab_id} is not recording")]
    NotRecording { tab_id: TabId },
    #[error("recording transaction failed for tab {tab_id}: {source:#}")]
    TransactionFailure {
        tab_id: TabId,
        source: anyhow::Error,
    },
}

/// Owns the tab id to recording state mapping and drives record creation.
///
/// Tabs missing from the map are `Untracked`; the map itself only ever holds
/// `Idle` or `Recording`.
pub struct TabTracker {
    store: Arc<dyn RecordStore>,
    outcomes: OutcomePublisher,
    tabs: Mutex<HashMap<TabId, TabState>>,
}

impl TabTracker {
    pub fn new(store: Arc<dyn RecordStore>, bus: &DispatchBus) -> Arc<Self> {
        Arc::new(Self {
            store,
            outcomes: bus.publisher(),
            tabs: Mutex::new(HashMap::new()),
        })
    }

    pub fn publisher(&self) -> &OutcomePublisher {
        &self.outcomes
    }

    fn tabs(&self) -> MutexGuard<'_, HashMap<TabId, TabState>> {
        self.tabs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state_of(&self, tab_id: TabId) -> TabState {
        self.tabs().get(&tab_id).copied().unwrap_or(TabState::Untracked)
    }

    pub fn snapshot(&self) -> TrackedStateSnapshot {
        let mut tabs: Vec<TrackedTab> = self
            .tabs()
            .iter()
            .map(|(tab_id, state)| TrackedTab {
                tab_id: *tab_id,
                state: *state,
            })
            .collect();
        tabs.sort_by_key(|tab| tab.tab_id);
        TrackedStateSnapshot { tabs }
    }

    /// Snapshot plus the node and assignment behind every recording tab.
    pub async fn tracked_state(&self) -> TrackedState {
        let snapshot = self.snapshot();
        let mut recording = Vec::new();
        for tab in snapshot.tabs.iter().filter(|tab| tab.state.is_recording()) {
            let (node, assignment) = self.linked_records(tab.tab_id).await;
            recording.push(RecordingTab {
                tab_id: tab.tab_id,
                node,
                assignment,
            });
        }
        TrackedState {
            snapshot,
            recording,
        }
    }

    pub async fn handle(&self, action: Action) -> Result<(), TrackerError> {
        debug!(tab_id = %action.tab_id(), action = action.kind().as_str(), "handling action");
        match action {
            Action::TabCreated {
                tab_id,
                parent_tab_id,
            } => {
                self.tab_created(tab_id, parent_tab_id);
                Ok(())
            }
            Action::TabUpdated { .. } => {
                self.broadcast_snapshot();
                Ok(())
            }
            Action::TabClosed { tab_id } => {
                self.tab_closed(tab_id);
                Ok(())
            }
            Action::StartRecording { tab_id, tab } => {
                self.start_recording(tab_id, tab).await.map(|_| ())
            }
            Action::StopRecording { tab_id, on_done } => self.stop_recording(tab_id, on_done),
            Action::RequestTabState { tab_id } => {
                self.request_tab_state(tab_id).await;
                Ok(())
            }
            unhandled @ (Action::TabSwitched { .. }
            | Action::CreatedNavigationTarget { .. }
            | Action::HistoryStateUpdated { .. }
            | Action::WebNavCommitted { .. }
            | Action::TabReplaced { .. }) => {
                debug!(?unhandled, "no transition for action");
                Err(TrackerError::UnimplementedTransition {
                    action: unhandled.kind(),
                    tab_id: unhandled.tab_id(),
                })
            }
        }
    }

    /// A child opened from a recording tab starts out recording as well.
    pub fn tab_created(&self, tab_id: TabId, parent_tab_id: Option<TabId>) -> TabState {
        let state = {
            let mut tabs = self.tabs();
            let inherits = parent_tab_id
                .and_then(|parent| tabs.get(&parent))
                .is_some_and(|parent| parent.is_recording());
            let state = if inherits {
                TabState::Recording
            } else {
                TabState::Idle
            };
            tabs.insert(tab_id, state);
            state
        };
        debug!(%tab_id, ?parent_tab_id, ?state, "tab created");
        self.broadcast_snapshot();
        state
    }

    pub fn tab_closed(&self, tab_id: TabId) {
        let previous = self.tabs().remove(&tab_id);
        debug!(%tab_id, ?previous, "tab closed");
        self.broadcast_snapshot();
    }

    /// Creates an assignment and its first node in one transaction and marks
    /// the tab as recording once it commits. Publishes exactly one of
    /// `StartRecordingSuccess` or `StartRecordingFail`.
    pub async fn start_recording(
        &self,
        tab_id: TabId,
        tab: TabInfo,
    ) -> Result<(AssignmentRecord, NodeRecord), TrackerError> {
        {
            let mut tabs = self.tabs();
            let state = tabs.entry(tab_id).or_insert(TabState::Idle);
            if state.is_recording() {
                drop(tabs);
                self.outcomes.publish(Outcome::StartRecordingFail {
                    tab_id,
                    reason: StartRecordingFailReason::AlreadyRecording,
                });
                return Err(TrackerError::AlreadyRecording { tab_id });
            }
        }

        let assignment = names::untitled_assignment(Utc::now());
        let node = NewNode::from_tab(tab_id, &tab);

        match self.store.create_assignment_with_node(assignment, node).await {
            Ok((assignment, node)) => {
                info!(
                    %tab_id,
                    assignment_id = %assignment.local_id,
                    node_id = %node.local_id,
                    "recording started"
                );
                self.outcomes.publish(Outcome::AssignmentCreated {
                    assignment: assignment.clone(),
                });
                self.outcomes.publish(Outcome::NodeCreated { node: node.clone() });
                self.tabs().insert(tab_id, TabState::Recording);
                self.outcomes
                    .publish(Outcome::StartRecordingSuccess { tab_id });
                self.broadcast_snapshot();
                Ok((assignment, node))
            }
            Err(source) => {
                self.tabs().insert(tab_id, TabState::Idle);
                self.outcomes.publish(Outcome::StartRecordingFail {
                    tab_id,
                    reason: StartRecordingFailReason::TransactionFailure,
                });
                Err(TrackerError::TransactionFailure { tab_id, source })
            }
        }
    }

    /// Invokes `on_done` first, then moves a recording tab back to idle.
    pub fn stop_recording(&self, tab_id: TabId, on_done: StopResponder) -> Result<(), TrackerError> {
        let recording = self.state_of(tab_id).is_recording();
        if catch_unwind(AssertUnwindSafe(|| on_done.respond())).is_err() {
            warn!(%tab_id, "stop responder panicked");
        }

        if !recording {
            self.outcomes.publish(Outcome::StopRecordingFail {
                tab_id,
                reason: StopRecordingFailReason::NotRecording,
            });
            return Err(TrackerError::NotRecording { tab_id });
        }

        self.tabs().insert(tab_id, TabState::Idle);
        info!(%tab_id, "recording stopped");
        self.outcomes.publish(Outcome::StopRecordingSuccess { tab_id });
        self.broadcast_snapshot();
        Ok(())
    }

    /// Read-only query. A recording tab reports the assignment of its most
    /// recent node; any other tab reports `recording: false` without touching
    /// the store.
    pub async fn request_tab_state(&self, tab_id: TabId) -> TabStateResponse {
        let state = if self.state_of(tab_id).is_recording() {
            let (_, assignment) = self.linked_records(tab_id).await;
            TabStateResponse {
                recording: true,
                assignment,
            }
        } else {
            TabStateResponse::not_recording()
        };
        self.outcomes.publish(Outcome::RequestTabStateResponse {
            tab_id,
            state: state.clone(),
        });
        state
    }

    async fn linked_records(
        &self,
        tab_id: TabId,
    ) -> (Option<NodeRecord>, Option<AssignmentRecord>) {
        let node = match self.store.latest_node_for_tab(tab_id).await {
            Ok(node) => node,
            Err(err) => {
                warn!(%tab_id, "node lookup failed: {err:#}");
                return (None, None);
            }
        };
        let Some(node) = node else {
            debug!(%tab_id, "recording tab has no node of its own");
            return (None, None);
        };

        match self.store.assignment(node.local_assignment_id).await {
            Ok(assignment) => (Some(node), assignment),
            Err(err) => {
                warn!(
                    %tab_id,
                    assignment_id = %node.local_assignment_id,
                    "assignment lookup failed: {err:#}"
                );
                (Some(node), None)
            }
        }
    }

    fn broadcast_snapshot(&self) {
        self.outcomes.publish(Outcome::StateChanged {
            snapshot: self.snapshot(),
        });
    }
}

/// Registers listeners on every adapter channel that forward events to the bus.
pub fn forward_tab_events(adapter: &EventSourceAdapter, bus: &DispatchBus) {
    for kind in TabEventKind::ALL {
        let Some(channel) = adapter.channel(kind) else {
            continue;
        };
        let bus = bus.clone();
        channel.add_listener(move |event| {
            bus.dispatch(Action::from(event))?;
            Ok(())
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/bus_tests.rs"]
mod bus_tests;
