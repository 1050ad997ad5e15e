//! Action dispatch bus: actions flow in through an mpsc queue, outcomes fan
//! out over a broadcast channel.
//!
//! The dispatcher keeps one lane per tab. A lane is a task with its own FIFO
//! queue, so actions for the same tab are handled one after another
//! (including any store round trip) while different tabs proceed
//! independently.

use std::{collections::HashMap, fmt, panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;

use shared::{
    domain::{TabId, TabInfo},
    protocol::{ActionKind, Outcome, TabEvent, TabEventData},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, warn};

use crate::{TabTracker, TrackerError};

pub const DEFAULT_OUTCOME_CAPACITY: usize = 1024;

/// Completion callback for `stop_recording`. Runs before the tab turns idle.
pub struct StopResponder(Box<dyn FnOnce() + Send>);

impl StopResponder {
    pub fn new(respond: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(respond))
    }

    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// A responder that completes the returned receiver when invoked.
    pub fn channel() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let responder = Self::new(move || {
            let _ = tx.send(());
        });
        (responder, rx)
    }

    pub(crate) fn respond(self) {
        (self.0)()
    }
}

impl fmt::Debug for StopResponder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StopResponder")
    }
}

#[derive(Debug)]
pub enum Action {
    TabCreated {
        tab_id: TabId,
        parent_tab_id: Option<TabId>,
    },
    TabUpdated {
        tab_id: TabId,
    },
    TabSwitched {
        tab_id: TabId,
    },
    TabClosed {
        tab_id: TabId,
    },
    CreatedNavigationTarget {
        tab_id: TabId,
        source_tab_id: TabId,
        url: String,
    },
    HistoryStateUpdated {
        tab_id: TabId,
        url: String,
    },
    WebNavCommitted {
        tab_id: TabId,
        url: String,
    },
    TabReplaced {
        added_tab_id: TabId,
        removed_tab_id: TabId,
    },
    StartRecording {
        tab_id: TabId,
        tab: TabInfo,
    },
    StopRecording {
        tab_id: TabId,
        on_done: StopResponder,
    },
    RequestTabState {
        tab_id: TabId,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::TabCreated { .. } => ActionKind::TabCreated,
            Action::TabUpdated { .. } => ActionKind::TabUpdated,
            Action::TabSwitched { .. } => ActionKind::TabSwitched,
            Action::TabClosed { .. } => ActionKind::TabClosed,
            Action::CreatedNavigationTarget { .. } => ActionKind::CreatedNavigationTarget,
            Action::HistoryStateUpdated { .. } => ActionKind::HistoryStateUpdated,
            Action::WebNavCommitted { .. } => ActionKind::WebNavCommitted,
            Action::TabReplaced { .. } => ActionKind::TabReplaced,
            Action::StartRecording { .. } => ActionKind::StartRecording,
            Action::StopRecording { .. } => ActionKind::StopRecording,
            Action::RequestTabState { .. } => ActionKind::RequestTabState,
        }
    }

    /// The tab whose lane handles this action.
    pub fn tab_id(&self) -> TabId {
        match self {
            Action::TabCreated { tab_id, .. }
            | Action::TabUpdated { tab_id }
            | Action::TabSwitched { tab_id }
            | Action::TabClosed { tab_id }
            | Action::CreatedNavigationTarget { tab_id, .. }
            | Action::HistoryStateUpdated { tab_id, .. }
            | Action::WebNavCommitted { tab_id, .. }
            | Action::StartRecording { tab_id, .. }
            | Action::StopRecording { tab_id, .. }
            | Action::RequestTabState { tab_id } => *tab_id,
            Action::TabReplaced { added_tab_id, .. } => *added_tab_id,
        }
    }
}

impl From<&TabEvent> for Action {
    fn from(event: &TabEvent) -> Self {
        match &event.data {
            TabEventData::CreatedTab {
                tab_id,
                parent_tab_id,
                ..
            } => Action::TabCreated {
                tab_id: *tab_id,
                parent_tab_id: *parent_tab_id,
            },
            TabEventData::UpdatedTab { tab_id, .. } => Action::TabUpdated { tab_id: *tab_id },
            TabEventData::SwitchedTab { tab_id, .. } => Action::TabSwitched { tab_id: *tab_id },
            TabEventData::ClosedTab { tab_id } => Action::TabClosed { tab_id: *tab_id },
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("dispatcher has shut down, dropped {0:?}")]
    Closed(ActionKind),
}

/// Cloneable handle used to dispatch actions and observe outcomes.
#[derive(Clone)]
pub struct DispatchBus {
    actions: mpsc::UnboundedSender<Action>,
    outcomes: OutcomePublisher,
    in_flight: InFlight,
}

/// Receiving end of the action queue, consumed by [`spawn_dispatcher`].
pub struct ActionReceiver {
    rx: mpsc::UnboundedReceiver<Action>,
    in_flight: InFlight,
}

/// Count of actions dispatched but not yet handled by a lane.
#[derive(Clone)]
struct InFlight(Arc<watch::Sender<usize>>);

impl InFlight {
    fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self(Arc::new(tx))
    }

    fn start(&self) {
        self.0.send_modify(|count| *count += 1);
    }

    fn finish(&self) {
        self.0.send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Publish-only half of the bus handed to the tracker.
#[derive(Clone)]
pub struct OutcomePublisher(broadcast::Sender<Outcome>);

impl OutcomePublisher {
    pub fn publish(&self, outcome: Outcome) {
        // No subscribers is fine; outcomes are fire-and-forget.
        if self.0.send(outcome).is_err() {
            debug!("outcome published with no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outcome> {
        self.0.subscribe()
    }
}

impl DispatchBus {
    pub fn new(outcome_capacity: usize) -> (Self, ActionReceiver) {
        let (actions, rx) = mpsc::unbounded_channel();
        let (outcomes, _) = broadcast::channel(outcome_capacity.max(1));
        let in_flight = InFlight::new();
        (
            Self {
                actions,
                outcomes: OutcomePublisher(outcomes),
                in_flight: in_flight.clone(),
            },
            ActionReceiver { rx, in_flight },
        )
    }

    pub fn dispatch(&self, action: Action) -> Result<(), BusError> {
        self.in_flight.start();
        self.actions.send(action).map_err(|err| {
            self.in_flight.finish();
            BusError::Closed(err.0.kind())
        })
    }

    /// Resolves once every action dispatched so far has been handled.
    pub async fn settled(&self) {
        let mut rx = self.in_flight.0.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    pub fn publish(&self, outcome: Outcome) {
        self.outcomes.publish(outcome);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Outcome> {
        self.outcomes.subscribe()
    }

    pub fn publisher(&self) -> OutcomePublisher {
        self.outcomes.clone()
    }
}

/// Runs the dispatch loop until every [`DispatchBus`] handle is dropped, then
/// waits for all lanes to drain.
pub fn spawn_dispatcher(tracker: Arc<TabTracker>, actions: ActionReceiver) -> JoinHandle<()> {
    tokio::spawn(run_dispatcher(tracker, actions))
}

struct Lane {
    tx: mpsc::UnboundedSender<Action>,
    /// Never sent on; resolves when the lane task ends, panics included.
    done: oneshot::Receiver<()>,
}

async fn run_dispatcher(tracker: Arc<TabTracker>, mut actions: ActionReceiver) {
    let mut lanes: HashMap<TabId, Lane> = HashMap::new();
    // Lanes of closed tabs that may still be draining. A reopened tab's new
    // lane waits on its predecessor so same-tab order survives the close.
    let mut retiring: HashMap<TabId, oneshot::Receiver<()>> = HashMap::new();
    let mut lane_tasks = JoinSet::new();

    let in_flight = actions.in_flight;
    while let Some(action) = actions.rx.recv().await {
        let tab_id = action.tab_id();
        let closes_lane = matches!(action, Action::TabClosed { .. });

        let lane = lanes.entry(tab_id).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let (done_tx, done) = oneshot::channel();
            let previous = retiring.remove(&tab_id);
            lane_tasks.spawn(run_lane(
                tracker.clone(),
                tab_id,
                LaneQueue {
                    rx,
                    in_flight: in_flight.clone(),
                },
                previous,
                done_tx,
            ));
            Lane { tx, done }
        });
        if let Err(err) = lane.tx.send(action) {
            error!(%tab_id, action = err.0.kind().as_str(), "tab lane stopped unexpectedly");
            in_flight.finish();
            lanes.remove(&tab_id);
            continue;
        }

        // The lane drains what is queued and exits once its sender is gone.
        if closes_lane {
            if let Some(lane) = lanes.remove(&tab_id) {
                retiring.insert(tab_id, lane.done);
            }
        }

        retiring.retain(|_, done| matches!(done.try_recv(), Err(oneshot::error::TryRecvError::Empty)));
        while let Some(joined) = lane_tasks.try_join_next() {
            if let Err(err) = joined {
                error!("tab lane task failed: {err}");
            }
        }
    }

    drop(lanes);
    while let Some(joined) = lane_tasks.join_next().await {
        if let Err(err) = joined {
            error!("tab lane task failed: {err}");
        }
    }
    debug!("dispatcher stopped");
}

/// A lane's inbox. Whatever is still queued when the lane goes away is
/// discarded and counted as handled, so `settled()` cannot hang on it.
struct LaneQueue {
    rx: mpsc::UnboundedReceiver<Action>,
    in_flight: InFlight,
}

impl Drop for LaneQueue {
    fn drop(&mut self) {
        self.rx.close();
        while let Ok(action) = self.rx.try_recv() {
            warn!(tab_id = %action.tab_id(), action = action.kind().as_str(), "dropping queued action");
            self.in_flight.finish();
        }
    }
}

/// Marks one action handled when dropped, even if handling unwinds.
struct Handling<'a>(&'a InFlight);

impl Drop for Handling<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

async fn run_lane(
    tracker: Arc<TabTracker>,
    tab_id: TabId,
    mut queue: LaneQueue,
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
) {
    if let Some(previous) = previous {
        debug!(%tab_id, "waiting for the closed lane to drain");
        let _ = previous.await;
    }
    debug!(%tab_id, "tab lane started");
    while let Some(action) = queue.rx.recv().await {
        let _handling = Handling(&queue.in_flight);
        let kind = action.kind();
        let result = match AssertUnwindSafe(tracker.handle(action)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => {
                error!(%tab_id, action = kind.as_str(), "action handler panicked");
                continue;
            }
        };
        let Err(err) = result else {
            continue;
        };
        match &err {
            TrackerError::UnimplementedTransition { action, tab_id } => {
                error!(%tab_id, action = action.as_str(), "{err}");
                tracker.publisher().publish(Outcome::TransitionRejected {
                    tab_id: *tab_id,
                    action: *action,
                    message: err.to_string(),
                });
            }
            // The tracker already published the terminal fail outcome.
            _ => warn!(%tab_id, "{err:#}"),
        }
    }
    debug!(%tab_id, "tab lane stopped");
}
