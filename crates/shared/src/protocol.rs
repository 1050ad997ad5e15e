use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{AssignmentRecord, NodeRecord, TabId, TabState, WindowId},
    error::DriverError,
};

/// Canonical tab lifecycle event produced by the event source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabEvent {
    pub occurred: DateTime<Utc>,
    #[serde(flatten)]
    pub data: TabEventData,
}

impl TabEvent {
    pub fn new(data: TabEventData) -> Self {
        Self {
            occurred: Utc::now(),
            data,
        }
    }

    pub fn kind(&self) -> TabEventKind {
        self.data.kind()
    }

    pub fn tab_id(&self) -> TabId {
        match &self.data {
            TabEventData::CreatedTab { tab_id, .. }
            | TabEventData::UpdatedTab { tab_id, .. }
            | TabEventData::SwitchedTab { tab_id, .. }
            | TabEventData::ClosedTab { tab_id } => *tab_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TabEventData {
    CreatedTab {
        tab_id: TabId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tab_id: Option<TabId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    UpdatedTab {
        tab_id: TabId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    SwitchedTab {
        tab_id: TabId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        window_id: Option<WindowId>,
    },
    ClosedTab {
        tab_id: TabId,
    },
}

impl TabEventData {
    pub fn kind(&self) -> TabEventKind {
        match self {
            TabEventData::CreatedTab { .. } => TabEventKind::CreatedTab,
            TabEventData::UpdatedTab { .. } => TabEventKind::UpdatedTab,
            TabEventData::SwitchedTab { .. } => TabEventKind::SwitchedTab,
            TabEventData::ClosedTab { .. } => TabEventKind::ClosedTab,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabEventKind {
    CreatedTab,
    UpdatedTab,
    SwitchedTab,
    ClosedTab,
}

impl TabEventKind {
    pub const ALL: [TabEventKind; 4] = [
        TabEventKind::CreatedTab,
        TabEventKind::UpdatedTab,
        TabEventKind::SwitchedTab,
        TabEventKind::ClosedTab,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TabEventKind::CreatedTab => "created_tab",
            TabEventKind::UpdatedTab => "updated_tab",
            TabEventKind::SwitchedTab => "switched_tab",
            TabEventKind::ClosedTab => "closed_tab",
        }
    }
}

/// Names of every action the tracker consumes, used when reporting rejections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    TabCreated,
    TabUpdated,
    TabSwitched,
    TabClosed,
    CreatedNavigationTarget,
    HistoryStateUpdated,
    WebNavCommitted,
    TabReplaced,
    StartRecording,
    StopRecording,
    RequestTabState,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::TabCreated => "tab_created",
            ActionKind::TabUpdated => "tab_updated",
            ActionKind::TabSwitched => "tab_switched",
            ActionKind::TabClosed => "tab_closed",
            ActionKind::CreatedNavigationTarget => "created_navigation_target",
            ActionKind::HistoryStateUpdated => "history_state_updated",
            ActionKind::WebNavCommitted => "web_nav_committed",
            ActionKind::TabReplaced => "tab_replaced",
            ActionKind::StartRecording => "start_recording",
            ActionKind::StopRecording => "stop_recording",
            ActionKind::RequestTabState => "request_tab_state",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartRecordingFailReason {
    AlreadyRecording,
    TransactionFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopRecordingFailReason {
    NotRecording,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabStateResponse {
    pub recording: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<AssignmentRecord>,
}

impl TabStateResponse {
    pub fn not_recording() -> Self {
        Self {
            recording: false,
            assignment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedTab {
    pub tab_id: TabId,
    pub state: TabState,
}

/// Every tracked tab and its state, ordered by tab id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedStateSnapshot {
    pub tabs: Vec<TrackedTab>,
}

impl TrackedStateSnapshot {
    pub fn state_of(&self, tab_id: TabId) -> TabState {
        self.tabs
            .iter()
            .find(|tab| tab.tab_id == tab_id)
            .map(|tab| tab.state)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingTab {
    pub tab_id: TabId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment: Option<AssignmentRecord>,
}

/// Snapshot plus the records linked to each recording tab.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedState {
    pub snapshot: TrackedStateSnapshot,
    pub recording: Vec<RecordingTab>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Outcome {
    StartRecordingSuccess {
        tab_id: TabId,
    },
    StartRecordingFail {
        tab_id: TabId,
        reason: StartRecordingFailReason,
    },
    StopRecordingSuccess {
        tab_id: TabId,
    },
    StopRecordingFail {
        tab_id: TabId,
        reason: StopRecordingFailReason,
    },
    AssignmentCreated {
        assignment: AssignmentRecord,
    },
    NodeCreated {
        node: NodeRecord,
    },
    RequestTabStateResponse {
        tab_id: TabId,
        state: TabStateResponse,
    },
    StateChanged {
        snapshot: TrackedStateSnapshot,
    },
    TransitionRejected {
        tab_id: TabId,
        action: ActionKind,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum DriverRequest {
    GetLog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DriverResponse {
    Data { data: TrackedState },
    Error { error: DriverError },
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
