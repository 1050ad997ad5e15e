//! JSON-lines envelopes accepted by the driver.

use serde::{Deserialize, Serialize};
use shared::{
    domain::{TabId, TabInfo, WindowId},
    protocol::DriverRequest,
};
use tab_events::{ChangeInfo, HostTab, WindowType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ScriptLine {
    Host(HostNotification),
    Ready {
        #[serde(default)]
        fire_create: Option<bool>,
    },
    Command(Command),
    Driver(DriverRequest),
}

/// Raw browser notifications, before the adapter translates them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostNotification {
    Window {
        window_id: WindowId,
        #[serde(default)]
        window_type: WindowType,
        #[serde(default)]
        focused: bool,
    },
    Created {
        tab: HostTab,
    },
    Updated {
        tab_id: TabId,
        #[serde(default)]
        change: ChangeInfo,
        tab: HostTab,
    },
    Activated {
        tab_id: TabId,
        window_id: WindowId,
    },
    Removed {
        tab_id: TabId,
        window_id: WindowId,
        #[serde(default)]
        is_window_closing: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    StartRecording { tab_id: TabId, tab: TabInfo },
    StopRecording { tab_id: TabId },
    RequestTabState { tab_id: TabId },
    CreatedNavigationTarget {
        tab_id: TabId,
        source_tab_id: TabId,
        url: String,
    },
    HistoryStateUpdated { tab_id: TabId, url: String },
    WebNavCommitted { tab_id: TabId, url: String },
    TabReplaced {
        added_tab_id: TabId,
        removed_tab_id: TabId,
    },
}
