use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{TabId, WindowId};
use tab_events::{ActiveInfo, HostTab, HostWindow, TabHost, WindowType};

#[derive(Default)]
struct HostState {
    /// Open tabs in the order the host reported them.
    tabs: Vec<HostTab>,
    windows: HashMap<WindowId, WindowType>,
    focused: Option<WindowId>,
}

/// Browser stand-in fed from script lines, so backfill sees the tabs the
/// script has opened so far.
#[derive(Default)]
pub struct ScriptedHost {
    state: Mutex<HostState>,
}

impl ScriptedHost {
    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn window(&self, window_id: WindowId, window_type: WindowType, focused: bool) {
        let mut state = self.state();
        state.windows.insert(window_id, window_type);
        if focused {
            state.focused = Some(window_id);
        }
    }

    pub fn tab_created(&self, tab: HostTab) {
        let mut state = self.state();
        state.windows.entry(tab.window_id).or_default();
        if tab.active {
            deactivate_others(&mut state.tabs, tab.window_id);
        }
        match state.tabs.iter().position(|known| known.id == tab.id) {
            Some(index) => state.tabs[index] = tab,
            None => state.tabs.push(tab),
        }
    }

    pub fn tab_updated(&self, tab: HostTab) {
        let mut state = self.state();
        if let Some(known) = state.tabs.iter_mut().find(|known| known.id == tab.id) {
            let active = known.active;
            *known = HostTab { active, ..tab };
        }
    }

    /// Marks the tab active in its window and focuses that window.
    pub fn tab_activated(&self, active: ActiveInfo) {
        let mut state = self.state();
        for tab in state.tabs.iter_mut().filter(|tab| tab.window_id == active.window_id) {
            tab.active = tab.id == active.tab_id;
        }
        state.focused = Some(active.window_id);
    }

    pub fn tab_removed(&self, tab_id: TabId) {
        self.state().tabs.retain(|tab| tab.id != tab_id);
    }
}

fn deactivate_others(tabs: &mut [HostTab], window_id: WindowId) {
    for tab in tabs.iter_mut().filter(|tab| tab.window_id == window_id) {
        tab.active = false;
    }
}

#[async_trait]
impl TabHost for ScriptedHost {
    async fn query_tabs(&self) -> Result<Vec<HostTab>> {
        let state = self.state();
        Ok(state
            .tabs
            .iter()
            .filter(|tab| {
                state.windows.get(&tab.window_id).copied().unwrap_or_default()
                    == WindowType::Normal
            })
            .cloned()
            .collect())
    }

    async fn last_focused_window(&self) -> Result<Option<HostWindow>> {
        let state = self.state();
        let Some(window_id) = state.focused else {
            return Ok(None);
        };
        Ok(Some(HostWindow {
            id: window_id,
            window_type: state.windows.get(&window_id).copied().unwrap_or_default(),
            tabs: state
                .tabs
                .iter()
                .filter(|tab| tab.window_id == window_id)
                .cloned()
                .collect(),
        }))
    }
}
