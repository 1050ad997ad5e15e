//! Translates host tab lifecycle notifications into canonical [`TabEvent`]s
//! and fans them out to registered listeners once the adapter is ready.

use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{TabId, WindowId},
    protocol::{TabEvent, TabEventData, TabEventKind},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostTab {
    pub id: TabId,
    pub window_id: WindowId,
    #[serde(default)]
    pub opener_tab_id: Option<TabId>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowType {
    #[default]
    Normal,
    Popup,
    Panel,
    App,
    Devtools,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostWindow {
    pub id: WindowId,
    #[serde(default)]
    pub window_type: WindowType,
    #[serde(default)]
    pub tabs: Vec<HostTab>,
}

impl HostWindow {
    pub fn active_tab(&self) -> Option<&HostTab> {
        self.tabs.iter().find(|tab| tab.active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveInfo {
    pub tab_id: TabId,
    pub window_id: WindowId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeInfo {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveInfo {
    pub window_id: WindowId,
    #[serde(default)]
    pub is_window_closing: bool,
}

/// Read side of the host browser used to backfill state on activation.
#[async_trait]
pub trait TabHost: Send + Sync {
    /// Every open tab in normal windows, in host enumeration order.
    async fn query_tabs(&self) -> Result<Vec<HostTab>>;
    async fn last_focused_window(&self) -> Result<Option<HostWindow>>;
}

type Listener = Arc<dyn Fn(&TabEvent) -> Result<()> + Send + Sync>;

/// A declared event with an insertion-ordered listener list.
pub struct EventChannel {
    kind: TabEventKind,
    listeners: Mutex<Vec<Listener>>,
}

impl EventChannel {
    fn new(kind: TabEventKind) -> Self {
        Self {
            kind,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn kind(&self) -> TabEventKind {
        self.kind
    }

    /// Appends `listener`. The same handler registered twice fires twice.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&TabEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Invokes every listener in registration order and returns how many
    /// completed without error. A failing or panicking listener is logged and
    /// skipped.
    fn deliver(&self, event: &TabEvent) -> usize {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let mut delivered = 0;
        for (index, listener) in listeners.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    warn!(
                        event = self.kind.as_str(),
                        listener = index,
                        "tab event listener failed: {err:#}"
                    );
                }
                Err(_) => {
                    warn!(
                        event = self.kind.as_str(),
                        listener = index,
                        "tab event listener panicked"
                    );
                }
            }
        }
        delivered
    }
}

pub struct EventSourceAdapter {
    host: Arc<dyn TabHost>,
    ready: AtomicBool,
    channels: HashMap<TabEventKind, Arc<EventChannel>>,
}

impl EventSourceAdapter {
    pub fn new(host: Arc<dyn TabHost>) -> Self {
        let mut adapter = Self {
            host,
            ready: AtomicBool::new(false),
            channels: HashMap::new(),
        };
        for kind in TabEventKind::ALL {
            adapter.declare_event(kind);
        }
        adapter
    }

    /// Registers a channel for `kind`, keeping any listeners already attached.
    pub fn declare_event(&mut self, kind: TabEventKind) -> Arc<EventChannel> {
        self.channels
            .entry(kind)
            .or_insert_with(|| Arc::new(EventChannel::new(kind)))
            .clone()
    }

    pub fn channel(&self, kind: TabEventKind) -> Option<&EventChannel> {
        self.channels.get(&kind).map(Arc::as_ref)
    }

    pub fn on_created_tab(&self) -> &EventChannel {
        self.declared(TabEventKind::CreatedTab)
    }

    pub fn on_updated_tab(&self) -> &EventChannel {
        self.declared(TabEventKind::UpdatedTab)
    }

    pub fn on_switched_tab(&self) -> &EventChannel {
        self.declared(TabEventKind::SwitchedTab)
    }

    pub fn on_closed_tab(&self) -> &EventChannel {
        self.declared(TabEventKind::ClosedTab)
    }

    fn declared(&self, kind: TabEventKind) -> &EventChannel {
        self.channels
            .get(&kind)
            .map(Arc::as_ref)
            .unwrap_or_else(|| unreachable!("{} is declared in EventSourceAdapter::new", kind.as_str()))
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Lets events through to listeners. Only the first call has an effect;
    /// with `fire_create` it backfills a `created_tab` for every open tab and
    /// then one `switched_tab` for the focused tab.
    ///
    /// Returns `Ok(false)` when the adapter was already ready.
    pub async fn ready(&self, fire_create: bool) -> Result<bool> {
        if self
            .ready
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("EventSourceAdapter::ready() called multiple times, skipping");
            return Ok(false);
        }
        info!(fire_create, "tab event adapter ready");

        if fire_create {
            self.backfill().await?;
        }
        Ok(true)
    }

    async fn backfill(&self) -> Result<()> {
        let tabs = self.host.query_tabs().await?;
        debug!(count = tabs.len(), "backfilling created_tab events");
        for tab in tabs {
            self.on_created_tab_notification(tab);
        }

        let Some(window) = self.host.last_focused_window().await? else {
            return Ok(());
        };
        if window.window_type != WindowType::Normal {
            return Ok(());
        }
        let Some(tab) = window.active_tab() else {
            debug!(window_id = %window.id, "focused window has no active tab");
            return Ok(());
        };
        self.on_switched_tab_notification(ActiveInfo {
            tab_id: tab.id,
            window_id: window.id,
        });
        Ok(())
    }

    pub fn on_created_tab_notification(&self, tab: HostTab) -> usize {
        self.emit(TabEventData::CreatedTab {
            tab_id: tab.id,
            parent_tab_id: tab.opener_tab_id,
            url: tab.url,
            title: tab.title,
        })
    }

    pub fn on_updated_tab_notification(
        &self,
        tab_id: TabId,
        change: ChangeInfo,
        tab: HostTab,
    ) -> usize {
        if tab.id != tab_id {
            debug!(%tab_id, reported = %tab.id, "updated_tab id mismatch, using tab object");
        }
        self.emit(TabEventData::UpdatedTab {
            tab_id: tab.id,
            url: tab.url.or(change.url),
            title: tab.title.or(change.title),
        })
    }

    pub fn on_switched_tab_notification(&self, active: ActiveInfo) -> usize {
        self.emit(TabEventData::SwitchedTab {
            tab_id: active.tab_id,
            window_id: Some(active.window_id),
        })
    }

    pub fn on_closed_tab_notification(&self, tab_id: TabId, remove: RemoveInfo) -> usize {
        debug!(
            %tab_id,
            window_id = %remove.window_id,
            window_closing = remove.is_window_closing,
            "tab removed"
        );
        self.emit(TabEventData::ClosedTab { tab_id })
    }

    fn emit(&self, data: TabEventData) -> usize {
        let event = TabEvent::new(data);
        if !self.is_ready() {
            debug!(event = event.kind().as_str(), tab_id = %event.tab_id(), "adapter not ready, dropping");
            return 0;
        }
        self.declared(event.kind()).deliver(&event)
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
