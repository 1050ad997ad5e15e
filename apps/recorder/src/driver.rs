use std::{io::Write, sync::Arc};

use anyhow::{Context, Result};
use recorder_core::{
    forward_tab_events, spawn_dispatcher, Action, DispatchBus, RecordStore, StopResponder,
    TabTracker,
};
use serde::Serialize;
use shared::{
    error::{DriverError, DriverException, ErrorCode},
    protocol::{DriverRequest, DriverResponse, Outcome},
};
use tab_events::{ActiveInfo, EventSourceAdapter, RemoveInfo};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    sync::broadcast::{self, error::TryRecvError},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    host::ScriptedHost,
    script::{Command, HostNotification, ScriptLine},
};

/// Replays script lines one at a time against a live tracker. Every line is
/// fully handled before the next is read, and outcomes are written in
/// publish order ahead of any driver response.
pub struct Driver<W> {
    host: Arc<ScriptedHost>,
    adapter: EventSourceAdapter,
    bus: DispatchBus,
    tracker: Arc<TabTracker>,
    dispatcher: JoinHandle<()>,
    outcomes: broadcast::Receiver<Outcome>,
    fire_create_on_ready: bool,
    out: W,
}

impl<W: Write> Driver<W> {
    pub fn new(
        store: Arc<dyn RecordStore>,
        outcome_buffer: usize,
        fire_create_on_ready: bool,
        out: W,
    ) -> Self {
        let host = Arc::new(ScriptedHost::default());
        let adapter = EventSourceAdapter::new(host.clone());
        let (bus, actions) = DispatchBus::new(outcome_buffer);
        let outcomes = bus.subscribe();
        let tracker = TabTracker::new(store, &bus);
        let dispatcher = spawn_dispatcher(tracker.clone(), actions);
        forward_tab_events(&adapter, &bus);

        Self {
            host,
            adapter,
            bus,
            tracker,
            dispatcher,
            outcomes,
            fire_create_on_ready,
            out,
        }
    }

    /// Consumes `input` until EOF, then shuts the dispatcher down and hands
    /// back the writer.
    pub async fn run<R: AsyncBufRead + Unpin>(mut self, input: R) -> Result<W> {
        let mut lines = input.lines();
        let mut count = 0usize;
        while let Some(line) = lines.next_line().await.context("failed to read script")? {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            count += 1;

            let response = match self.handle_line(line).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(line = count, "{err}");
                    Some(DriverResponse::Error {
                        error: DriverError::from(err),
                    })
                }
            };
            self.bus.settled().await;
            self.flush_outcomes()?;
            if let Some(response) = response {
                self.write_line(&response)?;
            }
        }

        info!(lines = count, "script finished");
        self.shutdown().await
    }

    async fn handle_line(&mut self, line: &str) -> Result<Option<DriverResponse>, DriverException> {
        let parsed: ScriptLine = serde_json::from_str(line).map_err(|err| {
            DriverException::new(ErrorCode::Validation, format!("malformed script line: {err}"))
        })?;

        match parsed {
            ScriptLine::Host(notification) => {
                self.notify(notification);
                Ok(None)
            }
            ScriptLine::Ready { fire_create } => {
                let fire_create = fire_create.unwrap_or(self.fire_create_on_ready);
                self.adapter.ready(fire_create).await.map_err(|err| {
                    DriverException::new(ErrorCode::Internal, format!("backfill failed: {err:#}"))
                })?;
                Ok(None)
            }
            ScriptLine::Command(command) => {
                self.dispatch(command)?;
                Ok(None)
            }
            ScriptLine::Driver(DriverRequest::GetLog) => {
                self.bus.settled().await;
                Ok(Some(DriverResponse::Data {
                    data: self.tracker.tracked_state().await,
                }))
            }
        }
    }

    fn notify(&self, notification: HostNotification) {
        let delivered = match notification {
            HostNotification::Window {
                window_id,
                window_type,
                focused,
            } => {
                self.host.window(window_id, window_type, focused);
                return;
            }
            HostNotification::Created { tab } => {
                self.host.tab_created(tab.clone());
                self.adapter.on_created_tab_notification(tab)
            }
            HostNotification::Updated {
                tab_id,
                change,
                tab,
            } => {
                self.host.tab_updated(tab.clone());
                self.adapter.on_updated_tab_notification(tab_id, change, tab)
            }
            HostNotification::Activated { tab_id, window_id } => {
                let active = ActiveInfo { tab_id, window_id };
                self.host.tab_activated(active);
                self.adapter.on_switched_tab_notification(active)
            }
            HostNotification::Removed {
                tab_id,
                window_id,
                is_window_closing,
            } => {
                self.host.tab_removed(tab_id);
                self.adapter.on_closed_tab_notification(
                    tab_id,
                    RemoveInfo {
                        window_id,
                        is_window_closing,
                    },
                )
            }
        };
        debug!(delivered, "host notification translated");
    }

    fn dispatch(&self, command: Command) -> Result<(), DriverException> {
        let action = match command {
            Command::StartRecording { tab_id, tab } => Action::StartRecording { tab_id, tab },
            Command::StopRecording { tab_id } => Action::StopRecording {
                tab_id,
                on_done: StopResponder::new(move || debug!(%tab_id, "stop acknowledged")),
            },
            Command::RequestTabState { tab_id } => Action::RequestTabState { tab_id },
            Command::CreatedNavigationTarget {
                tab_id,
                source_tab_id,
                url,
            } => Action::CreatedNavigationTarget {
                tab_id,
                source_tab_id,
                url,
            },
            Command::HistoryStateUpdated { tab_id, url } => {
                Action::HistoryStateUpdated { tab_id, url }
            }
            Command::WebNavCommitted { tab_id, url } => Action::WebNavCommitted { tab_id, url },
            Command::TabReplaced {
                added_tab_id,
                removed_tab_id,
            } => Action::TabReplaced {
                added_tab_id,
                removed_tab_id,
            },
        };
        self.bus
            .dispatch(action)
            .map_err(|err| DriverException::new(ErrorCode::Internal, err.to_string()))
    }

    fn flush_outcomes(&mut self) -> Result<()> {
        loop {
            match self.outcomes.try_recv() {
                Ok(outcome) => self.write_line(&outcome)?,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "outcome buffer overflowed, outcomes were dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return Ok(()),
            }
        }
    }

    fn write_line<T: Serialize>(&mut self, value: &T) -> Result<()> {
        serde_json::to_writer(&mut self.out, value).context("failed to encode output")?;
        self.out.write_all(b"\n").context("failed to write output")?;
        self.out.flush().context("failed to flush output")?;
        Ok(())
    }

    async fn shutdown(mut self) -> Result<W> {
        self.bus.settled().await;
        self.flush_outcomes()?;

        let Driver {
            adapter,
            bus,
            dispatcher,
            out,
            ..
        } = self;
        // The adapter listeners hold bus clones; both must go for the
        // dispatcher to see its queue close.
        drop(adapter);
        drop(bus);
        if let Err(err) = dispatcher.await {
            warn!("dispatcher task failed: {err}");
        }
        Ok(out)
    }
}

#[cfg(test)]
#[path = "tests/driver_tests.rs"]
mod tests;
