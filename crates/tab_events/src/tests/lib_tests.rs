use super::*;
use anyhow::anyhow;

struct StaticHost {
    tabs: Vec<HostTab>,
    focused: Option<HostWindow>,
}

#[async_trait]
impl TabHost for StaticHost {
    async fn query_tabs(&self) -> Result<Vec<HostTab>> {
        Ok(self.tabs.clone())
    }

    async fn last_focused_window(&self) -> Result<Option<HostWindow>> {
        Ok(self.focused.clone())
    }
}

fn host_tab(id: i64, active: bool) -> HostTab {
    HostTab {
        id: TabId(id),
        window_id: WindowId(1),
        opener_tab_id: None,
        url: Some(format!("https://example.com/{id}")),
        title: Some(format!("Tab {id}")),
        active,
    }
}

fn host_with(tabs: Vec<HostTab>, window_type: WindowType) -> Arc<StaticHost> {
    Arc::new(StaticHost {
        focused: Some(HostWindow {
            id: WindowId(1),
            window_type,
            tabs: tabs.clone(),
        }),
        tabs,
    })
}

fn empty_host() -> Arc<StaticHost> {
    Arc::new(StaticHost {
        tabs: Vec::new(),
        focused: None,
    })
}

type Seen = Arc<Mutex<Vec<TabEvent>>>;

fn record_into(adapter: &EventSourceAdapter, seen: &Seen) {
    for kind in TabEventKind::ALL {
        let seen = seen.clone();
        adapter
            .channel(kind)
            .expect("declared channel")
            .add_listener(move |event| {
                seen.lock().expect("seen lock").push(event.clone());
                Ok(())
            });
    }
}

#[test]
fn events_before_ready_are_dropped() {
    let adapter = EventSourceAdapter::new(empty_host());
    let seen: Seen = Arc::default();
    record_into(&adapter, &seen);

    let delivered = adapter.on_created_tab_notification(host_tab(7, false));
    assert_eq!(delivered, 0);
    assert!(seen.lock().expect("seen lock").is_empty());
}

#[tokio::test]
async fn created_tab_envelope_carries_parent_and_page() {
    let adapter = EventSourceAdapter::new(empty_host());
    let seen: Seen = Arc::default();
    record_into(&adapter, &seen);
    assert!(adapter.ready(false).await.expect("ready"));

    let mut tab = host_tab(2, false);
    tab.opener_tab_id = Some(TabId(1));
    adapter.on_created_tab_notification(tab);

    let seen = seen.lock().expect("seen lock");
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].data,
        TabEventData::CreatedTab {
            tab_id: TabId(2),
            parent_tab_id: Some(TabId(1)),
            url: Some("https://example.com/2".into()),
            title: Some("Tab 2".into()),
        }
    );
}

#[tokio::test]
async fn listeners_fire_in_registration_order_without_dedup() {
    let adapter = EventSourceAdapter::new(empty_host());
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = {
        let order = order.clone();
        move |_: &TabEvent| -> Result<()> {
            order.lock().expect("order lock").push("first");
            Ok(())
        }
    };
    let second = {
        let order = order.clone();
        move |_: &TabEvent| -> Result<()> {
            order.lock().expect("order lock").push("second");
            Ok(())
        }
    };
    adapter.on_closed_tab().add_listener(first.clone());
    adapter.on_closed_tab().add_listener(second);
    adapter.on_closed_tab().add_listener(first);
    assert_eq!(adapter.on_closed_tab().listener_count(), 3);

    adapter.ready(false).await.expect("ready");
    let delivered = adapter.on_closed_tab_notification(
        TabId(4),
        RemoveInfo {
            window_id: WindowId(1),
            is_window_closing: false,
        },
    );

    assert_eq!(delivered, 3);
    assert_eq!(
        *order.lock().expect("order lock"),
        vec!["first", "second", "first"]
    );
}

#[tokio::test]
async fn failing_listener_does_not_block_later_listeners() {
    let adapter = EventSourceAdapter::new(empty_host());
    let reached = Arc::new(Mutex::new(0));

    adapter
        .on_updated_tab()
        .add_listener(|_| Err(anyhow!("listener exploded")));
    adapter
        .on_updated_tab()
        .add_listener(|_| panic!("listener panicked"));
    {
        let reached = reached.clone();
        adapter.on_updated_tab().add_listener(move |_| {
            *reached.lock().expect("reached lock") += 1;
            Ok(())
        });
    }

    adapter.ready(false).await.expect("ready");
    let delivered =
        adapter.on_updated_tab_notification(TabId(3), ChangeInfo::default(), host_tab(3, false));

    assert_eq!(delivered, 1);
    assert_eq!(*reached.lock().expect("reached lock"), 1);
}

#[tokio::test]
async fn updated_tab_falls_back_to_change_info() {
    let adapter = EventSourceAdapter::new(empty_host());
    let seen: Seen = Arc::default();
    record_into(&adapter, &seen);
    adapter.ready(false).await.expect("ready");

    let mut tab = host_tab(5, false);
    tab.title = None;
    adapter.on_updated_tab_notification(
        TabId(5),
        ChangeInfo {
            status: Some("complete".into()),
            url: None,
            title: Some("Loaded".into()),
        },
        tab,
    );

    let seen = seen.lock().expect("seen lock");
    assert_eq!(
        seen[0].data,
        TabEventData::UpdatedTab {
            tab_id: TabId(5),
            url: Some("https://example.com/5".into()),
            title: Some("Loaded".into()),
        }
    );
}

#[tokio::test]
async fn ready_backfills_creates_then_single_switch() {
    let host = host_with(
        vec![host_tab(1, false), host_tab(2, true), host_tab(3, false)],
        WindowType::Normal,
    );
    let adapter = EventSourceAdapter::new(host);
    let seen: Seen = Arc::default();
    record_into(&adapter, &seen);

    assert!(adapter.ready(true).await.expect("ready"));

    let seen = seen.lock().expect("seen lock");
    let kinds: Vec<_> = seen.iter().map(|e| (e.kind(), e.tab_id().0)).collect();
    assert_eq!(
        kinds,
        vec![
            (TabEventKind::CreatedTab, 1),
            (TabEventKind::CreatedTab, 2),
            (TabEventKind::CreatedTab, 3),
            (TabEventKind::SwitchedTab, 2),
        ]
    );
}

#[tokio::test]
async fn second_ready_call_emits_nothing() {
    let host = host_with(vec![host_tab(1, true)], WindowType::Normal);
    let adapter = EventSourceAdapter::new(host);
    let seen: Seen = Arc::default();
    record_into(&adapter, &seen);

    assert!(adapter.ready(true).await.expect("first ready"));
    let after_first = seen.lock().expect("seen lock").len();
    assert_eq!(after_first, 2);

    assert!(!adapter.ready(true).await.expect("second ready"));
    assert_eq!(seen.lock().expect("seen lock").len(), after_first);
}

#[tokio::test]
async fn ready_without_fire_create_does_not_backfill() {
    let host = host_with(vec![host_tab(1, true)], WindowType::Normal);
    let adapter = EventSourceAdapter::new(host);
    let seen: Seen = Arc::default();
    record_into(&adapter, &seen);

    adapter.ready(false).await.expect("ready");
    assert!(seen.lock().expect("seen lock").is_empty());
    assert!(adapter.is_ready());
}

#[tokio::test]
async fn focused_popup_window_skips_switch_backfill() {
    let host = host_with(vec![host_tab(1, true)], WindowType::Popup);
    let adapter = EventSourceAdapter::new(host);
    let seen: Seen = Arc::default();
    record_into(&adapter, &seen);

    adapter.ready(true).await.expect("ready");

    let seen = seen.lock().expect("seen lock");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].kind(), TabEventKind::CreatedTab);
}

#[test]
fn redeclaring_keeps_existing_listeners() {
    let mut adapter = EventSourceAdapter::new(empty_host());
    adapter.on_switched_tab().add_listener(|_| Ok(()));
    let channel = adapter.declare_event(TabEventKind::SwitchedTab);
    assert_eq!(channel.listener_count(), 1);
    assert_eq!(channel.kind(), TabEventKind::SwitchedTab);
}

#[test]
fn tab_event_serializes_with_type_and_data() {
    let event = TabEvent::new(TabEventData::ClosedTab { tab_id: TabId(9) });
    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(value["type"], "closed_tab");
    assert_eq!(value["data"]["tab_id"], 9);
    assert!(value["occurred"].is_string());
}
