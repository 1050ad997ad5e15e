use super::*;
use serde_json::{json, Value};
use storage::Storage;

async fn run_script(lines: &[Value]) -> Vec<Value> {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let driver = Driver::new(Arc::new(storage), 64, false, Vec::new());

    let script = lines
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n");
    let out = driver.run(script.as_bytes()).await.expect("run");

    String::from_utf8(out)
        .expect("utf8")
        .lines()
        .map(|line| serde_json::from_str(line).expect("json line"))
        .collect()
}

fn of_type<'a>(output: &'a [Value], kind: &str) -> Vec<&'a Value> {
    output.iter().filter(|line| line["type"] == kind).collect()
}

fn tab(id: i64, opener: Option<i64>) -> Value {
    json!({
        "id": id,
        "window_id": 1,
        "opener_tab_id": opener,
        "url": format!("http://x/{id}"),
        "title": format!("Tab {id}"),
        "active": opener.is_none(),
    })
}

#[tokio::test]
async fn recording_scenario_reports_tracked_state() {
    let output = run_script(&[
        json!({"type": "ready", "payload": {"fire_create": false}}),
        json!({"type": "host", "payload": {"event": "created", "tab": tab(1, None)}}),
        json!({"type": "command", "payload": {
            "command": "start_recording",
            "tab_id": 1,
            "tab": {"title": "Example", "url": "http://x"},
        }}),
        json!({"type": "host", "payload": {"event": "created", "tab": tab(2, Some(1))}}),
        json!({"type": "driver", "payload": {"action": "getLog"}}),
        json!({"type": "host", "payload": {"event": "removed", "tab_id": 2, "window_id": 1}}),
        json!({"type": "command", "payload": {"command": "request_tab_state", "tab_id": 2}}),
    ])
    .await;

    let created = of_type(&output, "assignment_created");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["payload"]["assignment"]["localId"], 1);
    let nodes = of_type(&output, "node_created");
    assert_eq!(nodes[0]["payload"]["node"]["localAssignmentId"], 1);
    assert_eq!(nodes[0]["payload"]["node"]["url"], "http://x");
    assert_eq!(of_type(&output, "start_recording_success").len(), 1);

    let log = output
        .iter()
        .find(|line| line.get("data").is_some())
        .expect("get_log response");
    let tabs = log["data"]["snapshot"]["tabs"].as_array().expect("tabs");
    assert_eq!(tabs.len(), 2);
    assert!(tabs.iter().all(|tab| tab["state"] == "recording"));
    let recording = log["data"]["recording"].as_array().expect("recording");
    assert_eq!(recording[0]["tab_id"], 1);
    assert_eq!(recording[0]["assignment"]["localId"], 1);
    assert_eq!(recording[1]["tab_id"], 2);
    assert!(recording[1].get("node").is_none());

    let responses = of_type(&output, "request_tab_state_response");
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["payload"]["tab_id"], 2);
    assert_eq!(responses[0]["payload"]["state"]["recording"], false);
}

#[tokio::test]
async fn malformed_lines_answer_with_validation_errors() {
    let output = run_script(&[
        json!({"type": "teleport"}),
        json!({"type": "command", "payload": {"command": "request_tab_state", "tab_id": 9}}),
    ])
    .await;

    assert_eq!(output[0]["error"]["code"], "validation");
    assert!(output[0]["error"]["message"]
        .as_str()
        .expect("message")
        .starts_with("malformed script line"));
    assert_eq!(output[1]["type"], "request_tab_state_response");
}

#[tokio::test]
async fn events_before_ready_are_backfilled_from_the_host() {
    let output = run_script(&[
        json!({"type": "host", "payload": {"event": "window", "window_id": 1, "focused": true}}),
        json!({"type": "host", "payload": {"event": "created", "tab": tab(1, None)}}),
        json!({"type": "host", "payload": {"event": "created", "tab": tab(2, Some(1))}}),
        json!({"type": "ready", "payload": {"fire_create": true}}),
    ])
    .await;

    // Nothing reached the tracker before ready.
    let changes = of_type(&output, "state_changed");
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1]["payload"]["snapshot"]["tabs"][1]["tab_id"], 2);

    let rejected = of_type(&output, "transition_rejected");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["payload"]["tab_id"], 1);
    assert_eq!(rejected[0]["payload"]["action"], "tab_switched");
}

#[tokio::test]
async fn stop_without_recording_reports_not_recording() {
    let output = run_script(&[
        json!({"type": "ready", "payload": {}}),
        json!({"type": "command", "payload": {"command": "stop_recording", "tab_id": 3}}),
    ])
    .await;

    let failures = of_type(&output, "stop_recording_fail");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["payload"]["reason"], "not_recording");
}

#[tokio::test]
async fn navigation_commands_are_rejected_without_state_change() {
    let output = run_script(&[
        json!({"type": "ready", "payload": {}}),
        json!({"type": "host", "payload": {"event": "created", "tab": tab(1, None)}}),
        json!({"type": "command", "payload": {
            "command": "created_navigation_target",
            "tab_id": 4,
            "source_tab_id": 1,
            "url": "http://x/4",
        }}),
        json!({"type": "command", "payload": {
            "command": "history_state_updated",
            "tab_id": 1,
            "url": "http://x/1#a",
        }}),
        json!({"type": "command", "payload": {
            "command": "web_nav_committed",
            "tab_id": 1,
            "url": "http://x/1/next",
        }}),
        json!({"type": "command", "payload": {
            "command": "tab_replaced",
            "added_tab_id": 7,
            "removed_tab_id": 1,
        }}),
        json!({"type": "driver", "payload": {"action": "getLog"}}),
    ])
    .await;

    let rejected = of_type(&output, "transition_rejected");
    let actions: Vec<_> = rejected
        .iter()
        .map(|line| line["payload"]["action"].as_str().expect("action"))
        .collect();
    assert_eq!(
        actions,
        [
            "created_navigation_target",
            "history_state_updated",
            "web_nav_committed",
            "tab_replaced",
        ]
    );
    assert_eq!(rejected[0]["payload"]["tab_id"], 4);
    assert_eq!(rejected[3]["payload"]["tab_id"], 7);

    let log = output
        .iter()
        .find(|line| line.get("data").is_some())
        .expect("get_log response");
    let tabs = log["data"]["snapshot"]["tabs"].as_array().expect("tabs");
    assert_eq!(tabs.len(), 1);
    assert_eq!(tabs[0]["state"], "idle");
}
