//! End-to-end protocol runs through a host with scripted devices.

use labflow::config::Settings;
use labflow::devices::simulated::SimulatedDriver;
use labflow::devices::{DeviceTree, Node, NodeValue};
use labflow::fiber::ProgramLocation;
use labflow::host::{Host, HostRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::assert_ok;

/// Host exposing a single pump with a writable `speed` node.
async fn pump_host() -> (Host, Arc<SimulatedDriver>) {
    let driver = SimulatedDriver::new(NodeValue::Number(0.0));
    let speed = Arc::new(Node::writable("speed", driver.clone()));
    let tree = DeviceTree::new(vec![Arc::new(Node::collection("pump", vec![speed]))]);

    let mut settings = Settings::default();
    settings.host.id = Some("bench".to_string());

    let host = Host::with_tree(settings, tree);
    host.start().await;

    (host, driver)
}

fn sequence_index(location: Option<ProgramLocation>) -> Option<usize> {
    match location {
        Some(ProgramLocation::Sequence { index, .. }) => Some(index),
        _ => None,
    }
}

#[tokio::test(start_paused = true)]
async fn test_nested_state_overrides_then_reverts() {
    let (mut host, driver) = pump_host().await;
    let chip_id = host.create_chip(None);

    let source = r#"
devices:
  pump.speed: 1
actions:
  - wait: 10
  - devices:
      pump.speed: 2
    wait: 10
  - wait: 10
"#;

    let start = Instant::now();
    let master = assert_ok!(host.start_plan(&chip_id, source, None).await).clone();
    master.wait_done().await;

    assert!(start.elapsed() >= Duration::from_secs(30));
    assert_eq!(
        driver.writes(),
        vec![
            NodeValue::Number(1.0),
            NodeValue::Number(2.0),
            NodeValue::Number(1.0),
        ]
    );

    tokio::time::sleep(Duration::from_secs(1)).await;

    let snapshot = host.snapshot();
    assert_eq!(snapshot.devices["pump.speed"].value, Some(NodeValue::Number(1.0)));
    assert_eq!(snapshot.devices["pump.speed"].owner, None);
    assert!(master.export().failure.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_repeat_binds_index_for_shorthand_argument() {
    let (mut host, driver) = pump_host().await;
    let chip_id = host.create_chip(None);

    let source = r#"
shorthands:
  speed:
    devices:
      pump.speed: "{{ arg }}"
actions:
  - repeat: 3
    actions:
      - speed: "{{ index * 10 }}"
        wait: 1
"#;

    let master = assert_ok!(host.start_plan(&chip_id, source, None).await).clone();
    master.wait_done().await;

    assert_eq!(
        driver.writes(),
        vec![
            NodeValue::Number(0.0),
            NodeValue::Number(10.0),
            NodeValue::Number(20.0),
        ]
    );
    assert!(master.export().errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shorthand_argument_ignores_wrapping_calls() {
    let (mut host, driver) = pump_host().await;
    let chip_id = host.create_chip(None);

    let source = r#"
shorthands:
  once:
    repeat: 1
  hold:
    wait: "{{ arg }}"
    once: 100
  speed:
    devices:
      pump.speed: "{{ arg }}"
actions:
  - hold: 2
    speed: 7
"#;

    let start = Instant::now();
    let master = assert_ok!(host.start_plan(&chip_id, source, None).await).clone();
    master.wait_done().await;

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(7));
    assert_eq!(driver.writes(), vec![NodeValue::Number(7.0)]);
    assert!(master.export().errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_progress_until_resume() {
    let (mut host, _driver) = pump_host().await;
    let chip_id = host.create_chip(None);

    let start = Instant::now();
    let master = assert_ok!(
        host.start_plan(&chip_id, "actions:\n  - wait: 10\n  - wait: 10\n", None)
            .await
    )
    .clone();

    assert_ok!(master.wait_pause().await);
    assert!(master.is_stopped());

    tokio::time::sleep(Duration::from_secs(100)).await;

    assert!(!master.is_done());
    assert_eq!(sequence_index(master.location()), Some(0));

    assert_ok!(
        host.process(HostRequest::Resume {
            chip_id: chip_id.clone()
        })
        .await
    );
    master.wait_done().await;

    assert!(start.elapsed() >= Duration::from_secs(119));
    assert_eq!(sequence_index(master.location()), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_start_at_second_action() {
    let (mut host, _driver) = pump_host().await;
    let chip_id = host.create_chip(None);

    let start = Instant::now();
    let master = assert_ok!(
        host.start_plan(
            &chip_id,
            "actions:\n  - wait: 10\n  - wait: 5\n",
            Some(serde_json::json!({ "index": 1 })),
        )
        .await
    )
    .clone();
    master.wait_done().await;

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn test_jump_moves_to_requested_action() {
    let (mut host, _driver) = pump_host().await;
    let chip_id = host.create_chip(None);

    let start = Instant::now();
    let master = assert_ok!(
        host.start_plan(&chip_id, "actions:\n  - wait: 100\n  - wait: 3\n", None)
            .await
    )
    .clone();

    assert_ok!(
        host.process(HostRequest::SetLocation {
            chip_id: chip_id.clone(),
            location: serde_json::json!({ "index": 1 }),
        })
        .await
    );
    master.wait_done().await;

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!(sequence_index(master.location()), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_operator_takes_over_node_from_protocol() {
    let (mut host, driver) = pump_host().await;
    let chip_id = host.create_chip(None);

    let master = assert_ok!(
        host.start_plan(&chip_id, "devices:\n  pump.speed: 5\nwait: 10\n", None)
            .await
    )
    .clone();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(driver.writes(), vec![NodeValue::Number(5.0)]);

    let request: HostRequest = serde_json::from_value(serde_json::json!({
        "type": "instruct",
        "namespace": "devices",
        "agent": "alice",
        "instruction": { "type": "write", "nodePath": ["pump", "speed"], "value": 9 },
    }))
    .unwrap();
    assert_ok!(host.process(request).await);

    master.wait_done().await;

    // The protocol does not fight the operator for the node.
    assert_eq!(
        driver.writes(),
        vec![NodeValue::Number(5.0), NodeValue::Number(9.0)]
    );

    let owner = host.snapshot().devices["pump.speed"].owner.clone();
    assert!(owner.is_some_and(|owner| !owner.is_automated()));
}
