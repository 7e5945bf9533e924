//! Arbitration of writable nodes between declarations, chips and operators.

use labflow::devices::simulated::SimulatedDriver;
use labflow::devices::tree::parse_path;
use labflow::devices::{ClaimMarker, ClaimSymbol, DeviceTree, DevicesExecutor, Node, NodePath, NodeValue};
use labflow::runner::{DevicesRunner, UnitRunner};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

fn pump(driver: Arc<SimulatedDriver>) -> DeviceTree {
    let speed = Arc::new(Node::writable("speed", driver));
    DeviceTree::new(vec![Arc::new(Node::collection("pump", vec![speed]))])
}

fn nested(depth: usize) -> ClaimSymbol {
    (1..depth).fold(ClaimSymbol::root(), |symbol, _| symbol.child())
}

fn speed(value: f64) -> Vec<(NodePath, NodeValue)> {
    vec![(parse_path("pump.speed"), NodeValue::Number(value))]
}

fn owner(tree: &DeviceTree) -> Option<ClaimMarker> {
    tree.find(&parse_path("pump.speed"))
        .and_then(|node| node.claimable().and_then(|claimable| claimable.owner()))
}

/// Let spawned workers run until the paused clock has moved by `seconds`.
async fn settle(seconds: u64) {
    tokio::time::sleep(Duration::from_secs(seconds)).await;
}

#[tokio::test(start_paused = true)]
async fn test_priority_follows_nesting_depth() {
    let driver = SimulatedDriver::new(NodeValue::Number(0.0));
    let tree = pump(driver.clone());
    tree.configure().await;

    let runner = DevicesRunner::new("chip", tree, Duration::from_secs(1));

    runner.add(nested(3), speed(3.0));
    let shallow = runner.add(nested(1), speed(1.0));
    let middle = runner.add(nested(2), speed(2.0));

    let depths: Vec<usize> = runner
        .declarations()
        .iter()
        .map(|declaration| declaration.trace().depth())
        .collect();
    assert_eq!(depths, vec![3, 2, 1]);

    runner.write_state();
    settle(1).await;

    assert_eq!(runner.resolved(&parse_path("pump.speed")), Some(NodeValue::Number(3.0)));
    assert_eq!(driver.writes(), vec![NodeValue::Number(3.0)]);

    // Inactive declarations are skipped even when more specific.
    let deepest = runner.declarations()[0].id();
    runner.set_active(deepest, false);
    runner.update();
    settle(1).await;

    assert_eq!(runner.resolved(&parse_path("pump.speed")), Some(NodeValue::Number(2.0)));

    runner.remove(middle);
    runner.update();
    settle(1).await;

    assert_eq!(
        driver.writes(),
        vec![
            NodeValue::Number(3.0),
            NodeValue::Number(2.0),
            NodeValue::Number(1.0),
        ]
    );

    runner.remove(shallow);
    runner.remove(deepest);
    runner.transfer_state().await;

    assert!(!runner.tracks(&parse_path("pump.speed")));
}

#[tokio::test(start_paused = true)]
async fn test_transfer_waits_for_slow_write() {
    let driver = SimulatedDriver::new(NodeValue::Number(0.0));
    driver.set_write_delay(Duration::from_secs(2));

    let tree = pump(driver.clone());
    tree.configure().await;

    let runner = DevicesRunner::new("chip", tree.clone(), Duration::from_secs(10));
    let id = runner.add(nested(1), speed(4.0));
    runner.write_state();
    runner.remove(id);

    let start = Instant::now();
    runner.transfer_state().await;

    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(driver.writes(), vec![NodeValue::Number(4.0)]);
    assert!(!runner.tracks(&parse_path("pump.speed")));

    settle(1).await;
    assert_eq!(owner(&tree), None);
}

#[tokio::test(start_paused = true)]
async fn test_settle_timeout_bounds_transfer() {
    let driver = SimulatedDriver::new(NodeValue::Number(0.0));
    driver.set_write_delay(Duration::from_secs(60));

    let tree = pump(driver);
    tree.configure().await;

    let runner = DevicesRunner::new("chip", tree, Duration::from_secs(5));
    let id = runner.add(nested(1), speed(4.0));
    runner.write_state();
    runner.remove(id);

    let start = Instant::now();
    runner.transfer_state().await;

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(60));
    assert!(!runner.tracks(&parse_path("pump.speed")));
}

#[tokio::test(start_paused = true)]
async fn test_second_chip_waits_for_first() {
    let driver = SimulatedDriver::new(NodeValue::Number(0.0));
    let tree = pump(driver.clone());
    tree.configure().await;

    let first = DevicesRunner::new("a", tree.clone(), Duration::from_secs(1));
    let second = DevicesRunner::new("b", tree.clone(), Duration::from_secs(1));

    let first_id = first.add(nested(1), speed(1.0));
    first.write_state();
    settle(1).await;

    second.add(nested(1), speed(2.0));
    second.write_state();
    settle(1).await;

    assert_eq!(driver.writes(), vec![NodeValue::Number(1.0)]);
    assert_eq!(
        owner(&tree),
        Some(ClaimMarker::Master {
            chip_id: "a".to_string()
        })
    );

    first.remove(first_id);
    first.transfer_state().await;
    settle(1).await;

    assert_eq!(driver.writes(), vec![NodeValue::Number(1.0), NodeValue::Number(2.0)]);
    assert_eq!(
        owner(&tree),
        Some(ClaimMarker::Master {
            chip_id: "b".to_string()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_protocol_reasserts_after_operator_release() {
    let driver = SimulatedDriver::new(NodeValue::Number(0.0));
    let tree = pump(driver.clone());
    tree.configure().await;

    let runner = DevicesRunner::new("chip", tree.clone(), Duration::from_secs(1));
    let executor = DevicesExecutor::new(tree.clone());

    runner.add(nested(1), speed(5.0));
    runner.write_state();
    settle(1).await;

    executor
        .write("alice", &parse_path("pump.speed"), NodeValue::Number(8.0))
        .await
        .unwrap();
    settle(1).await;

    // The protocol's worker backed off instead of queueing behind the operator.
    assert_eq!(tree.find(&parse_path("pump.speed")).unwrap().claimable().unwrap().pending_count(), 0);

    assert!(executor.release("alice", &parse_path("pump.speed")));
    assert_eq!(owner(&tree), None);

    runner.write_state();
    settle(1).await;

    assert_eq!(
        driver.writes(),
        vec![
            NodeValue::Number(5.0),
            NodeValue::Number(8.0),
            NodeValue::Number(5.0),
        ]
    );
    assert!(owner(&tree).is_some_and(|owner| owner.is_automated()));
}

#[tokio::test(start_paused = true)]
async fn test_disconnected_node_keeps_target_until_connect() {
    let driver = SimulatedDriver::new(NodeValue::Number(0.0));
    driver.set_available(false);

    let tree = pump(driver.clone());
    tree.configure().await;

    let runner = DevicesRunner::new("chip", tree.clone(), Duration::from_secs(1));
    runner.add(nested(1), speed(6.0));
    runner.write_state();
    settle(1).await;

    let state = &tree.snapshot()["pump.speed"];
    assert!(!state.connected);
    assert_eq!(state.target, Some(NodeValue::Number(6.0)));
    assert!(driver.writes().is_empty());

    driver.set_available(true);
    tree.configure().await;

    assert_eq!(driver.writes(), vec![NodeValue::Number(6.0)]);
    assert_eq!(tree.snapshot()["pump.speed"].value, Some(NodeValue::Number(6.0)));
}
