//! Declarations and the devices runner.
//!
//! Running state blocks register [`Declaration`]s: desired node values tagged
//! with the [`ClaimSymbol`] trace of the run instance that produced them. The
//! [`DevicesRunner`] resolves, per node, the highest-priority declaration that
//! is both active and applied, and hands the resolved value to a per-node worker
//! task which claims the node and writes it.
//!
//! Priority is a strict total order: longer traces (more deeply nested, hence
//! more specific) come first, ties keep insertion order.
//!
//! ```text
//! add() ──▶ Declaration{active, !applied}
//!                │
//!        apply() │  (Master::write_state)
//!                ▼
//!          update() ──resolved value──▶ NodeWorker ──claim + write──▶ Node
//!                                           │
//!                               wait() ◀────┘ (Master::transfer_state)
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::devices::claim::{ClaimMarker, ClaimSymbol};
use crate::devices::node::Node;
use crate::devices::tree::{path_key, DeviceTree, NodePath};
use crate::devices::value::NodeValue;

/// Per-unit participant in the master's state-transfer barriers.
#[async_trait]
pub trait UnitRunner: Send + Sync {
    /// Unit namespace, e.g. `devices`.
    fn namespace(&self) -> &str;

    /// Wait until device state released since the last barrier has settled.
    async fn transfer_state(&self);

    /// Commit every pending declaration.
    fn write_state(&self);

    /// Drop all intent and release every claim held on behalf of the run.
    fn release_all(&self);

    /// Serializable summary for host snapshots.
    fn export(&self) -> serde_json::Value;
}

/// Handle identifying a declaration within its runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeclarationId(u64);

/// A desired set of node values registered by a running state block.
#[derive(Debug, Clone)]
pub struct Declaration {
    id: DeclarationId,
    trace: ClaimSymbol,
    assignments: Vec<(NodePath, NodeValue)>,
    active: bool,
    applied: bool,
}

impl Declaration {
    /// Declaration identifier.
    pub fn id(&self) -> DeclarationId {
        self.id
    }

    /// Trace of the run instance that registered it.
    pub fn trace(&self) -> &ClaimSymbol {
        &self.trace
    }

    /// Assigned node values.
    pub fn assignments(&self) -> &[(NodePath, NodeValue)] {
        &self.assignments
    }

    /// Whether the owning run instance still exists.
    pub fn active(&self) -> bool {
        self.active
    }

    /// Whether the declaration was committed at a state-transfer barrier.
    pub fn applied(&self) -> bool {
        self.applied
    }

    fn value_for(&self, path: &[String]) -> Option<&NodeValue> {
        self.assignments
            .iter()
            .find(|(candidate, _)| candidate.as_slice() == path)
            .map(|(_, value)| value)
    }
}

struct NodeInfo {
    node: Arc<Node>,
    path: NodePath,
    candidate_count: usize,
    current: Option<NodeValue>,
    version: u64,
    update_tx: watch::Sender<(u64, Option<NodeValue>)>,
    ack_rx: Option<watch::Receiver<u64>>,
    worker: Option<JoinHandle<()>>,
}

impl NodeInfo {
    fn worker_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }
}

impl Drop for NodeInfo {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

#[derive(Default)]
struct RunnerState {
    declarations: Vec<Declaration>,
    next_id: u64,
    nodes: BTreeMap<String, NodeInfo>,
}

/// Serializable view of a declaration, in priority order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclarationSummary {
    /// Depth of the declaring run instance
    pub depth: usize,
    /// Assigned values keyed by dotted node path
    pub assignments: BTreeMap<String, NodeValue>,
    /// See [`Declaration::active`]
    pub active: bool,
    /// See [`Declaration::applied`]
    pub applied: bool,
}

/// Resolves declarations into claim-backed node writes for one chip.
pub struct DevicesRunner {
    marker: ClaimMarker,
    tree: DeviceTree,
    settle_timeout: Duration,
    state: Mutex<RunnerState>,
}

impl DevicesRunner {
    /// Create a runner whose workers claim nodes on behalf of `chip_id`.
    pub fn new(chip_id: impl Into<String>, tree: DeviceTree, settle_timeout: Duration) -> Self {
        Self {
            marker: ClaimMarker::Master {
                chip_id: chip_id.into(),
            },
            tree,
            settle_timeout,
            state: Mutex::new(RunnerState::default()),
        }
    }

    /// Device tree the runner writes to.
    pub fn tree(&self) -> &DeviceTree {
        &self.tree
    }

    /// Register a declaration. Assignments to unknown or read-only nodes are
    /// dropped with a warning.
    pub fn add(&self, trace: ClaimSymbol, assignments: Vec<(NodePath, NodeValue)>) -> DeclarationId {
        let mut state = self.state.lock();

        let id = DeclarationId(state.next_id);
        state.next_id += 1;

        let mut kept = Vec::with_capacity(assignments.len());

        for (path, value) in assignments {
            let key = path_key(&path);

            if let Some(info) = state.nodes.get_mut(&key) {
                info.candidate_count += 1;
                kept.push((path, value));
                continue;
            }

            match self.tree.find(&path) {
                Some(node) if node.is_writable() => {
                    let (update_tx, _) = watch::channel((0, None));

                    state.nodes.insert(
                        key,
                        NodeInfo {
                            node,
                            path: path.clone(),
                            candidate_count: 1,
                            current: None,
                            version: 0,
                            update_tx,
                            ack_rx: None,
                            worker: None,
                        },
                    );
                    kept.push((path, value));
                }
                Some(_) => warn!(node = %key, "Ignoring declaration on read-only node"),
                None => warn!(node = %key, "Ignoring declaration on unknown node"),
            }
        }

        let declaration = Declaration {
            id,
            trace,
            assignments: kept,
            active: true,
            applied: false,
        };

        // Stable sort: equal depths keep insertion order.
        state.declarations.push(declaration);
        state
            .declarations
            .sort_by(|a, b| b.trace.depth().cmp(&a.trace.depth()));

        debug!(declaration = id.0, count = state.declarations.len(), "Declaration added");
        id
    }

    /// Remove a declaration and decrement the candidate counts it contributed.
    pub fn remove(&self, id: DeclarationId) {
        let mut state = self.state.lock();

        let Some(index) = state.declarations.iter().position(|decl| decl.id == id) else {
            return;
        };

        let declaration = state.declarations.remove(index);

        for (path, _) in &declaration.assignments {
            if let Some(info) = state.nodes.get_mut(&path_key(path)) {
                info.candidate_count = info.candidate_count.saturating_sub(1);
            }
        }

        debug!(declaration = id.0, "Declaration removed");
    }

    /// Mark a declaration as (in)active.
    pub fn set_active(&self, id: DeclarationId, active: bool) {
        let mut state = self.state.lock();

        if let Some(declaration) = state.declarations.iter_mut().find(|decl| decl.id == id) {
            declaration.active = active;
        }
    }

    /// Resolve every node with candidates and signal or spawn its worker.
    pub fn update(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        for info in state.nodes.values_mut() {
            if info.candidate_count == 0 {
                continue;
            }

            let resolved = state
                .declarations
                .iter()
                .filter(|decl| decl.active && decl.applied)
                .find_map(|decl| decl.value_for(&info.path))
                .cloned();

            if resolved != info.current {
                info.current = resolved.clone();
                info.version += 1;
                info.update_tx.send_replace((info.version, resolved));
            }

            if info.current.is_some() && !info.worker_running() {
                let (ack_tx, ack_rx) = watch::channel(0);

                debug!(node = %path_key(&info.path), "Spawning node worker");

                info.ack_rx = Some(ack_rx);
                info.worker = Some(tokio::spawn(node_worker(
                    info.node.clone(),
                    self.marker.clone(),
                    info.update_tx.subscribe(),
                    ack_tx,
                )));
            }
        }
    }

    /// Commit every declaration, then resolve.
    pub fn apply(&self) {
        {
            let mut state = self.state.lock();

            for declaration in &mut state.declarations {
                declaration.applied = true;
            }
        }

        self.update();
    }

    /// Wait for nodes that lost all candidates to settle, then drop their
    /// workers and bookkeeping.
    pub async fn wait(&self) {
        let released: Vec<(String, Arc<Node>, u64, Option<watch::Receiver<u64>>)> = {
            let state = self.state.lock();

            state
                .nodes
                .iter()
                .filter(|(_, info)| info.candidate_count == 0)
                .map(|(key, info)| (key.clone(), info.node.clone(), info.version, info.ack_rx.clone()))
                .collect()
        };

        for (key, node, version, ack_rx) in released {
            let settled = async {
                if let Some(mut ack_rx) = ack_rx {
                    let _ = ack_rx.wait_for(|ack| *ack >= version).await;
                }

                node.wait_settled().await;
            };

            if tokio::time::timeout(self.settle_timeout, settled).await.is_err() {
                warn!(node = %key, "Node did not settle before timeout");
            }

            let mut state = self.state.lock();

            if state.nodes.get(&key).is_some_and(|info| info.candidate_count == 0) {
                state.nodes.remove(&key);
                debug!(node = %key, "Node worker removed");
            }
        }
    }

    /// Declarations in priority order.
    pub fn declarations(&self) -> Vec<Declaration> {
        self.state.lock().declarations.clone()
    }

    /// Resolved value of the node at `path`, if it has bookkeeping.
    pub fn resolved(&self, path: &[String]) -> Option<NodeValue> {
        self.state
            .lock()
            .nodes
            .get(&path_key(path))
            .and_then(|info| info.current.clone())
    }

    /// Whether the runner keeps bookkeeping for the node at `path`.
    pub fn tracks(&self, path: &[String]) -> bool {
        self.state.lock().nodes.contains_key(&path_key(path))
    }

    fn summaries(&self) -> Vec<DeclarationSummary> {
        self.state
            .lock()
            .declarations
            .iter()
            .map(|decl| DeclarationSummary {
                depth: decl.trace.depth(),
                assignments: decl
                    .assignments
                    .iter()
                    .map(|(path, value)| (path_key(path), value.clone()))
                    .collect(),
                active: decl.active,
                applied: decl.applied,
            })
            .collect()
    }
}

#[async_trait]
impl UnitRunner for DevicesRunner {
    fn namespace(&self) -> &str {
        "devices"
    }

    async fn transfer_state(&self) {
        self.wait().await;
    }

    fn write_state(&self) {
        self.apply();
    }

    fn release_all(&self) {
        let mut state = self.state.lock();
        let workers = state.nodes.len();

        state.declarations.clear();
        state.nodes.clear();

        debug!(workers, "Released all device intent");
    }

    fn export(&self) -> serde_json::Value {
        serde_json::json!({ "declarations": self.summaries() })
    }
}

struct ExitGuard(watch::Sender<u64>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.send_replace(u64::MAX);
    }
}

async fn node_worker(
    node: Arc<Node>,
    marker: ClaimMarker,
    mut updates: watch::Receiver<(u64, Option<NodeValue>)>,
    ack: watch::Sender<u64>,
) {
    let Some(claimable) = node.claimable() else {
        return;
    };

    let claim = claimable.claim(marker, false);
    let ack = ExitGuard(ack);

    if !claim.wait().await {
        debug!(node = %node.id(), "Claim ended before activation");
        return;
    }

    loop {
        let (version, value) = updates.borrow_and_update().clone();

        if let Some(value) = value {
            if let Err(err) = node.write(&claim, value).await {
                warn!(node = %node.id(), error = %err, "Node write failed");
            }
        }

        ack.0.send_replace(version);

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = claim.lost() => {
                debug!(node = %node.id(), "Node claim lost, worker exiting");
                break;
            }
        }
    }
}
