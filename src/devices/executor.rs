//! Interactive access to device nodes.
//!
//! Clients (the GUI, a terminal) write nodes by hand through the executor. Such
//! claims always force: an operator takes a node over from a running protocol,
//! whose worker sees its claim lost and backs off until the operator releases it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::claim::{Claim, ClaimMarker, ClaimState};
use super::tree::{path_key, DeviceTree, NodePath};
use super::value::NodeValue;
use crate::error::{AppResult, EngineError};

/// Request addressed to the devices executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DevicesInstruction {
    /// Take over a node
    #[serde(rename_all = "camelCase")]
    Claim {
        /// Target node
        node_path: NodePath,
    },
    /// Give a node back
    #[serde(rename_all = "camelCase")]
    Release {
        /// Target node
        node_path: NodePath,
    },
    /// Write a node, claiming it first if needed
    #[serde(rename_all = "camelCase")]
    Write {
        /// Target node
        node_path: NodePath,
        /// Value to write
        value: NodeValue,
    },
}

/// Claim held on behalf of one agent.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeldClaim {
    /// Agent holding the claim
    pub agent: String,
    /// Claimed node
    pub node: String,
    /// Claim state
    pub state: ClaimState,
}

type ClaimKey = (String, String);

struct UserClaim {
    claim: Arc<Claim>,
    watcher: JoinHandle<()>,
}

impl Drop for UserClaim {
    fn drop(&mut self) {
        // The watcher keeps the claim alive until it is polled again.
        self.claim.release();
        self.watcher.abort();
    }
}

/// Executes interactive device requests for a host.
pub struct DevicesExecutor {
    tree: DeviceTree,
    claims: Arc<Mutex<BTreeMap<ClaimKey, UserClaim>>>,
}

impl DevicesExecutor {
    /// Create an executor over `tree`.
    pub fn new(tree: DeviceTree) -> Self {
        Self {
            tree,
            claims: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Take over the node at `path` for `agent`.
    ///
    /// Idempotent while the agent still holds the node.
    pub fn claim(&self, agent: &str, path: &[String]) -> AppResult<Arc<Claim>> {
        let node = self.tree.require(path)?;
        let claimable = node
            .claimable()
            .ok_or_else(|| EngineError::ReadOnlyNode(path_key(path)))?;

        let key = (agent.to_string(), path_key(path));
        let mut claims = self.claims.lock();

        if let Some(existing) = claims.get(&key) {
            if existing.claim.state() == ClaimState::Active {
                return Ok(existing.claim.clone());
            }
        }

        let claim = Arc::new(claimable.claim(
            ClaimMarker::User {
                agent: agent.to_string(),
            },
            true,
        ));

        info!(agent, node = %key.1, "Node claimed by user");

        let watcher = tokio::spawn(watch_claim(self.claims.clone(), key.clone(), claim.clone()));
        claims.insert(
            key,
            UserClaim {
                claim: claim.clone(),
                watcher,
            },
        );

        Ok(claim)
    }

    /// Release the claim `agent` holds on the node at `path`, if any.
    pub fn release(&self, agent: &str, path: &[String]) -> bool {
        let key = (agent.to_string(), path_key(path));
        let released = self.claims.lock().remove(&key);

        if released.is_some() {
            info!(agent, node = %key.1, "Node released by user");
        }

        released.is_some()
    }

    /// Write `value` to the node at `path` on behalf of `agent`.
    pub async fn write(&self, agent: &str, path: &[String], value: NodeValue) -> AppResult<()> {
        let node = self.tree.require(path)?;
        let claim = self.claim(agent, path)?;

        node.write(&claim, value).await
    }

    /// Dispatch an instruction.
    pub async fn instruct(&self, agent: &str, instruction: DevicesInstruction) -> AppResult<()> {
        match instruction {
            DevicesInstruction::Claim { node_path } => self.claim(agent, &node_path).map(|_| ()),
            DevicesInstruction::Release { node_path } => {
                self.release(agent, &node_path);
                Ok(())
            }
            DevicesInstruction::Write { node_path, value } => {
                self.write(agent, &node_path, value).await
            }
        }
    }

    /// Claims currently held.
    pub fn held(&self) -> Vec<HeldClaim> {
        self.claims
            .lock()
            .iter()
            .map(|((agent, node), held)| HeldClaim {
                agent: agent.clone(),
                node: node.clone(),
                state: held.claim.state(),
            })
            .collect()
    }

    /// Release every user claim.
    pub fn release_all(&self) {
        self.claims.lock().clear();
    }

    /// Summary for host snapshots.
    pub fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "root": self.tree.export(),
            "claims": self.held(),
        })
    }
}

impl Drop for DevicesExecutor {
    fn drop(&mut self) {
        self.release_all();
    }
}

async fn watch_claim(claims: Arc<Mutex<BTreeMap<ClaimKey, UserClaim>>>, key: ClaimKey, claim: Arc<Claim>) {
    claim.lost().await;
    debug!(agent = %key.0, node = %key.1, "User claim lost");

    let mut claims = claims.lock();

    // Aborting the running task from within only takes effect at its next await.
    if claims
        .get(&key)
        .is_some_and(|held| Arc::ptr_eq(&held.claim, &claim))
    {
        claims.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::node::Node;
    use crate::devices::simulated::SimulatedDriver;
    use crate::devices::tree::parse_path;

    async fn pump() -> (DevicesExecutor, Arc<SimulatedDriver>, Arc<Node>) {
        let driver = SimulatedDriver::new(NodeValue::Number(0.0));
        let speed = Arc::new(Node::writable("speed", driver.clone()));
        let temp = Arc::new(Node::readable("temp", SimulatedDriver::new(NodeValue::Number(20.0))));
        let tree = DeviceTree::new(vec![Arc::new(Node::collection("pump", vec![speed.clone(), temp]))]);
        tree.configure().await;

        (DevicesExecutor::new(tree), driver, speed)
    }

    #[tokio::test]
    async fn test_write_claims_node() {
        let (executor, driver, speed) = pump().await;

        executor
            .write("alice", &parse_path("pump.speed"), NodeValue::Number(3.0))
            .await
            .unwrap();

        assert_eq!(driver.writes(), vec![NodeValue::Number(3.0)]);
        assert_eq!(
            speed.claimable().unwrap().owner(),
            Some(ClaimMarker::User {
                agent: "alice".to_string()
            })
        );

        assert!(executor.release("alice", &parse_path("pump.speed")));
        assert_eq!(speed.claimable().unwrap().owner(), None);
    }

    #[tokio::test]
    async fn test_user_claim_forces_master() {
        let (executor, _driver, speed) = pump().await;
        let claimable = speed.claimable().unwrap();

        let master = claimable.claim(
            ClaimMarker::Master {
                chip_id: "chip".to_string(),
            },
            false,
        );
        assert!(master.is_active());

        executor.claim("alice", &parse_path("pump.speed")).unwrap();

        assert_eq!(master.state(), ClaimState::Lost);
        assert!(!claimable.owner().unwrap().is_automated());
    }

    #[tokio::test]
    async fn test_release_promotes_waiting_claim() {
        let (executor, _driver, speed) = pump().await;
        let claimable = speed.claimable().unwrap();

        executor.claim("alice", &parse_path("pump.speed")).unwrap();
        let master = claimable.claim(
            ClaimMarker::Master {
                chip_id: "chip".to_string(),
            },
            false,
        );
        assert_eq!(master.state(), ClaimState::Pending);

        assert!(executor.release("alice", &parse_path("pump.speed")));
        assert!(master.is_active());
        assert!(executor.held().is_empty());
        assert!(!executor.release("alice", &parse_path("pump.speed")));

        master.destroy();
        executor.claim("bob", &parse_path("pump.speed")).unwrap();
        executor.release_all();
        assert_eq!(claimable.owner(), None);
    }

    #[tokio::test]
    async fn test_lost_user_claim_is_forgotten() {
        let (executor, _driver, speed) = pump().await;

        executor.claim("alice", &parse_path("pump.speed")).unwrap();
        executor.claim("bob", &parse_path("pump.speed")).unwrap();

        for _ in 0..10 {
            if executor.held().len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let held = executor.held();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].agent, "bob");
        assert_eq!(
            speed.claimable().unwrap().owner(),
            Some(ClaimMarker::User {
                agent: "bob".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_readable_node_rejected() {
        let (executor, _driver, _speed) = pump().await;

        let result = executor.claim("alice", &parse_path("pump.temp"));
        assert!(matches!(result, Err(EngineError::ReadOnlyNode(_))));

        let result = executor.claim("alice", &parse_path("pump.missing"));
        assert!(matches!(result, Err(EngineError::NodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_instruction_json() {
        let instruction: DevicesInstruction = serde_json::from_value(serde_json::json!({
            "type": "write",
            "nodePath": ["pump", "speed"],
            "value": 2.5,
        }))
        .unwrap();

        assert_eq!(
            instruction,
            DevicesInstruction::Write {
                node_path: parse_path("pump.speed"),
                value: NodeValue::Number(2.5),
            }
        );
    }
}
