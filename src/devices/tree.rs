//! Device tree: the root collection of all devices exposed by a host.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::node::{Node, NodeState};
use crate::error::{AppResult, EngineError};

/// Path of a node from the tree root, e.g. `["pump", "speed"]`.
pub type NodePath = Vec<String>;

/// Join a node path for display and map keys.
pub fn path_key(path: &[String]) -> String {
    path.join(".")
}

/// Split a dotted node reference into a path.
pub fn parse_path(reference: &str) -> NodePath {
    reference
        .split('.')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Exported description of a node, for clients rendering the tree.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescription {
    /// Node identifier
    pub id: String,
    /// Human-readable label
    pub label: Option<String>,
    /// `readable`, `writable`, `polled` or `collection`
    pub kind: &'static str,
    /// Device model, for collections
    pub model: Option<String>,
    /// Child nodes, for collections
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeDescription>,
}

/// All devices exposed by a host.
#[derive(Debug, Clone, Default)]
pub struct DeviceTree {
    devices: Vec<Arc<Node>>,
}

impl DeviceTree {
    /// Create a tree from device collection nodes.
    pub fn new(devices: Vec<Arc<Node>>) -> Self {
        Self { devices }
    }

    /// Top-level device nodes.
    pub fn devices(&self) -> &[Arc<Node>] {
        &self.devices
    }

    /// Find a node by path.
    pub fn find(&self, path: &[String]) -> Option<Arc<Node>> {
        let (first, rest) = path.split_first()?;
        let mut node = self.devices.iter().find(|device| device.id() == first)?.clone();

        for segment in rest {
            node = node
                .children()
                .iter()
                .find(|child| child.id() == segment)?
                .clone();
        }

        Some(node)
    }

    /// Find a node by path, failing with [`EngineError::NodeNotFound`].
    pub fn require(&self, path: &[String]) -> AppResult<Arc<Node>> {
        self.find(path)
            .ok_or_else(|| EngineError::NodeNotFound(path_key(path)))
    }

    /// Connect every device.
    pub async fn configure(&self) {
        for device in &self.devices {
            device.configure().await;
        }
    }

    /// Disconnect every device.
    pub async fn unconfigure(&self) {
        for device in &self.devices {
            device.unconfigure().await;
        }
    }

    /// Every value node with its path, depth-first.
    pub fn value_nodes(&self) -> Vec<(NodePath, Arc<Node>)> {
        fn visit(node: &Arc<Node>, path: &mut NodePath, out: &mut Vec<(NodePath, Arc<Node>)>) {
            path.push(node.id().to_string());

            if node.children().is_empty() {
                out.push((path.clone(), node.clone()));
            } else {
                for child in node.children() {
                    visit(child, path, out);
                }
            }

            path.pop();
        }

        let mut out = Vec::new();
        let mut path = Vec::new();

        for device in &self.devices {
            visit(device, &mut path, &mut out);
        }

        out
    }

    /// Flat state snapshot keyed by dotted path.
    pub fn snapshot(&self) -> BTreeMap<String, NodeState> {
        self.value_nodes()
            .into_iter()
            .map(|(path, node)| (path_key(&path), node.state()))
            .collect()
    }

    /// Structural description of the tree.
    pub fn export(&self) -> Vec<NodeDescription> {
        fn describe(node: &Node) -> NodeDescription {
            use super::node::NodeKind;

            NodeDescription {
                id: node.id().to_string(),
                label: node.label().map(str::to_string),
                kind: match node.kind() {
                    NodeKind::Readable(_) => "readable",
                    NodeKind::Writable(_) => "writable",
                    NodeKind::Polled(_) => "polled",
                    NodeKind::Collection(_) => "collection",
                },
                model: node.model().map(str::to_string),
                children: node.children().iter().map(|child| describe(child)).collect(),
            }
        }

        self.devices.iter().map(|device| describe(device)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::simulated::SimulatedDriver;
    use crate::devices::value::NodeValue;

    fn tree() -> DeviceTree {
        let speed = Arc::new(Node::writable("speed", SimulatedDriver::new(NodeValue::Number(1.0))));
        let temp = Arc::new(Node::readable("temp", SimulatedDriver::new(NodeValue::Number(20.0))));
        let pump = Arc::new(Node::collection("pump", vec![speed, temp]).with_model("P-100"));

        DeviceTree::new(vec![pump])
    }

    #[test]
    fn test_find_by_path() {
        let tree = tree();

        assert_eq!(tree.find(&parse_path("pump.speed")).unwrap().id(), "speed");
        assert!(tree.find(&parse_path("pump.missing")).is_none());
        assert!(matches!(
            tree.require(&parse_path("valve")),
            Err(EngineError::NodeNotFound(path)) if path == "valve"
        ));
    }

    #[tokio::test]
    async fn test_snapshot_after_configure() {
        let tree = tree();
        tree.configure().await;

        let snapshot = tree.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot["pump.speed"].connected);
        assert_eq!(snapshot["pump.speed"].target, Some(NodeValue::Number(1.0)));
        assert_eq!(snapshot["pump.temp"].value, Some(NodeValue::Number(20.0)));

        let exported = serde_json::to_value(tree.export()).unwrap();
        assert_eq!(exported[0]["model"], "P-100");
        assert_eq!(exported[0]["children"][0]["kind"], "writable");
    }
}
