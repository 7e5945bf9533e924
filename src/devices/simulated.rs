//! In-memory node driver.
//!
//! Used by the command-line host to expose configured devices without hardware,
//! and by tests to script availability and values.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::node::{Node, NodeDriver};
use super::value::NodeValue;
use crate::config::{DeviceConfig, NodeKindConfig};
use crate::error::NodeError;

#[derive(Debug)]
struct SimulatedState {
    value: NodeValue,
    available: bool,
    writes: Vec<NodeValue>,
    write_delay: Duration,
}

/// Driver backed by a value in memory.
#[derive(Debug)]
pub struct SimulatedDriver {
    state: Mutex<SimulatedState>,
}

impl SimulatedDriver {
    /// Create an available driver holding `value`.
    pub fn new(value: NodeValue) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimulatedState {
                value,
                available: true,
                writes: Vec::new(),
                write_delay: Duration::ZERO,
            }),
        })
    }

    /// Make subsequent reads and writes succeed or report the node as unavailable.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Change the device-side value.
    pub fn set_value(&self, value: NodeValue) {
        self.state.lock().value = value;
    }

    /// Delay every write by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().write_delay = delay;
    }

    /// Values written so far, in order.
    pub fn writes(&self) -> Vec<NodeValue> {
        self.state.lock().writes.clone()
    }
}

#[async_trait]
impl NodeDriver for SimulatedDriver {
    async fn read(&self) -> Result<NodeValue, NodeError> {
        let state = self.state.lock();

        if state.available {
            Ok(state.value.clone())
        } else {
            Err(NodeError::Unavailable)
        }
    }

    async fn write(&self, value: &NodeValue) -> Result<(), NodeError> {
        let delay = {
            let state = self.state.lock();

            if !state.available {
                return Err(NodeError::Unavailable);
            }

            state.write_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.value = value.clone();
        state.writes.push(value.clone());
        Ok(())
    }
}

/// Build a device collection node from its configuration.
///
/// `min_poll_interval` bounds polled nodes that do not set their own minimum.
pub fn build_device(config: &DeviceConfig, min_poll_interval: Duration) -> Arc<Node> {
    let children = config
        .nodes
        .iter()
        .map(|node_config| {
            let driver = SimulatedDriver::new(node_config.initial.clone().unwrap_or(NodeValue::Null));

            let node = match node_config.kind {
                NodeKindConfig::Readable => Node::readable(&node_config.id, driver),
                NodeKindConfig::Writable => Node::writable(&node_config.id, driver),
                NodeKindConfig::Polled => {
                    let min_interval = node_config
                        .min_interval_ms
                        .map(Duration::from_millis)
                        .unwrap_or(min_poll_interval);

                    Node::polled(&node_config.id, driver, min_interval.max(min_poll_interval))
                }
            };

            let node = match &node_config.label {
                Some(label) => node.with_label(label),
                None => node,
            };

            Arc::new(node)
        })
        .collect();

    let device = Node::collection(&config.id, children).with_model(&config.model);

    Arc::new(match &config.label {
        Some(label) => device.with_label(label),
        None => device,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    #[tokio::test]
    async fn test_build_device_from_config() {
        let config = DeviceConfig {
            id: "pump".into(),
            label: Some("Pump".into()),
            model: "P-100".into(),
            nodes: vec![
                NodeConfig {
                    id: "speed".into(),
                    label: None,
                    kind: NodeKindConfig::Writable,
                    initial: Some(NodeValue::Number(2.0)),
                    min_interval_ms: None,
                },
                NodeConfig {
                    id: "pressure".into(),
                    label: None,
                    kind: NodeKindConfig::Polled,
                    initial: None,
                    min_interval_ms: Some(50),
                },
            ],
        };

        let device = build_device(&config, Duration::from_millis(100));
        device.configure().await;

        assert_eq!(device.model(), Some("P-100"));
        assert_eq!(device.label(), Some("Pump"));
        assert!(device.children()[0].is_writable());
        assert_eq!(device.children()[0].value(), Some(NodeValue::Number(2.0)));

        let pressure = &device.children()[1];
        let _registration = pressure.watch(Some(Duration::from_millis(10)));
        assert_eq!(pressure.effective_interval(), Some(Duration::from_millis(100)));
    }
}
