//! Host: devices, chips and the request surface.
//!
//! A [`Host`] owns the device tree, the interactive executors and any number of
//! [`Chip`]s. Each chip runs at most one protocol at a time through its
//! [`MasterHandle`]. Transports (a websocket bridge, the CLI) talk to the host
//! exclusively through [`HostRequest`]s and read its [`HostSnapshot`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::Settings;
use crate::devices::executor::{DevicesExecutor, DevicesInstruction};
use crate::devices::node::NodeState;
use crate::devices::simulated::build_device;
use crate::devices::tree::DeviceTree;
use crate::error::{AppResult, EngineError};
use crate::fiber::eval::ExpressionEngine;
use crate::fiber::master::{Master, MasterExport, MasterHandle};
use crate::fiber::parser::{Draft, ProtocolParser};
use crate::fiber::program::{MasterContext, ProgramMessage};
use crate::runner::{DevicesRunner, UnitRunner};

/// Namespace of the devices unit.
pub const DEVICES_NAMESPACE: &str = "devices";

/// Units loaded by a host, resolved once from the settings.
#[derive(Debug, Clone)]
pub struct UnitRegistry {
    enabled: Vec<String>,
}

impl UnitRegistry {
    /// Every known unit whose configuration does not disable it.
    pub fn from_settings(settings: &Settings) -> Self {
        let enabled = [DEVICES_NAMESPACE]
            .into_iter()
            .filter(|namespace| settings.unit_enabled(namespace))
            .map(str::to_string)
            .collect();

        Self { enabled }
    }

    /// Whether the unit `namespace` is loaded.
    pub fn is_enabled(&self, namespace: &str) -> bool {
        self.enabled.iter().any(|enabled| enabled == namespace)
    }

    /// Loaded unit namespaces.
    pub fn namespaces(&self) -> &[String] {
        &self.enabled
    }
}

/// A request addressed to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostRequest {
    /// Parse a protocol source
    CompileDraft {
        /// YAML source
        source: String,
    },
    /// Create a chip
    CreateChip {
        /// Optional display name
        #[serde(default)]
        name: Option<String>,
    },
    /// Delete an idle chip
    #[serde(rename_all = "camelCase")]
    DeleteChip {
        /// Target chip
        chip_id: String,
    },
    /// Run a protocol on a chip
    #[serde(rename_all = "camelCase")]
    StartPlan {
        /// Target chip
        chip_id: String,
        /// YAML source
        source: String,
        /// Point to start at, in the root block's point format
        #[serde(default)]
        location: Option<serde_json::Value>,
    },
    /// Pause the protocol running on a chip
    #[serde(rename_all = "camelCase")]
    Pause {
        /// Target chip
        chip_id: String,
    },
    /// Resume the protocol running on a chip
    #[serde(rename_all = "camelCase")]
    Resume {
        /// Target chip
        chip_id: String,
    },
    /// Halt the protocol running on a chip
    #[serde(rename_all = "camelCase")]
    Halt {
        /// Target chip
        chip_id: String,
    },
    /// Move the protocol running on a chip to a point
    #[serde(rename_all = "camelCase")]
    SetLocation {
        /// Target chip
        chip_id: String,
        /// Point in the root block's point format
        location: serde_json::Value,
    },
    /// Send a message to a program of the protocol running on a chip
    #[serde(rename_all = "camelCase")]
    SkipSegment {
        /// Target chip
        chip_id: String,
        /// Block keys from the root to the target program
        block_path: Vec<usize>,
        /// Execution keys matching `block_path`
        exec_path: Vec<usize>,
        /// Message to deliver
        message: ProgramMessage,
    },
    /// Interactive request to a unit executor
    Instruct {
        /// Unit namespace
        namespace: String,
        /// Requesting agent
        agent: String,
        /// Unit-specific payload
        instruction: serde_json::Value,
    },
    /// Unit command on a chip
    #[serde(rename_all = "camelCase")]
    Command {
        /// Target chip
        chip_id: String,
        /// Unit namespace
        namespace: String,
        /// Unit-specific payload
        command: serde_json::Value,
    },
}

/// Response to a [`HostRequest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostResponse {
    /// Request applied
    Ok,
    /// Compiled draft
    Draft {
        /// Exported draft
        draft: serde_json::Value,
    },
    /// Chip created
    #[serde(rename_all = "camelCase")]
    ChipCreated {
        /// New chip identifier
        chip_id: String,
    },
}

/// An experiment context on which protocols run.
pub struct Chip {
    id: String,
    name: String,
    created: DateTime<Utc>,
    runner: Arc<DevicesRunner>,
    master: Option<MasterHandle>,
}

impl Chip {
    /// Chip identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Chip name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle of the current or last master.
    pub fn master(&self) -> Option<&MasterHandle> {
        self.master.as_ref()
    }

    /// Whether a protocol is running.
    pub fn running(&self) -> bool {
        self.master.as_ref().is_some_and(|master| !master.is_done())
    }

    fn running_master(&self) -> AppResult<&MasterHandle> {
        match &self.master {
            Some(master) if !master.is_done() => Ok(master),
            _ => Err(EngineError::ChipIdle(self.id.clone())),
        }
    }
}

/// Serializable state of a chip.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChipSnapshot {
    /// Chip identifier
    pub id: String,
    /// Chip name
    pub name: String,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Whether a protocol is running
    pub running: bool,
    /// Current or last master
    pub master: Option<MasterExport>,
    /// Runner summaries by namespace
    pub runners: BTreeMap<String, serde_json::Value>,
}

/// Serializable state of a host.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSnapshot {
    /// Host identifier
    pub id: String,
    /// Host name
    pub name: String,
    /// Snapshot time
    pub time: DateTime<Utc>,
    /// Chips by identifier
    pub chips: BTreeMap<String, ChipSnapshot>,
    /// Flattened device tree, by dotted node path
    pub devices: BTreeMap<String, NodeState>,
    /// Executor summaries by namespace
    pub executors: BTreeMap<String, serde_json::Value>,
}

/// A host exposing devices and running protocols on chips.
pub struct Host {
    id: String,
    name: String,
    settings: Settings,
    registry: UnitRegistry,
    tree: DeviceTree,
    engine: Arc<ExpressionEngine>,
    executor: DevicesExecutor,
    chips: BTreeMap<String, Chip>,
}

impl Host {
    /// Create a host exposing the simulated devices of `settings`.
    pub fn new(settings: Settings) -> Self {
        let min_poll_interval = settings.engine.min_poll_interval();
        let devices = settings
            .devices
            .iter()
            .map(|device| build_device(device, min_poll_interval))
            .collect();

        Self::with_tree(settings, DeviceTree::new(devices))
    }

    /// Create a host exposing `tree`.
    pub fn with_tree(settings: Settings, tree: DeviceTree) -> Self {
        let id = settings
            .host
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let name = settings.host.name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "labflow".to_string())
        });

        let engine = ExpressionEngine::new(settings.engine.max_expression_operations)
            .with_devices(tree.clone());

        Self {
            id,
            name,
            registry: UnitRegistry::from_settings(&settings),
            executor: DevicesExecutor::new(tree.clone()),
            engine: Arc::new(engine),
            tree,
            settings,
            chips: BTreeMap::new(),
        }
    }

    /// Host identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Device tree.
    pub fn tree(&self) -> &DeviceTree {
        &self.tree
    }

    /// Loaded units.
    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    /// Chip by identifier.
    pub fn chip(&self, chip_id: &str) -> AppResult<&Chip> {
        self.chips
            .get(chip_id)
            .ok_or_else(|| EngineError::ChipNotFound(chip_id.to_string()))
    }

    /// Connect every device.
    pub async fn start(&self) {
        info!(host = %self.id, name = %self.name, "Starting host");
        self.tree.configure().await;
    }

    /// Halt every running protocol, release every claim and disconnect devices.
    pub async fn shutdown(&mut self) {
        for chip in self.chips.values() {
            if let Some(master) = chip.master.as_ref().filter(|master| !master.is_done()) {
                if let Err(err) = master.halt().await {
                    warn!(chip = %chip.id, %err, "Could not halt protocol during shutdown");
                }

                let timeout = self.settings.engine.settle_timeout() + Duration::from_secs(1);

                if tokio::time::timeout(timeout, master.wait_done()).await.is_err() {
                    warn!(chip = %chip.id, "Protocol did not stop during shutdown, aborting it");
                }
            }

            if let Some(master) = &chip.master {
                master.abort().await;
            }

            chip.runner.release_all();
        }

        self.executor.release_all();
        self.tree.unconfigure().await;
        info!(host = %self.id, "Host stopped");
    }

    /// Parse a protocol source against this host's devices.
    pub fn compile(&self, source: &str) -> Draft {
        ProtocolParser::new(&self.engine)
            .with_devices(&self.tree)
            .parse(source)
    }

    /// Create a chip.
    pub fn create_chip(&mut self, name: Option<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let runner = Arc::new(DevicesRunner::new(
            id.clone(),
            self.tree.clone(),
            self.settings.engine.settle_timeout(),
        ));

        info!(chip = %id, "Chip created");

        self.chips.insert(
            id.clone(),
            Chip {
                name: name.unwrap_or_else(|| "Untitled chip".to_string()),
                id: id.clone(),
                created: Utc::now(),
                runner,
                master: None,
            },
        );

        id
    }

    /// Delete an idle chip.
    pub fn delete_chip(&mut self, chip_id: &str) -> AppResult<()> {
        if self.chip(chip_id)?.running() {
            return Err(EngineError::ChipRunning(chip_id.to_string()));
        }

        if let Some(chip) = self.chips.remove(chip_id) {
            chip.runner.release_all();
            info!(chip = %chip_id, "Chip deleted");
        }

        Ok(())
    }

    /// Compile `source` and run it on an idle chip.
    pub async fn start_plan(&mut self, chip_id: &str, source: &str, location: Option<serde_json::Value>) -> AppResult<&MasterHandle> {
        let draft = self.compile(source);

        let Some(protocol) = draft.valid_protocol().cloned() else {
            let errors: Vec<String> = draft
                .diagnostics
                .iter()
                .filter(|diagnostic| diagnostic.is_error())
                .map(ToString::to_string)
                .collect();

            return Err(EngineError::InvalidProtocol(errors.join("; ")));
        };

        let point = location
            .map(|location| protocol.root.import_point(&location))
            .transpose()?;

        let settings = self.settings.engine.clone();
        let engine = self.engine.clone();
        let registry = self.registry.clone();

        let chip = self
            .chips
            .get_mut(chip_id)
            .ok_or_else(|| EngineError::ChipNotFound(chip_id.to_string()))?;

        if chip.running() {
            return Err(EngineError::ChipRunning(chip_id.to_string()));
        }

        let context = Arc::new(MasterContext {
            chip_id: chip.id.clone(),
            engine,
            devices: chip.runner.clone(),
            settings,
        });

        let mut runners: Vec<Arc<dyn UnitRunner>> = Vec::new();

        if registry.is_enabled(DEVICES_NAMESPACE) {
            runners.push(chip.runner.clone());
        }

        let handle = Master::new(protocol, context, runners)
            .start(point, None, None)
            .await;

        Ok(chip.master.insert(handle))
    }

    /// Apply a request.
    pub async fn process(&mut self, request: HostRequest) -> AppResult<HostResponse> {
        match request {
            HostRequest::CompileDraft { source } => Ok(HostResponse::Draft {
                draft: self.compile(&source).export(),
            }),
            HostRequest::CreateChip { name } => Ok(HostResponse::ChipCreated {
                chip_id: self.create_chip(name),
            }),
            HostRequest::DeleteChip { chip_id } => {
                self.delete_chip(&chip_id)?;
                Ok(HostResponse::Ok)
            }
            HostRequest::StartPlan {
                chip_id,
                source,
                location,
            } => {
                self.start_plan(&chip_id, &source, location).await?;
                Ok(HostResponse::Ok)
            }
            HostRequest::Pause { chip_id } => {
                self.chip(&chip_id)?.running_master()?.pause().await?;
                Ok(HostResponse::Ok)
            }
            HostRequest::Resume { chip_id } => {
                self.chip(&chip_id)?.running_master()?.resume().await?;
                Ok(HostResponse::Ok)
            }
            HostRequest::Halt { chip_id } => {
                self.chip(&chip_id)?.running_master()?.halt().await?;
                Ok(HostResponse::Ok)
            }
            HostRequest::SetLocation { chip_id, location } => {
                self.chip(&chip_id)?
                    .running_master()?
                    .set_location(location)
                    .await?;
                Ok(HostResponse::Ok)
            }
            HostRequest::SkipSegment {
                chip_id,
                block_path,
                exec_path,
                message,
            } => {
                if block_path.len() != exec_path.len() {
                    return Err(EngineError::InvalidMessage(
                        "block and exec paths differ in length".to_string(),
                    ));
                }

                let path = block_path.into_iter().zip(exec_path).collect();

                self.chip(&chip_id)?
                    .running_master()?
                    .send_message(path, message)
                    .await?;
                Ok(HostResponse::Ok)
            }
            HostRequest::Instruct {
                namespace,
                agent,
                instruction,
            } => {
                if namespace != DEVICES_NAMESPACE || !self.registry.is_enabled(&namespace) {
                    return Err(EngineError::Unsupported(format!("instructions for unit '{namespace}'")));
                }

                let instruction: DevicesInstruction = serde_json::from_value(instruction)
                    .map_err(|err| EngineError::InvalidMessage(err.to_string()))?;

                self.executor.instruct(&agent, instruction).await?;
                Ok(HostResponse::Ok)
            }
            HostRequest::Command { namespace, .. } => {
                Err(EngineError::Unsupported(format!("commands for unit '{namespace}'")))
            }
        }
    }

    /// Current state of the host.
    pub fn snapshot(&self) -> HostSnapshot {
        let chips = self
            .chips
            .values()
            .map(|chip| {
                let runners = if self.registry.is_enabled(DEVICES_NAMESPACE) {
                    BTreeMap::from([(DEVICES_NAMESPACE.to_string(), chip.runner.export())])
                } else {
                    BTreeMap::new()
                };

                let snapshot = ChipSnapshot {
                    id: chip.id.clone(),
                    name: chip.name.clone(),
                    created: chip.created,
                    running: chip.running(),
                    master: chip.master.as_ref().map(MasterHandle::export),
                    runners,
                };

                (chip.id.clone(), snapshot)
            })
            .collect();

        let mut executors = BTreeMap::new();

        if self.registry.is_enabled(DEVICES_NAMESPACE) {
            executors.insert(DEVICES_NAMESPACE.to_string(), self.executor.export());
        }

        HostSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            time: Utc::now(),
            chips,
            devices: self.tree.snapshot(),
            executors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::value::NodeValue;

    fn settings() -> Settings {
        Settings::from_toml_str(
            r#"
            [host]
            id = "bench"
            name = "Bench"

            [[devices]]
            id = "pump"

            [[devices.nodes]]
            id = "speed"
            kind = "writable"
            initial = 0.0

            [[devices.nodes]]
            id = "temp"
            kind = "readable"
            initial = 21.5
            "#,
        )
        .unwrap()
    }

    async fn host() -> Host {
        let host = Host::new(settings());
        host.start().await;
        host
    }

    #[tokio::test]
    async fn test_compile_draft_request() {
        let mut host = host().await;

        let response = host
            .process(HostRequest::CompileDraft {
                source: "devices:\n  pump.temp: 1\nwait: 1\n".to_string(),
            })
            .await
            .unwrap();

        let HostResponse::Draft { draft } = response else {
            panic!("unexpected response {response:?}");
        };

        assert_eq!(draft["valid"], false);
        assert_eq!(draft["diagnostics"][0]["message"], "Node 'pump.temp' is not writable");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_protocol_on_chip() {
        let mut host = host().await;
        let chip_id = host.create_chip(Some("Chip A".to_string()));

        host.start_plan(&chip_id, "devices:\n  pump.speed: 4\nwait: 10\n", None)
            .await
            .unwrap();

        // Wait for the state to be written through the node worker.
        for _ in 0..20 {
            if host.snapshot().devices["pump.speed"].value == Some(NodeValue::Number(4.0)) {
                break;
            }
            tokio::task::yield_now().await;
        }

        let snapshot = host.snapshot();
        assert_eq!(snapshot.id, "bench");
        assert!(snapshot.chips[&chip_id].running);
        assert_eq!(snapshot.devices["pump.speed"].value, Some(NodeValue::Number(4.0)));
        assert!(snapshot.devices["pump.speed"].owner.as_ref().unwrap().is_automated());

        let again = host.start_plan(&chip_id, "wait: 1\n", None).await;
        assert!(matches!(again, Err(EngineError::ChipRunning(_))));

        let master = host.chip(&chip_id).unwrap().master().unwrap().clone();
        master.wait_done().await;

        assert!(!host.chip(&chip_id).unwrap().running());
        host.delete_chip(&chip_id).unwrap();
        assert!(matches!(host.chip(&chip_id), Err(EngineError::ChipNotFound(_))));
    }

    #[tokio::test]
    async fn test_invalid_plan_rejected() {
        let mut host = host().await;
        let chip_id = host.create_chip(None);

        let result = host.start_plan(&chip_id, "frobnicate: 1\n", None).await;
        assert!(matches!(result, Err(EngineError::InvalidProtocol(message)) if message.contains("frobnicate")));

        let result = host
            .process(HostRequest::Pause { chip_id })
            .await;
        assert!(matches!(result, Err(EngineError::ChipIdle(_))));
    }

    #[tokio::test]
    async fn test_instruct_devices() {
        let mut host = host().await;

        let request: HostRequest = serde_json::from_value(serde_json::json!({
            "type": "instruct",
            "namespace": "devices",
            "agent": "alice",
            "instruction": { "type": "write", "nodePath": ["pump", "speed"], "value": 7.0 },
        }))
        .unwrap();

        host.process(request).await.unwrap();

        let snapshot = host.snapshot();
        assert_eq!(snapshot.devices["pump.speed"].value, Some(NodeValue::Number(7.0)));
        assert_eq!(snapshot.executors["devices"]["claims"][0]["agent"], "alice");

        let result = host
            .process(HostRequest::Command {
                chip_id: "any".to_string(),
                namespace: "devices".to_string(),
                command: serde_json::Value::Null,
            })
            .await;
        assert!(matches!(result, Err(EngineError::Unsupported(_))));
    }

    #[test]
    fn test_registry_honours_settings() {
        let mut settings = Settings::default();
        assert!(UnitRegistry::from_settings(&settings).is_enabled(DEVICES_NAMESPACE));

        settings.units.insert(
            DEVICES_NAMESPACE.to_string(),
            crate::config::UnitConfig {
                enabled: false,
                options: BTreeMap::new(),
            },
        );
        assert!(UnitRegistry::from_settings(&settings).namespaces().is_empty());
    }
}
