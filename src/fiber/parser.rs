//! Protocol parser: YAML source to a block tree.
//!
//! A protocol document looks like:
//!
//! ```yaml
//! name: Flush
//! shorthands:
//!   soak:
//!     _priority: 1
//!     devices:
//!       pump.speed: "{{ arg }}"
//! actions:
//!   - wait: 5
//!   - soak: 2.5
//!     repeat: 3
//!     wait: "{{ index * 2 }}"
//! ```
//!
//! Every block mapping is first parsed into a [`Layer`]: an optional lead (the
//! block's own action, from `actions` or `wait`) plus the passive attributes
//! that wrap it. Layers are assembled inside out:
//!
//! ```text
//! lead ─▶ repeat ─▶ devices ─▶ shorthand calls (higher _priority outermost)
//! ```
//!
//! Shorthand definitions are prepared lazily the first time they are called and
//! cached; a definition reached again while it is being prepared is a circular
//! reference.

use serde::Serialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::blocks::{RepeatBlock, SequenceBlock, ShorthandBlock, StatePublisherBlock, TimerBlock};
use super::diagnostic::Diagnostic;
use super::eval::{expression_source, EvalSymbol, Evaluable, ExpressionEngine};
use super::program::Block;
use crate::devices::tree::{parse_path, path_key, DeviceTree, NodePath};

const PRIORITY_KEY: &str = "_priority";

/// A parsed, runnable protocol.
#[derive(Debug, Clone)]
pub struct Protocol {
    /// Protocol name
    pub name: Option<String>,
    /// Root block
    pub root: Arc<dyn Block>,
}

impl Protocol {
    /// JSON description for clients.
    pub fn export(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "root": self.root.export(),
            "duration": self.root.duration(),
        })
    }
}

/// Result of compiling a protocol source.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    /// Errors and warnings
    pub diagnostics: Vec<Diagnostic>,
    /// The protocol, unless its root block could not be built
    pub protocol: Option<Protocol>,
}

impl Draft {
    /// Whether any error was reported.
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error)
    }

    /// The protocol, if it was built without errors.
    pub fn valid_protocol(&self) -> Option<&Protocol> {
        if self.has_errors() {
            None
        } else {
            self.protocol.as_ref()
        }
    }

    /// JSON description for clients.
    pub fn export(&self) -> serde_json::Value {
        #[derive(Serialize)]
        struct Export<'a> {
            diagnostics: &'a [Diagnostic],
            protocol: Option<serde_json::Value>,
            valid: bool,
        }

        serde_json::to_value(Export {
            diagnostics: &self.diagnostics,
            protocol: self.protocol.as_ref().map(Protocol::export),
            valid: !self.has_errors(),
        })
        .unwrap_or(serde_json::Value::Null)
    }
}

/// Parse `source` with a parser that does not check node paths.
pub fn parse(source: &str, engine: &ExpressionEngine) -> Draft {
    ProtocolParser::new(engine).parse(source)
}

#[derive(Debug)]
struct ShorthandCall {
    name: String,
    symbol: EvalSymbol,
    argument: Evaluable,
    priority: i64,
    layer: Arc<Layer>,
}

#[derive(Debug, Default)]
struct Layer {
    lead: Option<Arc<dyn Block>>,
    repeat: Option<Evaluable>,
    devices: Vec<(NodePath, Evaluable)>,
    calls: Vec<ShorthandCall>,
    lead_count: usize,
    valid: bool,
}

impl Layer {
    fn has_lead(&self) -> bool {
        self.lead.is_some() || self.calls.iter().any(|call| call.layer.has_lead())
    }

    fn is_empty(&self) -> bool {
        self.lead.is_none() && self.repeat.is_none() && self.devices.is_empty() && self.calls.is_empty()
    }
}

#[derive(Debug)]
enum ShorthandState {
    Unparsed,
    Preparing,
    Ready(Arc<Layer>),
    Failed,
}

#[derive(Debug)]
struct Shorthand {
    body: Mapping,
    priority: i64,
    symbol: EvalSymbol,
    state: ShorthandState,
}

/// Protocol parser.
pub struct ProtocolParser<'a> {
    engine: &'a ExpressionEngine,
    devices: Option<&'a DeviceTree>,
    shorthands: BTreeMap<String, Shorthand>,
    diagnostics: Vec<Diagnostic>,
    /// Shorthand whose body is being parsed.
    owner: Option<EvalSymbol>,
}

impl<'a> ProtocolParser<'a> {
    /// Create a parser compiling expressions with `engine`.
    pub fn new(engine: &'a ExpressionEngine) -> Self {
        Self {
            engine,
            devices: None,
            shorthands: BTreeMap::new(),
            diagnostics: Vec::new(),
            owner: None,
        }
    }

    /// Check `devices` attributes against `tree`.
    pub fn with_devices(mut self, tree: &'a DeviceTree) -> Self {
        self.devices = Some(tree);
        self
    }

    /// Parse a protocol document.
    pub fn parse(mut self, source: &str) -> Draft {
        let document: Value = match serde_yaml::from_str(source) {
            Ok(document) => document,
            Err(err) => {
                return Draft {
                    diagnostics: vec![Diagnostic::error(format!("Invalid YAML: {err}"))],
                    protocol: None,
                };
            }
        };

        let Value::Mapping(mut root) = document else {
            return Draft {
                diagnostics: vec![Diagnostic::error("Protocol must be a mapping")],
                protocol: None,
            };
        };

        let name = match root.remove("name") {
            None => None,
            Some(Value::String(name)) => Some(name),
            Some(_) => {
                self.error("Protocol name must be a string", &["name".to_string()]);
                None
            }
        };

        if let Some(shorthands) = root.remove("shorthands") {
            self.declare_shorthands(shorthands);
        }

        let layer = self.parse_layer(&root, &[]);
        let root_block = self.assemble(layer, &[]);

        self.report_unused_shorthands();

        debug!(
            name = ?name,
            diagnostics = self.diagnostics.len(),
            "Protocol parsed"
        );

        Draft {
            diagnostics: self.diagnostics,
            protocol: root_block.map(|root| Protocol { name, root }),
        }
    }

    fn error(&mut self, message: impl Into<String>, path: &[String]) {
        self.diagnostics.push(Diagnostic::error(message).at(path));
    }

    fn declare_shorthands(&mut self, shorthands: Value) {
        let path = ["shorthands".to_string()];

        let Value::Mapping(shorthands) = shorthands else {
            self.error("Shorthands must be a mapping", &path);
            return;
        };

        for (name, body) in shorthands {
            let Some(name) = name.as_str().map(str::to_string) else {
                self.error("Shorthand names must be strings", &path);
                continue;
            };

            let body_path = [path[0].clone(), name.clone()];

            let Value::Mapping(mut body) = body else {
                self.error(format!("Shorthand '{name}' must be a mapping"), &body_path);
                continue;
            };

            let priority = match body.remove(PRIORITY_KEY) {
                None => 0,
                Some(value) => match value.as_i64() {
                    Some(priority) => priority,
                    None => {
                        let mut priority_path = body_path.to_vec();
                        priority_path.push(PRIORITY_KEY.to_string());
                        self.error("Shorthand priority must be an integer", &priority_path);
                        0
                    }
                },
            };

            self.shorthands.insert(
                name,
                Shorthand {
                    body,
                    priority,
                    symbol: EvalSymbol::new(),
                    state: ShorthandState::Unparsed,
                },
            );
        }
    }

    fn prepare_shorthand(&mut self, name: &str, call_path: &[String]) -> Option<(Arc<Layer>, i64, EvalSymbol)> {
        let shorthand = self.shorthands.get_mut(name)?;
        let priority = shorthand.priority;
        let symbol = shorthand.symbol;

        match &shorthand.state {
            ShorthandState::Ready(layer) => return Some((layer.clone(), priority, symbol)),
            ShorthandState::Failed => return None,
            ShorthandState::Preparing => {
                self.error(format!("Invalid circular reference to shorthand '{name}'"), call_path);
                return None;
            }
            ShorthandState::Unparsed => {}
        }

        shorthand.state = ShorthandState::Preparing;
        let body = shorthand.body.clone();

        let caller = self.owner.replace(symbol);
        let layer = self.parse_layer(&body, &["shorthands".to_string(), name.to_string()]);
        self.owner = caller;

        if layer.valid {
            let layer = Arc::new(layer);
            self.set_state(name, ShorthandState::Ready(layer.clone()));
            Some((layer, priority, symbol))
        } else {
            self.set_state(name, ShorthandState::Failed);
            None
        }
    }

    fn set_state(&mut self, name: &str, state: ShorthandState) {
        if let Some(shorthand) = self.shorthands.get_mut(name) {
            shorthand.state = state;
        }
    }

    fn report_unused_shorthands(&mut self) {
        let unused: Vec<String> = self
            .shorthands
            .iter()
            .filter(|(_, shorthand)| matches!(shorthand.state, ShorthandState::Unparsed))
            .map(|(name, _)| name.clone())
            .collect();

        for name in unused {
            let path = ["shorthands".to_string(), name.clone()];
            self.diagnostics
                .push(Diagnostic::warning(format!("Unused shorthand '{name}'")).at(&path));

            // Still prepared so errors in its body are reported.
            self.prepare_shorthand(&name, &path);
        }
    }

    fn parse_layer(&mut self, attributes: &Mapping, path: &[String]) -> Layer {
        let mut layer = Layer {
            valid: true,
            ..Layer::default()
        };

        for (key, value) in attributes {
            let Some(key) = key.as_str() else {
                self.error("Attribute names must be strings", path);
                layer.valid = false;
                continue;
            };

            let mut attribute_path = path.to_vec();
            attribute_path.push(key.to_string());

            let parsed = match key {
                "actions" => self.parse_actions(value, &attribute_path).map(|block| {
                    set_lead(&mut layer, block);
                }),
                "wait" => self.parse_wait(value, &attribute_path).map(|block| {
                    set_lead(&mut layer, block);
                }),
                "repeat" => self.evaluable(value, &attribute_path).map(|count| {
                    layer.repeat = Some(count);
                }),
                "devices" => self.parse_devices(value, &attribute_path).map(|devices| {
                    layer.devices = devices;
                }),
                PRIORITY_KEY | "name" | "shorthands" => {
                    self.error(format!("Attribute '{key}' is not allowed here"), &attribute_path);
                    None
                }
                name if self.shorthands.contains_key(name) => self
                    .parse_call(name, value, &attribute_path)
                    .map(|call| layer.calls.push(call)),
                _ => {
                    self.error(format!("Unknown attribute '{key}'"), &attribute_path);
                    None
                }
            };

            if parsed.is_none() {
                layer.valid = false;
            }
        }

        let leads = layer.lead_count
            + layer.calls.iter().filter(|call| call.layer.has_lead()).count();

        if leads > 1 {
            self.error("A block can have only one action", path);
            layer.valid = false;
        }

        layer
    }

    fn parse_call(&mut self, name: &str, value: &Value, path: &[String]) -> Option<ShorthandCall> {
        let argument = self.evaluable(value, path)?;
        let (layer, priority, symbol) = self.prepare_shorthand(name, path)?;

        Some(ShorthandCall {
            name: name.to_string(),
            symbol,
            argument,
            priority,
            layer,
        })
    }

    fn parse_actions(&mut self, value: &Value, path: &[String]) -> Option<Arc<dyn Block>> {
        let Value::Sequence(items) = value else {
            self.error("Actions must be a list", path);
            return None;
        };

        let mut children = Vec::with_capacity(items.len());

        for (index, item) in items.iter().enumerate() {
            let mut item_path = path.to_vec();
            item_path.push(index.to_string());

            let Value::Mapping(attributes) = item else {
                self.error("Actions must be mappings", &item_path);
                continue;
            };

            let layer = self.parse_layer(attributes, &item_path);

            if let Some(block) = self.assemble(layer, &item_path) {
                children.push(block);
            }
        }

        Some(Arc::new(SequenceBlock::new(children)))
    }

    fn parse_wait(&mut self, value: &Value, path: &[String]) -> Option<Arc<dyn Block>> {
        let seconds = match value {
            Value::String(text) if expression_source(text).is_none() => {
                match parse_duration_text(text) {
                    Some(seconds) => Evaluable::Constant(rhai::Dynamic::from_float(seconds)),
                    None => {
                        self.error(format!("Invalid duration '{text}'"), path);
                        return None;
                    }
                }
            }
            Value::Number(number) if number.as_f64().is_some_and(|seconds| seconds < 0.0) => {
                self.error("Duration must not be negative", path);
                return None;
            }
            _ => self.evaluable(value, path)?,
        };

        Some(Arc::new(TimerBlock::new(seconds)))
    }

    fn parse_devices(&mut self, value: &Value, path: &[String]) -> Option<Vec<(NodePath, Evaluable)>> {
        fn flatten(value: &Value, prefix: &mut NodePath, out: &mut Vec<(NodePath, Value)>) -> bool {
            let Value::Mapping(mapping) = value else {
                out.push((prefix.clone(), value.clone()));
                return true;
            };

            for (key, child) in mapping {
                let Some(key) = key.as_str() else {
                    return false;
                };

                let segments = parse_path(key);
                let depth = segments.len();
                prefix.extend(segments);
                let valid = flatten(child, prefix, out);
                prefix.truncate(prefix.len() - depth);

                if !valid {
                    return false;
                }
            }

            true
        }

        if !matches!(value, Value::Mapping(_)) {
            self.error("Devices must be a mapping of node paths to values", path);
            return None;
        }

        let mut entries = Vec::new();

        if !flatten(value, &mut Vec::new(), &mut entries) {
            self.error("Node paths must be strings", path);
            return None;
        }

        let mut assignments = Vec::with_capacity(entries.len());
        let mut valid = true;

        for (node_path, value) in entries {
            let mut entry_path = path.to_vec();
            entry_path.push(path_key(&node_path));

            if let Some(tree) = self.devices {
                match tree.find(&node_path) {
                    Some(node) if node.is_writable() => {}
                    Some(_) => {
                        self.error(format!("Node '{}' is not writable", path_key(&node_path)), &entry_path);
                        valid = false;
                        continue;
                    }
                    None => {
                        self.error(format!("Unknown node '{}'", path_key(&node_path)), &entry_path);
                        valid = false;
                        continue;
                    }
                }
            }

            match self.evaluable(&value, &entry_path) {
                Some(value) => assignments.push((node_path, value)),
                None => valid = false,
            }
        }

        valid.then_some(assignments)
    }

    fn evaluable(&mut self, value: &Value, path: &[String]) -> Option<Evaluable> {
        match Evaluable::from_yaml(value, self.engine, self.owner) {
            Ok(value) => Some(value),
            Err(message) => {
                self.error(message, path);
                None
            }
        }
    }

    /// Turn a block layer into a block, reporting why it cannot be.
    fn assemble(&mut self, layer: Layer, path: &[String]) -> Option<Arc<dyn Block>> {
        if !layer.valid {
            return None;
        }

        if layer.is_empty() {
            self.error("Empty block", path);
            return None;
        }

        if !layer.has_lead() {
            self.error("Block has no action", path);
            return None;
        }

        Some(build(&layer, None))
    }
}

fn set_lead(layer: &mut Layer, block: Arc<dyn Block>) {
    layer.lead_count += 1;
    layer.lead = Some(block);
}

/// Build the block of `layer`, wrapping `inner` when the layer has no lead.
fn build(layer: &Layer, inner: Option<Arc<dyn Block>>) -> Arc<dyn Block> {
    let lead_call = layer.calls.iter().find(|call| call.layer.has_lead());

    let mut block: Arc<dyn Block> = match (&layer.lead, lead_call, inner) {
        (Some(lead), _, _) => lead.clone(),
        (None, Some(call), _) => Arc::new(ShorthandBlock::new(
            call.name.clone(),
            call.symbol,
            call.argument.clone(),
            build(&call.layer, None),
        )),
        (None, None, Some(inner)) => inner,
        (None, None, None) => Arc::new(SequenceBlock::new(Vec::new())),
    };

    if let Some(count) = &layer.repeat {
        block = Arc::new(RepeatBlock::new(count.clone(), block));
    }

    if !layer.devices.is_empty() {
        block = Arc::new(StatePublisherBlock::new(layer.devices.clone(), block));
    }

    let mut passive: Vec<&ShorthandCall> = layer
        .calls
        .iter()
        .filter(|call| !call.layer.has_lead())
        .collect();

    passive.sort_by_key(|call| std::cmp::Reverse(call.priority));

    for call in passive.into_iter().rev() {
        block = Arc::new(ShorthandBlock::new(
            call.name.clone(),
            call.symbol,
            call.argument.clone(),
            build(&call.layer, Some(block)),
        ));
    }

    block
}

/// Seconds in a duration such as `90`, `1.5 s`, `250ms`, `2 min` or `1h`.
fn parse_duration_text(text: &str) -> Option<f64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().ok()?;

    let factor = match unit.trim() {
        "" | "s" | "sec" => 1.0,
        "ms" => 0.001,
        "min" => 60.0,
        "h" => 3600.0,
        _ => return None,
    };

    Some(number * factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::diagnostic::DiagnosticKind;

    fn compile(source: &str) -> Draft {
        parse(source, &ExpressionEngine::new(10_000))
    }

    fn messages(draft: &Draft) -> Vec<String> {
        draft.diagnostics.iter().map(|d| d.message.clone()).collect()
    }

    #[test]
    fn test_sequence_duration() {
        let draft = compile(
            r#"
name: Simple
actions:
  - wait: 5
  - wait: 2 min
  - wait: 500ms
"#,
        );

        assert!(draft.diagnostics.is_empty(), "{:?}", draft.diagnostics);

        let protocol = draft.protocol.unwrap();
        assert_eq!(protocol.name.as_deref(), Some("Simple"));

        let exported = protocol.export();
        assert_eq!(exported["root"]["namespace"], "sequence");
        assert_eq!(exported["duration"]["seconds"], 125.5);
    }

    #[test]
    fn test_wrapping_order() {
        let draft = compile(
            r#"
shorthands:
  low:
    devices:
      pump.speed: "{{ arg }}"
  high:
    _priority: 5
    devices:
      pump.valve: true
actions:
  - wait: 1
    repeat: 2
    devices:
      pump.speed: 1
    low: 3
    high: null
"#,
        );

        assert!(!draft.has_errors(), "{:?}", draft.diagnostics);

        let root = draft.protocol.unwrap().export();
        let action = &root["root"]["children"][0];

        assert_eq!(action["namespace"], "shorthands");
        assert_eq!(action["name"], "high");

        let low = &action["child"]["child"];
        assert_eq!(low["name"], "low");
        assert_eq!(low["argument"], 3.0);

        let state = &low["child"]["child"];
        assert_eq!(state["namespace"], "devices");
        assert_eq!(state["child"]["namespace"], "repeat");
        assert_eq!(state["child"]["child"]["namespace"], "timer");
    }

    #[test]
    fn test_lead_shorthand() {
        let draft = compile(
            r#"
shorthands:
  soak:
    wait: "{{ arg * 60 }}"
actions:
  - soak: 2
"#,
        );

        assert!(draft.diagnostics.is_empty(), "{:?}", draft.diagnostics);

        let root = draft.protocol.unwrap().export();
        let call = &root["root"]["children"][0];
        assert_eq!(call["name"], "soak");
        assert_eq!(call["child"]["namespace"], "timer");
    }

    #[test]
    fn test_circular_reference() {
        let draft = compile(
            r#"
shorthands:
  a:
    b: 1
  b:
    a: 1
actions:
  - wait: 1
    a: 0
"#,
        );

        assert!(draft.has_errors());
        assert!(messages(&draft)
            .iter()
            .any(|message| message.contains("circular reference")));
        assert!(draft.valid_protocol().is_none());
    }

    #[test]
    fn test_self_reference() {
        let draft = compile(
            r#"
shorthands:
  loop:
    loop: 1
wait: 1
loop: 1
"#,
        );

        let circular = messages(&draft)
            .iter()
            .filter(|message| message.contains("circular reference"))
            .count();
        assert_eq!(circular, 1);
    }

    #[test]
    fn test_unused_shorthand_warning() {
        let draft = compile(
            r#"
shorthands:
  spare:
    wait: "{{ 1 + }}"
wait: 1
"#,
        );

        assert!(draft.protocol.is_some());

        let kinds: Vec<DiagnosticKind> = draft.diagnostics.iter().map(|d| d.kind).collect();
        assert!(kinds.contains(&DiagnosticKind::Warning));
        assert!(kinds.contains(&DiagnosticKind::Error));
        assert_eq!(draft.diagnostics[0].message, "Unused shorthand 'spare'");
    }

    #[test]
    fn test_invalid_action_is_skipped() {
        let draft = compile(
            r#"
actions:
  - wait: 1
  - frobnicate: 2
  - wait: -1
  - devices:
      pump.speed: 2
"#,
        );

        let messages = messages(&draft);
        assert!(messages.contains(&"Unknown attribute 'frobnicate'".to_string()));
        assert!(messages.contains(&"Duration must not be negative".to_string()));
        assert!(messages.contains(&"Block has no action".to_string()));
        assert_eq!(draft.diagnostics[0].path, vec!["actions", "1", "frobnicate"]);

        let root = draft.protocol.unwrap().export();
        assert_eq!(root["root"]["children"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_two_actions_rejected() {
        let draft = compile("wait: 1\nactions: []\n");

        assert!(messages(&draft).contains(&"A block can have only one action".to_string()));
        assert!(draft.protocol.is_none());
    }

    #[test]
    fn test_invalid_documents() {
        assert!(compile("actions: [").has_errors());
        assert!(compile("- wait: 1").has_errors());
        assert_eq!(messages(&compile("{}")), vec!["Empty block".to_string()]);
    }

    #[test]
    fn test_node_paths_checked_against_tree() {
        use crate::devices::node::Node;
        use crate::devices::simulated::SimulatedDriver;
        use crate::devices::value::NodeValue;

        let speed = Arc::new(Node::writable("speed", SimulatedDriver::new(NodeValue::Number(0.0))));
        let temp = Arc::new(Node::readable("temp", SimulatedDriver::new(NodeValue::Number(0.0))));
        let tree = DeviceTree::new(vec![Arc::new(Node::collection("pump", vec![speed, temp]))]);
        let engine = ExpressionEngine::new(10_000);

        let draft = ProtocolParser::new(&engine).with_devices(&tree).parse(
            r#"
wait: 1
devices:
  pump:
    speed: 1
    temp: 2
  mixer.speed: 3
"#,
        );

        let messages = messages(&draft);
        assert_eq!(
            messages,
            vec![
                "Node 'pump.temp' is not writable".to_string(),
                "Unknown node 'mixer.speed'".to_string(),
            ]
        );
    }

    #[test]
    fn test_duration_text() {
        assert_eq!(parse_duration_text("90"), Some(90.0));
        assert_eq!(parse_duration_text("1.5 s"), Some(1.5));
        assert_eq!(parse_duration_text("250ms"), Some(0.25));
        assert_eq!(parse_duration_text("1h"), Some(3600.0));
        assert_eq!(parse_duration_text("soon"), None);
    }
}
