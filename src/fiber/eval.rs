//! Expression evaluation environments.
//!
//! Blocks that introduce variables (a shorthand's `arg`, a repeat's `index`)
//! mint an [`EvalSymbol`] and push an [`EvalEnv`] under it onto the
//! [`EvalStack`] they pass to their child. Expressions see every binding on the
//! stack, innermost last, so nested blocks shadow their ancestors.
//!
//! `arg` is the exception: an expression written inside a shorthand body is
//! compiled with that shorthand's symbol and reads `arg` from its frame only,
//! whatever other shorthands wrap it at run time.
//!
//! Expressions are written `{{ ... }}` in protocol sources and compiled with
//! rhai. Evaluation runs with an operation budget so a protocol cannot stall the
//! engine.

use rhai::{Dynamic, Engine, Scope, AST};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::devices::node::Node;
use crate::devices::tree::DeviceTree;
use crate::devices::value::NodeValue;

static NEXT_EVAL_SYMBOL: AtomicU64 = AtomicU64::new(1);

/// Name under which a shorthand binds its argument.
pub const ARG: &str = "arg";

/// Identifies the block instance that introduced a set of bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EvalSymbol(u64);

impl EvalSymbol {
    /// Mint a fresh symbol.
    pub fn new() -> Self {
        Self(NEXT_EVAL_SYMBOL.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for EvalSymbol {
    fn default() -> Self {
        Self::new()
    }
}

/// Variable bindings introduced by one block.
pub type EvalEnv = BTreeMap<String, Dynamic>;

/// Scoped bindings threaded down the program tree.
#[derive(Debug, Clone, Default)]
pub struct EvalStack {
    frames: Arc<Vec<(EvalSymbol, EvalEnv)>>,
}

impl EvalStack {
    /// Empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new stack with `env` pushed under `symbol`. Re-pushing a symbol
    /// replaces its previous bindings.
    pub fn with(&self, symbol: EvalSymbol, env: EvalEnv) -> Self {
        let mut frames: Vec<(EvalSymbol, EvalEnv)> = self
            .frames
            .iter()
            .filter(|(existing, _)| *existing != symbol)
            .cloned()
            .collect();

        frames.push((symbol, env));

        Self {
            frames: Arc::new(frames),
        }
    }

    /// Bindings pushed under `symbol`.
    pub fn get(&self, symbol: EvalSymbol) -> Option<&EvalEnv> {
        self.frames
            .iter()
            .find(|(existing, _)| *existing == symbol)
            .map(|(_, env)| env)
    }

    fn push_into(&self, scope: &mut Scope<'static>, owner: Option<EvalSymbol>) {
        for (_, env) in self.frames.iter() {
            for (name, value) in env.iter().filter(|(name, _)| name.as_str() != ARG) {
                scope.push_constant_dynamic(name.clone(), value.clone());
            }
        }

        let argument = owner
            .and_then(|symbol| self.get(symbol))
            .and_then(|env| env.get(ARG));

        if let Some(value) = argument {
            scope.push_constant_dynamic(ARG, value.clone());
        }
    }
}

/// A compiled `{{ ... }}` expression.
#[derive(Clone)]
pub struct Expression {
    source: String,
    ast: Arc<AST>,
    owner: Option<EvalSymbol>,
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expression({:?})", self.source)
    }
}

impl Expression {
    /// Expression source, without the braces.
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// A protocol attribute value: a constant, or an expression evaluated at run time.
#[derive(Debug, Clone)]
pub enum Evaluable {
    /// Literal value
    Constant(Dynamic),
    /// Deferred expression
    Expression(Expression),
}

impl Evaluable {
    /// Build from a YAML attribute, compiling `{{ ... }}` strings. `owner` is
    /// the shorthand whose body contains the attribute, if any.
    pub fn from_yaml(
        value: &serde_yaml::Value,
        engine: &ExpressionEngine,
        owner: Option<EvalSymbol>,
    ) -> Result<Self, String> {
        if let serde_yaml::Value::String(text) = value {
            if let Some(source) = expression_source(text) {
                return engine.compile_in(source, owner).map(Evaluable::Expression);
            }
        }

        Ok(Evaluable::Constant(yaml_to_dynamic(value)))
    }

    /// Evaluate against `stack`.
    pub fn evaluate(&self, engine: &ExpressionEngine, stack: &EvalStack) -> Result<Dynamic, String> {
        match self {
            Evaluable::Constant(value) => Ok(value.clone()),
            Evaluable::Expression(expression) => engine.eval(expression, stack),
        }
    }

    /// Constant value, if known before running.
    pub fn constant(&self) -> Option<&Dynamic> {
        match self {
            Evaluable::Constant(value) => Some(value),
            Evaluable::Expression(_) => None,
        }
    }

    /// JSON representation for block exports.
    pub fn export(&self) -> serde_json::Value {
        match self {
            Evaluable::Constant(value) => dynamic_to_json(value),
            Evaluable::Expression(expression) => {
                serde_json::json!({ "expression": expression.source })
            }
        }
    }
}

/// Source of a `{{ ... }}` expression string.
pub fn expression_source(text: &str) -> Option<&str> {
    text.trim()
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
}

/// rhai engine configured for protocol expressions.
pub struct ExpressionEngine {
    engine: Engine,
    devices: Option<DeviceTree>,
}

impl fmt::Debug for ExpressionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpressionEngine")
            .field("devices", &self.devices.is_some())
            .finish()
    }
}

impl ExpressionEngine {
    /// Create an engine aborting evaluations after `max_operations` operations.
    pub fn new(max_operations: u64) -> Self {
        let mut engine = Engine::new();

        engine.on_progress(move |count| {
            if count > max_operations {
                Some(format!("Safety limit exceeded: maximum {max_operations} operations").into())
            } else {
                None
            }
        });

        engine.register_fn("random", rand::random::<f64>);

        Self {
            engine,
            devices: None,
        }
    }

    /// Expose node values of `tree` to expressions as `devices`.
    pub fn with_devices(mut self, tree: DeviceTree) -> Self {
        self.devices = Some(tree);
        self
    }

    /// Compile an expression written outside any shorthand body.
    pub fn compile(&self, source: &str) -> Result<Expression, String> {
        self.compile_in(source, None)
    }

    /// Compile an expression written in the body of shorthand `owner`.
    pub fn compile_in(&self, source: &str, owner: Option<EvalSymbol>) -> Result<Expression, String> {
        let ast = self
            .engine
            .compile_expression(source)
            .map_err(|err| format!("Invalid expression '{source}': {err}"))?;

        Ok(Expression {
            source: source.to_string(),
            ast: Arc::new(ast),
            owner,
        })
    }

    /// Evaluate a compiled expression.
    pub fn eval(&self, expression: &Expression, stack: &EvalStack) -> Result<Dynamic, String> {
        let mut scope = Scope::new();

        if let Some(tree) = &self.devices {
            scope.push_constant_dynamic("devices", devices_map(tree));
        }

        stack.push_into(&mut scope, expression.owner);

        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &expression.ast)
            .map_err(|err| format!("Failed to evaluate '{}': {err}", expression.source))
    }
}

fn devices_map(tree: &DeviceTree) -> Dynamic {
    fn node_dynamic(node: &Node) -> Dynamic {
        if node.children().is_empty() {
            return node.value().map_or(Dynamic::UNIT, |value| value.to_dynamic());
        }

        let map: rhai::Map = node
            .children()
            .iter()
            .map(|child| (child.id().into(), node_dynamic(child)))
            .collect();

        Dynamic::from_map(map)
    }

    let map: rhai::Map = tree
        .devices()
        .iter()
        .map(|device| (device.id().into(), node_dynamic(device)))
        .collect();

    Dynamic::from_map(map)
}

/// Convert a YAML value to a rhai value.
pub fn yaml_to_dynamic(value: &serde_yaml::Value) -> Dynamic {
    match value {
        serde_yaml::Value::Null => Dynamic::UNIT,
        serde_yaml::Value::Bool(flag) => Dynamic::from_bool(*flag),
        serde_yaml::Value::Number(number) => match number.as_i64() {
            Some(int) => Dynamic::from_int(int),
            None => Dynamic::from_float(number.as_f64().unwrap_or(f64::NAN)),
        },
        serde_yaml::Value::String(text) => Dynamic::from(text.clone()),
        serde_yaml::Value::Sequence(items) => {
            Dynamic::from_array(items.iter().map(yaml_to_dynamic).collect())
        }
        serde_yaml::Value::Mapping(mapping) => {
            let map: rhai::Map = mapping
                .iter()
                .filter_map(|(key, value)| {
                    key.as_str().map(|key| (key.into(), yaml_to_dynamic(value)))
                })
                .collect();

            Dynamic::from_map(map)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_dynamic(&tagged.value),
    }
}

/// Convert a rhai value to JSON. Unsupported values export as `null`.
pub fn dynamic_to_json(value: &Dynamic) -> serde_json::Value {
    if let Some(node_value) = NodeValue::from_dynamic(value) {
        return serde_json::to_value(node_value).unwrap_or(serde_json::Value::Null);
    }

    if value.is_array() {
        let items = value.clone().into_array().unwrap_or_default();
        return serde_json::Value::Array(items.iter().map(dynamic_to_json).collect());
    }

    if value.is_map() {
        if let Some(map) = value.read_lock::<rhai::Map>() {
            return serde_json::Value::Object(
                map.iter()
                    .map(|(key, value)| (key.to_string(), dynamic_to_json(value)))
                    .collect(),
            );
        }
    }

    serde_json::Value::Null
}

/// Numeric view of a rhai value.
pub fn dynamic_as_f64(value: &Dynamic) -> Option<f64> {
    value
        .as_float()
        .ok()
        .or_else(|| value.as_int().ok().map(|int| int as f64))
}
