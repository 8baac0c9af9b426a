//! JSON save format for routine trees.
//!
//! Every node is a list whose first element is its kind tag, followed by the
//! raw field text. A loop is `["Loop", allowed, iterations, children...]`
//! where `allowed` is one step tag or a list of them. Saved protocols are
//! `["This is a saved Protocol", nodes...]`.
//!
//! Tags are only ever looked up in a fixed registry; anything that is not a
//! plain alphanumeric word is rejected before the lookup.

use crate::error::{AppResult, KataraError};
use crate::protocol::routine::{Action, Loop};
use crate::protocol::step::{Step, StepKind};
use serde_json::Value;
use std::collections::HashMap;

/// First element of a saved protocol.
pub const PROTOCOL_MARKER: &str = "This is a saved Protocol";
/// First element of a saved button panel.
pub const PANEL_MARKER: &str = "This is a saved Button Panel";

const LOOP_TAG: &str = "Loop";
const MAX_NESTING: usize = 64;

type NodeFactory = Box<dyn Fn(&NodeRegistry, &[Value], usize) -> AppResult<Action> + Send + Sync>;

/// Maps kind tags to node constructors.
pub struct NodeRegistry {
    factories: HashMap<&'static str, NodeFactory>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    /// Registry with every step kind and loops.
    pub fn new() -> Self {
        let mut factories: HashMap<&'static str, NodeFactory> = HashMap::new();
        for kind in StepKind::ALL {
            factories.insert(
                kind.tag(),
                Box::new(move |_: &NodeRegistry, fields: &[Value], _: usize| {
                    decode_step(kind, fields)
                }),
            );
        }
        factories.insert(LOOP_TAG, Box::new(decode_loop));
        Self { factories }
    }

    /// Known tags, sorted.
    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.factories.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    /// Decode one node nested `depth` loops deep.
    pub fn decode_node(&self, value: &Value, depth: usize) -> AppResult<Action> {
        if depth > MAX_NESTING {
            return Err(persistence("The saved protocol is nested too deeply."));
        }
        let items = value
            .as_array()
            .ok_or_else(|| persistence(format!("Expected a saved step, found {value}.")))?;
        let (tag, rest) = items
            .split_first()
            .ok_or_else(|| persistence("Found an empty saved step."))?;
        let tag = tag
            .as_str()
            .ok_or_else(|| persistence(format!("{tag} is not a valid step type.")))?;
        if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(persistence(format!("'{tag}' is not a valid step type.")));
        }
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| persistence(format!("'{tag}' is not a known step type.")))?;
        factory(self, rest, depth)
    }
}

fn persistence(message: impl Into<String>) -> KataraError {
    KataraError::Persistence(message.into())
}

fn field_text(value: &Value) -> AppResult<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(persistence(format!("{other} is not a valid step entry."))),
    }
}

fn decode_step(kind: StepKind, fields: &[Value]) -> AppResult<Action> {
    let fields = fields.iter().map(field_text).collect::<AppResult<Vec<_>>>()?;
    Step::new(kind, fields)
        .map(Action::Step)
        .map_err(KataraError::Persistence)
}

fn decode_step_kind(value: &Value) -> AppResult<StepKind> {
    value
        .as_str()
        .and_then(StepKind::from_tag)
        .ok_or_else(|| persistence(format!("{value} is not a valid step type for a loop.")))
}

fn decode_loop(registry: &NodeRegistry, fields: &[Value], depth: usize) -> AppResult<Action> {
    let [allowed, iterations, children @ ..] = fields else {
        return Err(persistence("A saved loop is missing its step types or iterations."));
    };
    let step_kinds = match allowed {
        Value::Array(items) => items
            .iter()
            .map(decode_step_kind)
            .collect::<AppResult<Vec<_>>>()?,
        single => vec![decode_step_kind(single)?],
    };
    let children = children
        .iter()
        .map(|child| registry.decode_node(child, depth + 1))
        .collect::<AppResult<Vec<_>>>()?;
    Ok(Action::Loop(
        Loop::new(field_text(iterations)?)
            .with_step_kinds(step_kinds)
            .with_children(children),
    ))
}

/// Encode one node.
pub fn encode_node(action: &Action) -> Value {
    match action {
        Action::Step(step) => {
            let mut items = vec![Value::from(step.kind().tag())];
            items.extend(step.fields().iter().map(|f| Value::from(f.as_str())));
            Value::Array(items)
        }
        Action::Loop(lp) => {
            let allowed = match lp.step_kinds() {
                [single] => Value::from(single.tag()),
                kinds => Value::Array(kinds.iter().map(|k| Value::from(k.tag())).collect()),
            };
            let mut items = vec![
                Value::from(LOOP_TAG),
                allowed,
                Value::from(lp.iterations()),
            ];
            items.extend(lp.children().iter().map(encode_node));
            Value::Array(items)
        }
    }
}

/// Encode a sequence of nodes.
pub fn encode_routine(actions: &[Action]) -> Vec<Value> {
    actions.iter().map(encode_node).collect()
}

/// Decode a sequence of nodes.
pub fn decode_routine(values: &[Value]) -> AppResult<Vec<Action>> {
    let registry = NodeRegistry::new();
    values
        .iter()
        .map(|value| registry.decode_node(value, 0))
        .collect()
}

/// Encode a whole protocol file.
pub fn encode_protocol(actions: &[Action]) -> Value {
    let mut items = vec![Value::from(PROTOCOL_MARKER)];
    items.extend(encode_routine(actions));
    Value::Array(items)
}

/// Decode a whole protocol file.
pub fn decode_protocol(value: &Value) -> AppResult<Vec<Action>> {
    match value.as_array().map(Vec::as_slice) {
        Some([marker, nodes @ ..]) if marker.as_str() == Some(PROTOCOL_MARKER) => {
            decode_routine(nodes)
        }
        _ => Err(persistence("This file is not a saved protocol.")),
    }
}
