//! Arena-backed value graphs.
//!
//! The bridge moves arbitrary object graphs, including cyclic ones, between
//! the two peers. [`ValueGraph`] is the in-memory rendition: an append-only
//! arena of [`ValueNode`]s addressed by [`NodeId`], so shared subtrees and
//! cycles are plain indices instead of reference-counted knots.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;
use url::Url;

use crate::error::{Error, Result};

/// Index of a node within its [`ValueGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// One value in the wire algebra.
#[derive(Debug, Clone)]
pub enum ValueNode {
    Null,
    Undefined,
    Bool(bool),
    /// Any numeric value, including `NaN`, `±Infinity`, and `-0`.
    Number(f64),
    String(String),
    /// Arbitrary-precision integer in decimal string form.
    BigInt(String),
    /// Absolute URL.
    Url(Url),
    /// Wall-clock timestamp, carried as ISO-8601 on the wire.
    Date(DateTime<Utc>),
    Regex {
        source: String,
        flags: String,
    },
    Error(ErrorValue),
    Array(Vec<NodeId>),
    Object(Vec<(String, NodeId)>),
    /// Reference to a host-side object in the target vector.
    Handle(u32),
    /// A host-side value with no wire representation (functions, engine
    /// objects). Serialization fails on these unless a fallback is given.
    Opaque(String),
}

/// A typed error with an always-present cause slot.
///
/// The cause points at an [`ValueNode::Undefined`] node when the error has
/// none, so that the sentinel survives the wire round trip.
#[derive(Debug, Clone)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub cause: NodeId,
}

/// Append-only arena of [`ValueNode`]s.
#[derive(Debug, Clone, Default)]
pub struct ValueGraph {
    nodes: Vec<ValueNode>,
}

impl ValueGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a node and returns its id.
    pub fn add(&mut self, node: ValueNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn node(&self, id: NodeId) -> &ValueNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut ValueNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates over every node in the arena.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &ValueNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (NodeId(index), node))
    }

    pub fn null(&mut self) -> NodeId {
        self.add(ValueNode::Null)
    }

    pub fn undefined(&mut self) -> NodeId {
        self.add(ValueNode::Undefined)
    }

    pub fn boolean(&mut self, value: bool) -> NodeId {
        self.add(ValueNode::Bool(value))
    }

    pub fn number(&mut self, value: f64) -> NodeId {
        self.add(ValueNode::Number(value))
    }

    pub fn string(&mut self, value: impl Into<String>) -> NodeId {
        self.add(ValueNode::String(value.into()))
    }

    pub fn bigint(&mut self, decimal: impl Into<String>) -> NodeId {
        self.add(ValueNode::BigInt(decimal.into()))
    }

    pub fn url(&mut self, url: Url) -> NodeId {
        self.add(ValueNode::Url(url))
    }

    pub fn date(&mut self, when: DateTime<Utc>) -> NodeId {
        self.add(ValueNode::Date(when))
    }

    pub fn regex(&mut self, source: impl Into<String>, flags: impl Into<String>) -> NodeId {
        self.add(ValueNode::Regex {
            source: source.into(),
            flags: flags.into(),
        })
    }

    pub fn handle(&mut self, id: u32) -> NodeId {
        self.add(ValueNode::Handle(id))
    }

    pub fn opaque(&mut self, label: impl Into<String>) -> NodeId {
        self.add(ValueNode::Opaque(label.into()))
    }

    /// Builds an error node. A missing `cause` materializes as an
    /// `undefined` node so the slot is always representable.
    pub fn error(
        &mut self,
        name: impl Into<String>,
        message: impl Into<String>,
        stack: Option<String>,
        cause: Option<NodeId>,
    ) -> NodeId {
        let cause = match cause {
            Some(id) => id,
            None => self.undefined(),
        };
        self.add(ValueNode::Error(ErrorValue {
            name: name.into(),
            message: message.into(),
            stack,
            cause,
        }))
    }

    pub fn array(&mut self, elements: Vec<NodeId>) -> NodeId {
        self.add(ValueNode::Array(elements))
    }

    pub fn object(&mut self, properties: Vec<(String, NodeId)>) -> NodeId {
        self.add(ValueNode::Object(properties))
    }

    /// Appends an element to an existing array node. Used to close cycles
    /// after the array id is known.
    pub fn push_element(&mut self, array: NodeId, element: NodeId) -> Result<()> {
        match self.node_mut(array) {
            ValueNode::Array(elements) => {
                elements.push(element);
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "push_element on non-array node: {other:?}"
            ))),
        }
    }

    /// Appends a property to an existing object node.
    pub fn push_property(
        &mut self,
        object: NodeId,
        key: impl Into<String>,
        value: NodeId,
    ) -> Result<()> {
        match self.node_mut(object) {
            ValueNode::Object(properties) => {
                properties.push((key.into(), value));
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "push_property on non-object node: {other:?}"
            ))),
        }
    }

    /// Imports a plain JSON value. Object key order is preserved.
    pub fn from_json(&mut self, value: &JsonValue) -> NodeId {
        match value {
            JsonValue::Null => self.null(),
            JsonValue::Bool(b) => self.boolean(*b),
            JsonValue::Number(n) => self.number(n.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(s) => self.string(s.clone()),
            JsonValue::Array(items) => {
                let arr = self.array(Vec::with_capacity(items.len()));
                for item in items {
                    let child = self.from_json(item);
                    if let ValueNode::Array(elements) = self.node_mut(arr) {
                        elements.push(child);
                    }
                }
                arr
            }
            JsonValue::Object(map) => {
                let obj = self.object(Vec::with_capacity(map.len()));
                for (key, item) in map {
                    let child = self.from_json(item);
                    if let ValueNode::Object(properties) = self.node_mut(obj) {
                        properties.push((key.clone(), child));
                    }
                }
                obj
            }
        }
    }

    /// Projects the graph rooted at `root` to plain JSON.
    ///
    /// The projection follows `JSON.stringify` conventions for platform
    /// values: `undefined` maps to `null`, dates to their ISO form, URLs to
    /// their string form, regular expressions and errors to empty objects.
    /// Cyclic graphs, big integers, handles, and opaque values do not
    /// project.
    pub fn to_json(&self, root: NodeId) -> Result<JsonValue> {
        let mut in_progress = vec![false; self.nodes.len()];
        self.to_json_inner(root, &mut in_progress)
    }

    fn to_json_inner(&self, id: NodeId, in_progress: &mut [bool]) -> Result<JsonValue> {
        if in_progress[id.0] {
            return Err(Error::Unencodable("circular structure".into()));
        }
        match self.node(id) {
            ValueNode::Null | ValueNode::Undefined => Ok(JsonValue::Null),
            ValueNode::Bool(b) => Ok(JsonValue::Bool(*b)),
            ValueNode::Number(n) => Ok(serde_json::Number::from_f64(*n)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null)),
            ValueNode::String(s) => Ok(JsonValue::String(s.clone())),
            ValueNode::BigInt(_) => Err(Error::Unencodable("bigint".into())),
            ValueNode::Url(u) => Ok(JsonValue::String(u.as_str().to_owned())),
            ValueNode::Date(d) => Ok(JsonValue::String(
                d.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            ValueNode::Regex { .. } | ValueNode::Error(_) => {
                Ok(JsonValue::Object(serde_json::Map::new()))
            }
            ValueNode::Array(elements) => {
                in_progress[id.0] = true;
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(self.to_json_inner(*element, in_progress)?);
                }
                in_progress[id.0] = false;
                Ok(JsonValue::Array(out))
            }
            ValueNode::Object(properties) => {
                in_progress[id.0] = true;
                let mut out = serde_json::Map::new();
                for (key, value) in properties {
                    out.insert(key.clone(), self.to_json_inner(*value, in_progress)?);
                }
                in_progress[id.0] = false;
                Ok(JsonValue::Object(out))
            }
            ValueNode::Handle(id) => Err(Error::Unencodable(format!("handle #{id}"))),
            ValueNode::Opaque(label) => Err(Error::Unencodable(label.clone())),
        }
    }

    /// Cycle-aware structural equality between two graph roots.
    pub fn structurally_equal(
        &self,
        root: NodeId,
        other: &ValueGraph,
        other_root: NodeId,
    ) -> bool {
        let mut seen = Vec::new();
        self.eq_inner(root, other, other_root, &mut seen)
    }

    fn eq_inner(
        &self,
        a: NodeId,
        other: &ValueGraph,
        b: NodeId,
        seen: &mut Vec<(NodeId, NodeId)>,
    ) -> bool {
        if seen.contains(&(a, b)) {
            return true;
        }
        seen.push((a, b));
        match (self.node(a), other.node(b)) {
            (ValueNode::Null, ValueNode::Null) => true,
            (ValueNode::Undefined, ValueNode::Undefined) => true,
            (ValueNode::Bool(x), ValueNode::Bool(y)) => x == y,
            (ValueNode::Number(x), ValueNode::Number(y)) => same_value(*x, *y),
            (ValueNode::String(x), ValueNode::String(y)) => x == y,
            (ValueNode::BigInt(x), ValueNode::BigInt(y)) => x == y,
            (ValueNode::Url(x), ValueNode::Url(y)) => x == y,
            (ValueNode::Date(x), ValueNode::Date(y)) => {
                x.timestamp_millis() == y.timestamp_millis()
            }
            (
                ValueNode::Regex { source: xs, flags: xf },
                ValueNode::Regex { source: ys, flags: yf },
            ) => xs == ys && xf == yf,
            (ValueNode::Error(x), ValueNode::Error(y)) => {
                x.name == y.name
                    && x.message == y.message
                    && x.stack == y.stack
                    && self.eq_inner(x.cause, other, y.cause, seen)
            }
            (ValueNode::Array(xs), ValueNode::Array(ys)) => {
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys)
                        .all(|(x, y)| self.eq_inner(*x, other, *y, seen))
            }
            (ValueNode::Object(xs), ValueNode::Object(ys)) => {
                xs.len() == ys.len()
                    && xs.iter().zip(ys).all(|((xk, xv), (yk, yv))| {
                        xk == yk && self.eq_inner(*xv, other, *yv, seen)
                    })
            }
            (ValueNode::Handle(x), ValueNode::Handle(y)) => x == y,
            _ => false,
        }
    }
}

/// `Object.is` semantics for numbers: `NaN` equals `NaN`, `-0` does not
/// equal `+0`.
pub fn same_value(a: f64, b: f64) -> bool {
    a.to_bits() == b.to_bits() || (a.is_nan() && b.is_nan())
}

/// A graph together with its root: the unit values travel in.
#[derive(Debug, Clone)]
pub struct RemoteValue {
    pub graph: ValueGraph,
    pub root: NodeId,
}

impl Default for RemoteValue {
    fn default() -> Self {
        Self::undefined()
    }
}

impl RemoteValue {
    pub fn new(graph: ValueGraph, root: NodeId) -> Self {
        Self { graph, root }
    }

    pub fn undefined() -> Self {
        let mut graph = ValueGraph::new();
        let root = graph.undefined();
        Self { graph, root }
    }

    pub fn from_json(value: &JsonValue) -> Self {
        let mut graph = ValueGraph::new();
        let root = graph.from_json(value);
        Self { graph, root }
    }

    pub fn node(&self) -> &ValueNode {
        self.graph.node(self.root)
    }

    pub fn to_json(&self) -> Result<JsonValue> {
        self.graph.to_json(self.root)
    }

    pub fn structurally_equal(&self, other: &RemoteValue) -> bool {
        self.graph
            .structurally_equal(self.root, &other.graph, other.root)
    }
}
