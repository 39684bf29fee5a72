//! Remote-value wire codec.
//!
//! Values cross the bridge as tagged JSON trees. Every emitted node carries
//! its depth-first pre-order position `i`; a value already emitted within
//! the same message is replaced by a bare `{ i }` back-reference, which is
//! what lets cyclic graphs and shared subtrees round-trip. The visited check
//! uses `Object.is` semantics, so equal primitives collapse to a single
//! node as well.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use url::Url;

use crate::error::{Error, Result};
use crate::remote::value::{same_value, ErrorValue, NodeId, ValueGraph, ValueNode};

/// Lookup view over the host's target vector, used to validate `h` nodes
/// while parsing.
pub trait HandleLookup {
    fn contains_handle(&self, id: u32) -> bool;
}

impl HandleLookup for [u32] {
    fn contains_handle(&self, id: u32) -> bool {
        self.contains(&id)
    }
}

impl HandleLookup for Vec<u32> {
    fn contains_handle(&self, id: u32) -> bool {
        self.as_slice().contains_handle(id)
    }
}

/// The six sentinel values carried under the `v` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sentinel {
    #[serde(rename = "undefined")]
    Undefined,
    #[serde(rename = "NaN")]
    NaN,
    #[serde(rename = "Infinity")]
    Infinity,
    #[serde(rename = "-Infinity")]
    NegInfinity,
    #[serde(rename = "-0")]
    NegZero,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedRegex {
    pub p: String,
    pub f: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub n: String,
    pub m: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c: Option<Box<SerializedValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedProperty {
    pub k: String,
    pub v: SerializedValue,
}

/// One node of the serialized tree. Exactly one discriminator is present;
/// a node with none is a back-reference to position `i`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SerializedValue {
    pub i: u32,
    /// Finite number, boolean, string, or null.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub n: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<Sentinel>,
    /// Big integer, decimal string form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<String>,
    /// Absolute URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub u: Option<String>,
    /// ISO-8601 timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<SerializedRegex>,
    /// Handle id into the host target vector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<Box<SerializedError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<Vec<SerializedValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o: Option<Vec<SerializedProperty>>,
}

/// Distinguishes `"n": null` (a serialized `null`) from an absent key.
fn present_value<'de, D>(deserializer: D) -> std::result::Result<Option<JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    JsonValue::deserialize(deserializer).map(Some)
}

impl SerializedValue {
    fn discriminator_count(&self) -> usize {
        [
            self.n.is_some(),
            self.v.is_some(),
            self.b.is_some(),
            self.u.is_some(),
            self.d.is_some(),
            self.r.is_some(),
            self.h.is_some(),
            self.e.is_some(),
            self.a.is_some(),
            self.o.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }

    /// True when this node is a bare back-reference.
    pub fn is_back_reference(&self) -> bool {
        self.discriminator_count() == 0
    }
}

/// Encodes the graph rooted at `root` into a serialized tree.
///
/// When `fallback` names another node of the same graph, any unencodable
/// value is replaced by that node's encoding; a fallback that is itself
/// unencodable fails the whole serialization.
pub fn serialize(
    graph: &ValueGraph,
    root: NodeId,
    fallback: Option<NodeId>,
) -> Result<SerializedValue> {
    let mut visited = Vec::new();
    encode(graph, root, fallback, &mut visited)
}

fn encode(
    graph: &ValueGraph,
    id: NodeId,
    fallback: Option<NodeId>,
    visited: &mut Vec<NodeId>,
) -> Result<SerializedValue> {
    if let ValueNode::Opaque(label) = graph.node(id) {
        let fallback_id = match fallback {
            Some(fb) => fb,
            None => return Err(Error::Unencodable(label.clone())),
        };
        if let ValueNode::Opaque(fb_label) = graph.node(fallback_id) {
            return Err(Error::Unencodable(fb_label.clone()));
        }
        // The substitute participates in visited-dedup like any other value,
        // but its own unencodable content is not forgiven a second time.
        return encode(graph, fallback_id, None, visited);
    }

    if let Some(position) = visited
        .iter()
        .position(|seen| visit_equal(graph, *seen, id))
    {
        return Ok(SerializedValue {
            i: position as u32,
            ..Default::default()
        });
    }

    let position = visited.len() as u32;
    visited.push(id);

    let mut out = SerializedValue {
        i: position,
        ..Default::default()
    };

    match graph.node(id) {
        ValueNode::Null => out.n = Some(JsonValue::Null),
        ValueNode::Bool(b) => out.n = Some(JsonValue::Bool(*b)),
        ValueNode::String(s) => out.n = Some(JsonValue::String(s.clone())),
        ValueNode::Number(x) => match encode_number(*x) {
            NumberRepr::Finite(v) => out.n = Some(v),
            NumberRepr::Sentinel(s) => out.v = Some(s),
        },
        ValueNode::Undefined => out.v = Some(Sentinel::Undefined),
        ValueNode::BigInt(digits) => out.b = Some(digits.clone()),
        ValueNode::Url(url) => out.u = Some(url.as_str().to_owned()),
        ValueNode::Date(when) => {
            out.d = Some(when.to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        ValueNode::Regex { source, flags } => {
            out.r = Some(SerializedRegex {
                p: source.clone(),
                f: flags.clone(),
            });
        }
        ValueNode::Handle(handle) => out.h = Some(*handle),
        ValueNode::Error(error) => {
            // The cause is encoded even when it is `undefined`, so the
            // sentinel is present on the wire.
            let cause = encode(graph, error.cause, fallback, visited)?;
            out.e = Some(Box::new(SerializedError {
                n: error.name.clone(),
                m: error.message.clone(),
                c: Some(Box::new(cause)),
                s: error.stack.clone(),
            }));
        }
        ValueNode::Array(elements) => {
            let mut encoded = Vec::with_capacity(elements.len());
            for element in elements {
                encoded.push(encode(graph, *element, fallback, visited)?);
            }
            out.a = Some(encoded);
        }
        ValueNode::Object(properties) => {
            let mut encoded = Vec::with_capacity(properties.len());
            for (key, value) in properties {
                encoded.push(SerializedProperty {
                    k: key.clone(),
                    v: encode(graph, *value, fallback, visited)?,
                });
            }
            out.o = Some(encoded);
        }
        ValueNode::Opaque(_) => unreachable!("handled above"),
    }

    Ok(out)
}

enum NumberRepr {
    Finite(JsonValue),
    Sentinel(Sentinel),
}

fn encode_number(x: f64) -> NumberRepr {
    if x.is_nan() {
        NumberRepr::Sentinel(Sentinel::NaN)
    } else if x == f64::INFINITY {
        NumberRepr::Sentinel(Sentinel::Infinity)
    } else if x == f64::NEG_INFINITY {
        NumberRepr::Sentinel(Sentinel::NegInfinity)
    } else if x == 0.0 && x.is_sign_negative() {
        NumberRepr::Sentinel(Sentinel::NegZero)
    } else {
        match serde_json::Number::from_f64(x) {
            Some(n) => NumberRepr::Finite(JsonValue::Number(n)),
            None => NumberRepr::Sentinel(Sentinel::NaN),
        }
    }
}

/// Identity for the visited check: node identity, widened to `Object.is`
/// equality for primitives and to id equality for handles.
fn visit_equal(graph: &ValueGraph, a: NodeId, b: NodeId) -> bool {
    if a == b {
        return true;
    }
    match (graph.node(a), graph.node(b)) {
        (ValueNode::Null, ValueNode::Null) => true,
        (ValueNode::Undefined, ValueNode::Undefined) => true,
        (ValueNode::Bool(x), ValueNode::Bool(y)) => x == y,
        (ValueNode::Number(x), ValueNode::Number(y)) => same_value(*x, *y),
        (ValueNode::String(x), ValueNode::String(y)) => x == y,
        (ValueNode::BigInt(x), ValueNode::BigInt(y)) => x == y,
        (ValueNode::Handle(x), ValueNode::Handle(y)) => x == y,
        _ => false,
    }
}

/// Decodes a serialized tree into a fresh [`ValueGraph`].
///
/// Containers are constructed empty before their children are visited, so
/// back-references into a container under construction resolve and cycles
/// close. Handle nodes are validated against `targets`; parsing a handle
/// with no target vector, or with an id the vector does not contain, is a
/// protocol error.
pub fn parse(
    value: &SerializedValue,
    targets: Option<&dyn HandleLookup>,
) -> Result<(ValueGraph, NodeId)> {
    let mut graph = ValueGraph::new();
    let mut positions = Vec::new();
    let root = decode(value, targets, &mut graph, &mut positions)?;
    Ok((graph, root))
}

fn decode(
    value: &SerializedValue,
    targets: Option<&dyn HandleLookup>,
    graph: &mut ValueGraph,
    positions: &mut Vec<NodeId>,
) -> Result<NodeId> {
    match value.discriminator_count() {
        0 => {
            return positions
                .get(value.i as usize)
                .copied()
                .ok_or_else(|| {
                    Error::Protocol(format!("back-reference to unseen node {}", value.i))
                });
        }
        1 => {}
        many => {
            return Err(Error::Protocol(format!(
                "node {} carries {many} discriminators",
                value.i
            )));
        }
    }

    if value.i as usize != positions.len() {
        return Err(Error::Protocol(format!(
            "node position {} out of order (expected {})",
            value.i,
            positions.len()
        )));
    }

    if let Some(n) = &value.n {
        let id = match n {
            JsonValue::Null => graph.null(),
            JsonValue::Bool(b) => graph.boolean(*b),
            JsonValue::Number(x) => {
                let x = x
                    .as_f64()
                    .ok_or_else(|| Error::Protocol("non-finite number under n".into()))?;
                graph.number(x)
            }
            JsonValue::String(s) => graph.string(s.clone()),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected JSON under n: {other}"
                )));
            }
        };
        positions.push(id);
        return Ok(id);
    }

    if let Some(sentinel) = value.v {
        let id = match sentinel {
            Sentinel::Undefined => graph.undefined(),
            Sentinel::NaN => graph.number(f64::NAN),
            Sentinel::Infinity => graph.number(f64::INFINITY),
            Sentinel::NegInfinity => graph.number(f64::NEG_INFINITY),
            Sentinel::NegZero => graph.number(-0.0),
        };
        positions.push(id);
        return Ok(id);
    }

    if let Some(digits) = &value.b {
        let id = graph.bigint(digits.clone());
        positions.push(id);
        return Ok(id);
    }

    if let Some(raw) = &value.u {
        let url = Url::parse(raw)
            .map_err(|err| Error::Protocol(format!("invalid URL on the wire: {err}")))?;
        let id = graph.url(url);
        positions.push(id);
        return Ok(id);
    }

    if let Some(raw) = &value.d {
        let when = DateTime::parse_from_rfc3339(raw)
            .map_err(|err| Error::Protocol(format!("invalid timestamp on the wire: {err}")))?
            .with_timezone(&Utc);
        let id = graph.date(when);
        positions.push(id);
        return Ok(id);
    }

    if let Some(regex) = &value.r {
        let id = graph.regex(regex.p.clone(), regex.f.clone());
        positions.push(id);
        return Ok(id);
    }

    if let Some(handle) = value.h {
        match targets {
            Some(lookup) if lookup.contains_handle(handle) => {
                let id = graph.handle(handle);
                positions.push(id);
                Ok(id)
            }
            Some(_) => Err(Error::UnknownHandle(handle)),
            None => Err(Error::Protocol(format!(
                "handle #{handle} received without a target vector"
            ))),
        }
    } else if let Some(error) = &value.e {
        // Construct the error before visiting the cause; the cause slot
        // temporarily points at the error itself and is patched below.
        let id = graph.add(ValueNode::Error(ErrorValue {
            name: error.n.clone(),
            message: error.m.clone(),
            stack: error.s.clone(),
            cause: NodeId(graph.len()),
        }));
        positions.push(id);
        let cause = match &error.c {
            Some(c) => decode(c, targets, graph, positions)?,
            None => graph.undefined(),
        };
        if let ValueNode::Error(e) = graph.node_mut(id) {
            e.cause = cause;
        }
        Ok(id)
    } else if let Some(elements) = &value.a {
        let id = graph.array(Vec::with_capacity(elements.len()));
        positions.push(id);
        for element in elements {
            let child = decode(element, targets, graph, positions)?;
            if let ValueNode::Array(out) = graph.node_mut(id) {
                out.push(child);
            }
        }
        Ok(id)
    } else if let Some(properties) = &value.o {
        let id = graph.object(Vec::with_capacity(properties.len()));
        positions.push(id);
        for property in properties {
            let child = decode(&property.v, targets, graph, positions)?;
            if let ValueNode::Object(out) = graph.node_mut(id) {
                out.push((property.k.clone(), child));
            }
        }
        Ok(id)
    } else {
        Err(Error::Protocol(format!(
            "node {} has no recognizable discriminator",
            value.i
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(graph: &ValueGraph, root: NodeId) -> (ValueGraph, NodeId) {
        let wire = serialize(graph, root, None).unwrap();
        let json = serde_json::to_string(&wire).unwrap();
        let back: SerializedValue = serde_json::from_str(&json).unwrap();
        parse(&back, None).unwrap()
    }

    #[test]
    fn primitives_round_trip() {
        let mut g = ValueGraph::new();
        let values = vec![
            g.null(),
            g.undefined(),
            g.boolean(true),
            g.number(42.5),
            g.number(f64::NAN),
            g.number(f64::INFINITY),
            g.number(f64::NEG_INFINITY),
            g.number(-0.0),
            g.string("hello"),
            g.bigint("123456789012345678901234567890"),
        ];
        let root = g.array(values);
        let (parsed, parsed_root) = round_trip(&g, root);
        assert!(g.structurally_equal(root, &parsed, parsed_root));
    }

    #[test]
    fn negative_zero_is_distinct_from_zero() {
        let mut g = ValueGraph::new();
        let neg = g.number(-0.0);
        let pos = g.number(0.0);
        let root = g.array(vec![neg, pos]);
        let wire = serialize(&g, root, None).unwrap();
        let elements = wire.a.unwrap();
        assert_eq!(elements[0].v, Some(Sentinel::NegZero));
        assert!(elements[1].n.is_some());
    }

    #[test]
    fn equal_primitives_collapse_to_back_references() {
        let mut g = ValueGraph::new();
        let a = g.string("dup");
        let b = g.string("dup");
        let root = g.array(vec![a, b]);
        let wire = serialize(&g, root, None).unwrap();
        let elements = wire.a.unwrap();
        assert!(!elements[0].is_back_reference());
        assert!(elements[1].is_back_reference());
        assert_eq!(elements[1].i, elements[0].i);
    }

    #[test]
    fn cyclic_array_round_trips() {
        // x = [1, ['deep', {deeper: []}]]; x.push(x)
        let mut g = ValueGraph::new();
        let outer = g.array(vec![]);
        let one = g.number(1.0);
        let deep = g.string("deep");
        let empty = g.array(vec![]);
        let obj = g.object(vec![("deeper".into(), empty)]);
        let inner = g.array(vec![deep, obj]);
        g.push_element(outer, one).unwrap();
        g.push_element(outer, inner).unwrap();
        g.push_element(outer, outer).unwrap();

        let (parsed, root) = round_trip(&g, outer);
        match parsed.node(root) {
            ValueNode::Array(elements) => {
                assert_eq!(elements.len(), 3);
                // The cycle closes: the last element is the outer array.
                assert_eq!(elements[2], root);
            }
            other => panic!("expected array, got {other:?}"),
        }
        assert!(g.structurally_equal(outer, &parsed, root));
    }

    #[test]
    fn shared_subtree_is_emitted_once() {
        let mut g = ValueGraph::new();
        let shared = g.object(vec![]);
        let root = g.array(vec![shared, shared]);
        let wire = serialize(&g, root, None).unwrap();
        let elements = wire.a.clone().unwrap();
        assert!(elements[1].is_back_reference());

        let (parsed, parsed_root) = parse(&wire, None).unwrap();
        match parsed.node(parsed_root) {
            ValueNode::Array(items) => assert_eq!(items[0], items[1]),
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn platform_objects_round_trip() {
        let mut g = ValueGraph::new();
        let url = g.url(Url::parse("https://example.com/").unwrap());
        let when = g.date("2023-05-01T12:30:45.123Z".parse().unwrap());
        let regex = g.regex("ab+c", "gi");
        let root = g.array(vec![url, when, regex]);

        let (parsed, parsed_root) = round_trip(&g, root);
        assert!(g.structurally_equal(root, &parsed, parsed_root));

        let json = parsed.to_json(parsed_root).unwrap();
        assert_eq!(json[0], "https://example.com/");
        assert_eq!(json[1], "2023-05-01T12:30:45.123Z");
    }

    #[test]
    fn errors_round_trip_with_cause_chain() {
        let mut g = ValueGraph::new();
        let inner = g.error("TypeError", "inner", Some("at inner".into()), None);
        let outer = g.error("Error", "outer", Some("at outer".into()), Some(inner));

        let (parsed, root) = round_trip(&g, outer);
        assert!(g.structurally_equal(outer, &parsed, root));
        match parsed.node(root) {
            ValueNode::Error(e) => {
                assert_eq!(e.name, "Error");
                assert_eq!(e.message, "outer");
                match parsed.node(e.cause) {
                    ValueNode::Error(cause) => assert_eq!(cause.name, "TypeError"),
                    other => panic!("expected error cause, got {other:?}"),
                }
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn absent_cause_still_emits_the_undefined_sentinel() {
        let mut g = ValueGraph::new();
        let err = g.error("Error", "plain", None, None);
        let wire = serialize(&g, err, None).unwrap();
        let e = wire.e.unwrap();
        assert_eq!(e.c.unwrap().v, Some(Sentinel::Undefined));
    }

    #[test]
    fn unencodable_without_fallback_fails() {
        let mut g = ValueGraph::new();
        let f = g.opaque("function");
        let root = g.array(vec![f]);
        match serialize(&g, root, None) {
            Err(Error::Unencodable(_)) => {}
            other => panic!("expected unencodable error, got {other:?}"),
        }
    }

    #[test]
    fn fallback_replaces_unencodable_values() {
        // [1, fn, 3] with fallback null -> [1, null, 3]
        let mut g = ValueGraph::new();
        let one = g.number(1.0);
        let f = g.opaque("function");
        let three = g.number(3.0);
        let root = g.array(vec![one, f, three]);
        let fallback = g.null();

        let wire = serialize(&g, root, Some(fallback)).unwrap();
        let (parsed, parsed_root) = parse(&wire, None).unwrap();
        let json = parsed.to_json(parsed_root).unwrap();
        assert_eq!(json, serde_json::json!([1.0, null, 3.0]));
    }

    #[test]
    fn unencodable_fallback_still_fails() {
        let mut g = ValueGraph::new();
        let f = g.opaque("function");
        let fallback = g.opaque("another function");
        assert!(matches!(
            serialize(&g, f, Some(fallback)),
            Err(Error::Unencodable(_))
        ));
    }

    #[test]
    fn handles_need_a_target_vector() {
        let mut g = ValueGraph::new();
        let h = g.handle(4);
        let wire = serialize(&g, h, None).unwrap();
        assert_eq!(wire.h, Some(4));

        assert!(matches!(parse(&wire, None), Err(Error::Protocol(_))));

        let targets: Vec<u32> = vec![3, 4, 5];
        let (parsed, root) = parse(&wire, Some(&targets)).unwrap();
        assert!(matches!(parsed.node(root), ValueNode::Handle(4)));

        let missing: Vec<u32> = vec![0, 1];
        assert!(matches!(
            parse(&wire, Some(&missing)),
            Err(Error::UnknownHandle(4))
        ));
    }

    #[test]
    fn null_under_n_is_not_a_back_reference() {
        let json = r#"{"i":0,"n":null}"#;
        let value: SerializedValue = serde_json::from_str(json).unwrap();
        assert!(!value.is_back_reference());
        let (parsed, root) = parse(&value, None).unwrap();
        assert!(matches!(parsed.node(root), ValueNode::Null));
    }

    #[test]
    fn forward_back_reference_is_a_protocol_error() {
        let json = r#"{"i":7}"#;
        let value: SerializedValue = serde_json::from_str(json).unwrap();
        assert!(matches!(parse(&value, None), Err(Error::Protocol(_))));
    }
}
