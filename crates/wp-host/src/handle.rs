//! Host side of the handle protocol.
//!
//! Each inbound handle request operates on one target-vector slot and
//! produces exactly one resolve. Thrown values (engine failures, unknown
//! ids, disposed slots) are serialized back with the error flag set; they
//! never tear down the bridge.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use wp_runtime::expr::parse_function_source;
use wp_runtime::message::{HandleAction, HandleRequest, HandleResolve};
use wp_runtime::remote::{
    parse, serialize, RemoteValue, SerializedValue, ValueGraph, ValueNode,
};

use crate::bridge::Session;
use crate::engine::{HostArg, HostValue};
use crate::error::{Error, Result};

/// Processes one handle request into its resolve.
pub(crate) async fn process(session: &Session, request: HandleRequest) -> HandleResolve {
    let id = request.id;
    let resolve_id = request.resolve_id;
    match run(session, request).await {
        Ok(result) => HandleResolve {
            id,
            resolve_id,
            result,
            error: false,
        },
        Err(err) => {
            tracing::debug!(target: "wp", id, error = %err, "handle operation failed");
            HandleResolve {
                id,
                resolve_id,
                result: thrown_json(&err),
                error: true,
            }
        }
    }
}

/// Serializes an error as the wire value for a thrown result.
pub(crate) fn thrown_value(err: &Error) -> SerializedValue {
    let mut graph = ValueGraph::new();
    let root = graph.error("Error", err.to_string(), None, None);
    serialize(&graph, root, None).unwrap_or_default()
}

fn thrown_json(err: &Error) -> JsonValue {
    serde_json::to_value(thrown_value(err)).unwrap_or(JsonValue::Null)
}

async fn run(session: &Session, request: HandleRequest) -> Result<JsonValue> {
    match request.action {
        HandleAction::Dispose => {
            session.targets.lock().dispose(request.id)?;
            Ok(JsonValue::Null)
        }
        HandleAction::JsonValue => {
            let target = session.targets.lock().get(request.id)?;
            serialize_host_value(&target)
        }
        HandleAction::GetProperty => {
            let target = session.targets.lock().get(request.id)?;
            let name = request.name.unwrap_or_default();
            let value = property_of(&target, &name).await?;
            let id = session.targets.lock().register(value);
            Ok(JsonValue::from(id))
        }
        HandleAction::GetProperties => {
            let target = session.targets.lock().get(request.id)?;
            let pairs = properties_of(&target).await?;
            let mut out = Vec::with_capacity(pairs.len());
            {
                let mut targets = session.targets.lock();
                for (name, value) in pairs {
                    out.push((name, targets.register(value)));
                }
            }
            Ok(serde_json::to_value(out)?)
        }
        HandleAction::Evaluate => {
            let source = request.fn_source.ok_or_else(|| {
                Error::Runtime(wp_runtime::Error::Protocol(
                    "evaluate without a function source".into(),
                ))
            })?;
            let normalized = parse_function_source(&source)?;
            let arg = deserialize_arg(session, request.arg.as_ref())?;
            let target = session.targets.lock().get(request.id)?;
            let result = match &target {
                HostValue::Object(object) => object.invoke(&normalized, arg).await?,
                HostValue::Data(_) => return Err(Error::NotEvaluable(request.id)),
            };
            if request.h == Some(true) {
                let id = session.targets.lock().register(result);
                Ok(JsonValue::from(id))
            } else {
                serialize_host_value(&result)
            }
        }
    }
}

/// Serializes a host value for the wire; anything unserializable (engine
/// objects included) becomes null.
fn serialize_host_value(value: &HostValue) -> Result<JsonValue> {
    let serialized = match value {
        HostValue::Data(value) => {
            let mut graph = value.graph.clone();
            let fallback = graph.null();
            serialize(&graph, value.root, Some(fallback))?
        }
        HostValue::Object(_) => {
            let mut graph = ValueGraph::new();
            let root = graph.null();
            serialize(&graph, root, None)?
        }
    };
    Ok(serde_json::to_value(serialized)?)
}

/// Parses an evaluate argument against the current target vector and
/// resolves every handle it mentions.
fn deserialize_arg(session: &Session, arg: Option<&SerializedValue>) -> Result<HostArg> {
    let targets = session.targets.lock();
    let value = match arg {
        Some(serialized) => {
            let (graph, root) = parse(serialized, Some(&*targets))?;
            RemoteValue::new(graph, root)
        }
        None => RemoteValue::undefined(),
    };
    let mut handles = HashMap::new();
    for (_, node) in value.graph.iter() {
        if let ValueNode::Handle(id) = node {
            handles.insert(*id, targets.get(*id)?);
        }
    }
    Ok(HostArg { value, handles })
}

async fn property_of(target: &HostValue, name: &str) -> Result<HostValue> {
    match target {
        HostValue::Object(object) => object.property(name).await,
        HostValue::Data(value) => Ok(data_property(value, name)),
    }
}

async fn properties_of(target: &HostValue) -> Result<Vec<(String, HostValue)>> {
    match target {
        HostValue::Object(object) => object.properties().await,
        HostValue::Data(value) => Ok(data_properties(value)),
    }
}

fn data_property(value: &RemoteValue, name: &str) -> HostValue {
    let child = match value.node() {
        ValueNode::Object(properties) => properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, id)| *id),
        ValueNode::Array(elements) => name
            .parse::<usize>()
            .ok()
            .and_then(|index| elements.get(index).copied()),
        _ => None,
    };
    match child {
        Some(id) => HostValue::Data(RemoteValue::new(value.graph.clone(), id)),
        None => HostValue::Data(RemoteValue::undefined()),
    }
}

fn data_properties(value: &RemoteValue) -> Vec<(String, HostValue)> {
    match value.node() {
        ValueNode::Object(properties) => properties
            .iter()
            .map(|(key, id)| {
                (
                    key.clone(),
                    HostValue::Data(RemoteValue::new(value.graph.clone(), *id)),
                )
            })
            .collect(),
        ValueNode::Array(elements) => elements
            .iter()
            .enumerate()
            .map(|(index, id)| {
                (
                    index.to_string(),
                    HostValue::Data(RemoteValue::new(value.graph.clone(), *id)),
                )
            })
            .collect(),
        _ => Vec::new(),
    }
}
