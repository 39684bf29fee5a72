//! Remote values: the graph representation and its wire codec.

mod codec;
mod value;

pub use codec::{
    parse, serialize, HandleLookup, Sentinel, SerializedError, SerializedProperty,
    SerializedRegex, SerializedValue,
};
pub use value::{same_value, ErrorValue, NodeId, RemoteValue, ValueGraph, ValueNode};
