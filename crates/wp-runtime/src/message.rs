//! Bridge message shapes.
//!
//! Text frames on the bridge carry exactly one of these JSON messages,
//! tagged `type: "route" | "handle"`. The inner unions are discriminated by
//! field shape. Correlation between a request and its reply is by
//! `(type, id, resolveID)` since multiple routes and handle evaluations may
//! be in flight concurrently.

use serde::{Deserialize, Serialize};

use crate::remote::SerializedValue;

/// Reserved target-vector slot for the browsing context.
pub const CONTEXT_TARGET_ID: u32 = 0;
/// Reserved target-vector slot for the page.
pub const PAGE_TARGET_ID: u32 = 1;

/// A single name/value header pair, order-preserving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

/// Top-level message union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeMessage {
    #[serde(rename = "route")]
    Route(RouteMessage),
    #[serde(rename = "handle")]
    Handle(HandleMessage),
}

impl BridgeMessage {
    /// True when the next frame in this direction is this message's body.
    pub fn announces_body(&self) -> bool {
        match self {
            BridgeMessage::Route(RouteMessage::Request(request)) => request.has_body,
            BridgeMessage::Route(RouteMessage::Action(action)) => {
                action.has_post_data.unwrap_or(false) || action.has_body.unwrap_or(false)
            }
            _ => false,
        }
    }
}

/// Route-typed messages. Variant order matters: serde tries them in
/// declaration order, most specific first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteMessage {
    Request(RouteRequest),
    Action(RouteAction),
    Toggle(RouteToggle),
    Resolve(RouteResolve),
}

/// Client -> host: turn universal interception on or off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteToggle {
    pub enable: bool,
    #[serde(rename = "resolveID")]
    pub resolve_id: u32,
}

/// Host -> client: metadata for an intercepted request, parked in routeList
/// slot `id`. When `has_body` is set, the next binary frame is the request
/// body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    pub id: u32,
    pub url: String,
    pub method: String,
    pub headers_array: Vec<HeaderEntry>,
    pub resource_type: String,
    pub is_navigation_request: bool,
    pub has_body: bool,
}

/// The terminal decision a client hands back for a parked route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RouteActionKind {
    Abort,
    Continue,
    Fulfill,
}

/// Client -> host: perform a terminal action on routeList slot `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteAction {
    pub id: u32,
    #[serde(rename = "resolveID")]
    pub resolve_id: u32,
    pub action: RouteActionKind,
    /// Abort only: engine error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Continue only: overridden URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Continue only: overridden method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Full header list after overrides, replacing the original set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<HeaderEntry>>,
    /// Fulfill only: response status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Continue only: a binary post-data frame follows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_post_data: Option<bool>,
    /// Fulfill only: a binary body frame follows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_body: Option<bool>,
    /// Fulfill only: serve this host-side file as the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Host -> client: a toggle or action completed. `id` is absent for toggle
/// acknowledgements. A present `error` carries the serialized thrown value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResolve {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    #[serde(rename = "resolveID")]
    pub resolve_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SerializedValue>,
}

/// Handle-typed messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandleMessage {
    Request(HandleRequest),
    Resolve(HandleResolve),
}

/// The closed set of handle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleAction {
    #[serde(rename = "evaluate")]
    Evaluate,
    #[serde(rename = "json-value")]
    JsonValue,
    #[serde(rename = "get-properties")]
    GetProperties,
    #[serde(rename = "get-property")]
    GetProperty,
    #[serde(rename = "dispose")]
    Dispose,
}

/// Client -> host: operate on target vector slot `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleRequest {
    pub id: u32,
    #[serde(rename = "resolveID")]
    pub resolve_id: u32,
    pub action: HandleAction,
    /// Evaluate only: the function source.
    #[serde(default, rename = "fn", skip_serializing_if = "Option::is_none")]
    pub fn_source: Option<String>,
    /// Evaluate only: the serialized argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arg: Option<SerializedValue>,
    /// Evaluate only: register the result and return its id instead of
    /// serializing it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<bool>,
    /// Get-property only: property name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Host -> client: a handle operation completed.
///
/// The `result` payload depends on the request: a [`SerializedValue`] for
/// `evaluate`/`json-value` (or any errored operation, where it is the
/// serialized thrown value), a plain number for `evaluate` with `h` and for
/// `get-property`, an array of `[name, id]` pairs for `get-properties`, and
/// null for `dispose`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleResolve {
    pub id: u32,
    #[serde(rename = "resolveID")]
    pub resolve_id: u32,
    pub result: serde_json::Value,
    pub error: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: &BridgeMessage) -> BridgeMessage {
        let text = serde_json::to_string(message).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn route_toggle_round_trips() {
        let message = BridgeMessage::Route(RouteMessage::Toggle(RouteToggle {
            enable: true,
            resolve_id: 7,
        }));
        match round_trip(&message) {
            BridgeMessage::Route(RouteMessage::Toggle(toggle)) => {
                assert!(toggle.enable);
                assert_eq!(toggle.resolve_id, 7);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn route_request_round_trips_and_announces_body() {
        let message = BridgeMessage::Route(RouteMessage::Request(RouteRequest {
            id: 3,
            url: "http://127.0.0.1:8000/api".into(),
            method: "POST".into(),
            headers_array: vec![HeaderEntry {
                name: "content-type".into(),
                value: "application/json".into(),
            }],
            resource_type: "fetch".into(),
            is_navigation_request: false,
            has_body: true,
        }));
        assert!(message.announces_body());
        match round_trip(&message) {
            BridgeMessage::Route(RouteMessage::Request(request)) => {
                assert_eq!(request.id, 3);
                assert_eq!(request.method, "POST");
                assert!(request.has_body);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn route_action_is_not_mistaken_for_resolve() {
        let message = BridgeMessage::Route(RouteMessage::Action(RouteAction {
            id: 1,
            resolve_id: 2,
            action: RouteActionKind::Fulfill,
            error_code: None,
            url: None,
            method: None,
            headers: None,
            status: Some(200),
            has_post_data: None,
            has_body: Some(true),
            path: None,
        }));
        assert!(message.announces_body());
        match round_trip(&message) {
            BridgeMessage::Route(RouteMessage::Action(action)) => {
                assert_eq!(action.action, RouteActionKind::Fulfill);
                assert_eq!(action.status, Some(200));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn bare_resolve_deserializes_as_toggle_ack() {
        let text = r#"{"type":"route","resolveID":9}"#;
        match serde_json::from_str::<BridgeMessage>(text).unwrap() {
            BridgeMessage::Route(RouteMessage::Resolve(resolve)) => {
                assert_eq!(resolve.id, None);
                assert_eq!(resolve.resolve_id, 9);
                assert!(resolve.error.is_none());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn handle_request_round_trips() {
        let message = BridgeMessage::Handle(HandleMessage::Request(HandleRequest {
            id: 1,
            resolve_id: 4,
            action: HandleAction::Evaluate,
            fn_source: Some("1 + 2".into()),
            arg: None,
            h: Some(false),
            name: None,
        }));
        match round_trip(&message) {
            BridgeMessage::Handle(HandleMessage::Request(request)) => {
                assert_eq!(request.action, HandleAction::Evaluate);
                assert_eq!(request.fn_source.as_deref(), Some("1 + 2"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn handle_resolve_round_trips() {
        let message = BridgeMessage::Handle(HandleMessage::Resolve(HandleResolve {
            id: 1,
            resolve_id: 4,
            result: serde_json::json!(6),
            error: false,
        }));
        match round_trip(&message) {
            BridgeMessage::Handle(HandleMessage::Resolve(resolve)) => {
                assert_eq!(resolve.result, serde_json::json!(6));
                assert!(!resolve.error);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
