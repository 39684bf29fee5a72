//! Host side of the route protocol.
//!
//! With interception toggled on, every request in the context lands here.
//! Requests carrying the session's bypass marker continue immediately with
//! the marker stripped; everything else is parked in a routeList slot and
//! forwarded to the client for a decision, which is then performed against
//! the engine and acknowledged.

use std::sync::Arc;

use wp_runtime::message::{
    BridgeMessage, RouteAction, RouteActionKind, RouteMessage, RouteRequest, RouteResolve,
};
use wp_runtime::transport::MessageSender;

use crate::bridge::Session;
use crate::engine::{ContinueOverrides, FulfillResponse, InterceptedRoute};
use crate::error::{Error, Result};
use crate::handle::thrown_value;

/// Entry point for every intercepted request.
pub(crate) async fn handle_intercepted(session: Arc<Session>, route: Arc<dyn InterceptedRoute>) {
    let meta = route.request();

    // The escape hatch: in-page code marks fetches it does not want
    // re-intercepted with `bypass-<session-uuid>: true`.
    let marker = format!("bypass-{}", session.uuid());
    let bypassed = meta
        .headers
        .iter()
        .any(|h| h.name.eq_ignore_ascii_case(&marker) && h.value == "true");
    if bypassed {
        let remaining: Vec<_> = meta
            .headers
            .iter()
            .filter(|h| !h.name.eq_ignore_ascii_case(&marker))
            .cloned()
            .collect();
        let overrides = ContinueOverrides {
            headers: Some(remaining),
            ..Default::default()
        };
        if let Err(err) = route.continue_with(overrides).await {
            tracing::error!(target: "wp", error = %err, "bypass continue failed");
        }
        return;
    }

    let Some(sender) = session.client_sender() else {
        if let Err(err) = route.continue_with(Default::default()).await {
            tracing::error!(target: "wp", error = %err, "pass-through continue failed");
        }
        return;
    };

    let id = session.park_route(Arc::clone(&route));
    let body = meta.post_data.clone().filter(|data| !data.is_empty());
    let message = BridgeMessage::Route(RouteMessage::Request(RouteRequest {
        id,
        url: meta.url.clone(),
        method: meta.method.clone(),
        headers_array: meta.headers.clone(),
        resource_type: meta.resource_type.clone(),
        is_navigation_request: meta.is_navigation_request,
        has_body: body.is_some(),
    }));
    if sender.send(&message, body.as_deref()).is_err() {
        // The client raced away; unpark and let the request through.
        if let Ok(route) = session.take_route(id) {
            if let Err(err) = route.continue_with(Default::default()).await {
                tracing::error!(target: "wp", error = %err, "post-disconnect continue failed");
            }
        }
    }
}

/// Performs a client decision against the parked route, then acknowledges.
pub(crate) async fn perform_action(
    session: Arc<Session>,
    sender: MessageSender,
    action: RouteAction,
    body: Option<Vec<u8>>,
) {
    let id = action.id;
    let resolve_id = action.resolve_id;
    let error = match run_action(&session, action, body).await {
        Ok(()) => None,
        Err(err) => {
            tracing::debug!(target: "wp", id, error = %err, "route action failed");
            Some(thrown_value(&err))
        }
    };
    let resolve = BridgeMessage::Route(RouteMessage::Resolve(RouteResolve {
        id: Some(id),
        resolve_id,
        error,
    }));
    if let Err(err) = sender.send(&resolve, None) {
        tracing::debug!(target: "wp", error = %err, "route resolve dropped");
    }
}

async fn run_action(
    session: &Arc<Session>,
    action: RouteAction,
    body: Option<Vec<u8>>,
) -> Result<()> {
    let route = session.take_route(action.id)?;
    match action.action {
        RouteActionKind::Abort => {
            route
                .abort(action.error_code.as_deref().unwrap_or("failed"))
                .await
        }
        RouteActionKind::Continue => {
            route
                .continue_with(ContinueOverrides {
                    url: action.url,
                    method: action.method,
                    headers: action.headers,
                    post_data: body,
                })
                .await
        }
        RouteActionKind::Fulfill => {
            let body = match &action.path {
                Some(path) => tokio::fs::read(path).await.map_err(|err| {
                    Error::RequestFailed(format!("fulfill path {path}: {err}"))
                })?,
                None => body.unwrap_or_default(),
            };
            route
                .fulfill_with(FulfillResponse {
                    status: action.status.unwrap_or(200),
                    headers: action.headers.unwrap_or_default(),
                    body,
                })
                .await
        }
    }
}
