//! Route client: the LIFO handler stack and per-request state machine.
//!
//! Registered handlers form a stack; an intercepted request is offered to
//! every matching handler from the top down. Each handler either performs
//! exactly one terminal action (`abort`, `continue`, `fulfill`) or passes
//! control on with `fallback`. A handler whose invocation budget is spent
//! is removed from the stack before it runs, so its own failures cannot
//! leak into later requests. When nothing terminal happens, the request is
//! continued as-is.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use url::Url;

use wp_runtime::message::{
    HeaderEntry, RouteAction, RouteActionKind, RouteRequest, RouteResolve,
};
use wp_runtime::remote::{parse, RemoteValue, SerializedValue};

use crate::client::Inner;
use crate::error::{Error, Result};
use crate::matcher::RouteMatcher;

/// Boxed future returned by a route handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A registered route handler callback.
pub type RouteHandlerFn = Arc<dyn Fn(Route) -> HandlerFuture + Send + Sync>;

/// Wraps an async closure as a [`RouteHandlerFn`], preserving identity for
/// later deregistration.
pub fn route_handler<F, Fut>(handler: F) -> RouteHandlerFn
where
    F: Fn(Route) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |route| Box::pin(handler(route)))
}

struct RouteEntry {
    id: u64,
    matcher: RouteMatcher,
    handler: RouteHandlerFn,
    /// `None` means unlimited invocations.
    times: Option<u32>,
    handled: u32,
}

/// The handler stack plus the interception toggle it drives.
pub(crate) struct RouteSet {
    stack: Mutex<Vec<RouteEntry>>,
    /// Current host-side interception state. The async lock serializes
    /// toggle transitions so empty->non-empty->empty races queue cleanly.
    toggle: tokio::sync::Mutex<bool>,
    next_entry: AtomicU64,
}

impl RouteSet {
    pub(crate) fn new() -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
            toggle: tokio::sync::Mutex::new(false),
            next_entry: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(
        &self,
        matcher: RouteMatcher,
        handler: RouteHandlerFn,
        times: Option<u32>,
    ) {
        let id = self.next_entry.fetch_add(1, Ordering::SeqCst);
        self.stack.lock().push(RouteEntry {
            id,
            matcher,
            handler,
            times,
            handled: 0,
        });
    }

    pub(crate) fn unregister(&self, matcher: &RouteMatcher, handler: Option<&RouteHandlerFn>) {
        self.stack.lock().retain(|entry| {
            let matcher_hit = entry.matcher.same(matcher);
            let handler_hit = handler.map_or(true, |h| Arc::ptr_eq(&entry.handler, h));
            !(matcher_hit && handler_hit)
        });
    }

    fn is_empty(&self) -> bool {
        self.stack.lock().is_empty()
    }
}

/// Brings the host's interception toggle in line with the stack. Queued
/// behind any in-flight toggle so transitions serialize.
pub(crate) async fn sync_interception(inner: &Arc<Inner>) -> Result<()> {
    let mut enabled = inner.routes.toggle.lock().await;
    let want = !inner.routes.is_empty();
    if want != *enabled {
        inner.send_toggle(want).await?;
        *enabled = want;
    }
    Ok(())
}

/// Phase of one intercepted request on the client.
enum Phase {
    /// The current handler has not decided yet.
    Deciding,
    /// The current handler passed control on.
    FellBack,
    /// A terminal action was taken (or the inner continue fired).
    Handled,
}

/// Overrides accumulated by `fallback` and applied by `continue`.
#[derive(Debug, Clone, Default)]
pub struct RequestOverrides {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: Option<Vec<HeaderEntry>>,
    pub post_data: Option<Vec<u8>>,
}

impl RequestOverrides {
    fn merge(&mut self, other: RequestOverrides) {
        if other.url.is_some() {
            self.url = other.url;
        }
        if other.method.is_some() {
            self.method = other.method;
        }
        if other.headers.is_some() {
            self.headers = other.headers;
        }
        if other.post_data.is_some() {
            self.post_data = other.post_data;
        }
    }

}

/// The request as the current handler sees it, with accumulated overrides
/// applied.
#[derive(Debug, Clone)]
pub struct RequestView {
    pub url: String,
    pub method: String,
    pub headers: Vec<HeaderEntry>,
    pub post_data: Option<Vec<u8>>,
    pub resource_type: String,
    pub is_navigation_request: bool,
}

/// Body payload for `fulfill`.
#[derive(Debug, Clone)]
pub enum FulfillBody {
    Text(String),
    Bytes(Vec<u8>),
}

impl FulfillBody {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            FulfillBody::Text(text) => text.into_bytes(),
            FulfillBody::Bytes(bytes) => bytes,
        }
    }
}

/// Options for fulfilling a route.
#[derive(Debug, Clone, Default)]
pub struct FulfillOptions {
    pub body: Option<FulfillBody>,
    pub status: Option<u16>,
    pub headers: Option<Vec<HeaderEntry>>,
    pub content_type: Option<String>,
    /// Host-side file served as the body.
    pub path: Option<String>,
}

impl FulfillOptions {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Some(FulfillBody::Text(body.into())),
            ..Default::default()
        }
    }

    pub fn bytes(body: Vec<u8>) -> Self {
        Self {
            body: Some(FulfillBody::Bytes(body)),
            ..Default::default()
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

impl From<crate::env::FetchResponse> for FulfillOptions {
    fn from(response: crate::env::FetchResponse) -> Self {
        Self {
            body: Some(FulfillBody::Bytes(response.body)),
            status: Some(response.status),
            headers: Some(response.headers),
            content_type: None,
            path: None,
        }
    }
}

struct RouteCtx {
    inner: Arc<Inner>,
    meta: RouteRequest,
    body: Option<Vec<u8>>,
    phase: Mutex<Phase>,
    overrides: Mutex<RequestOverrides>,
    signal: Mutex<Option<oneshot::Sender<bool>>>,
}

/// An intercepted request handed to a route handler.
#[derive(Clone)]
pub struct Route {
    ctx: Arc<RouteCtx>,
}

impl Route {
    fn new(inner: Arc<Inner>, meta: RouteRequest, body: Option<Vec<u8>>) -> Self {
        Self {
            ctx: Arc::new(RouteCtx {
                inner,
                meta,
                body,
                phase: Mutex::new(Phase::Deciding),
                overrides: Mutex::new(RequestOverrides::default()),
                signal: Mutex::new(None),
            }),
        }
    }

    /// Installs the chain signal for the next handler and re-opens the
    /// decision window unless a terminal action already happened.
    fn arm(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        *self.ctx.signal.lock() = Some(tx);
        let mut phase = self.ctx.phase.lock();
        if let Phase::FellBack = *phase {
            *phase = Phase::Deciding;
        }
        rx
    }

    fn is_handled(&self) -> bool {
        matches!(*self.ctx.phase.lock(), Phase::Handled)
    }

    fn signal(&self, terminal: bool) {
        if let Some(tx) = self.ctx.signal.lock().take() {
            let _ = tx.send(terminal);
        }
    }

    /// Marks the route terminally handled, or fails when it already was.
    fn begin_terminal(&self) -> Result<()> {
        let mut phase = self.ctx.phase.lock();
        match *phase {
            Phase::Deciding => {
                *phase = Phase::Handled;
                Ok(())
            }
            _ => Err(Error::AlreadyHandled),
        }
    }

    /// The request this route intercepts, with fallback overrides applied.
    pub fn request(&self) -> RequestView {
        let overrides = self.ctx.overrides.lock();
        RequestView {
            url: overrides
                .url
                .clone()
                .unwrap_or_else(|| self.ctx.meta.url.clone()),
            method: overrides
                .method
                .clone()
                .unwrap_or_else(|| self.ctx.meta.method.clone()),
            headers: overrides
                .headers
                .clone()
                .unwrap_or_else(|| self.ctx.meta.headers_array.clone()),
            post_data: overrides
                .post_data
                .clone()
                .or_else(|| self.ctx.body.clone()),
            resource_type: self.ctx.meta.resource_type.clone(),
            is_navigation_request: self.ctx.meta.is_navigation_request,
        }
    }

    /// Merges overrides and passes control to the next matching handler.
    pub fn fallback(&self, overrides: Option<RequestOverrides>) -> Result<()> {
        {
            let mut phase = self.ctx.phase.lock();
            match *phase {
                Phase::Deciding => *phase = Phase::FellBack,
                _ => return Err(Error::AlreadyHandled),
            }
        }
        if let Some(overrides) = overrides {
            self.ctx.overrides.lock().merge(overrides);
        }
        self.signal(false);
        Ok(())
    }

    /// Terminally continues the request, with any overrides merged in.
    /// Resolves once the host has performed the continue.
    pub async fn continue_(&self, overrides: Option<RequestOverrides>) -> Result<()> {
        self.begin_terminal()?;
        if let Some(overrides) = overrides {
            self.ctx.overrides.lock().merge(overrides);
        }
        self.perform_continue().await
    }

    async fn perform_continue(&self) -> Result<()> {
        let merged = self.ctx.overrides.lock().clone();
        let post_data = merged.post_data.clone().filter(|data| !data.is_empty());
        let action = RouteAction {
            id: self.ctx.meta.id,
            resolve_id: self.ctx.inner.next_route_resolve(),
            action: RouteActionKind::Continue,
            error_code: None,
            url: merged.url,
            method: merged.method,
            headers: merged.headers,
            status: None,
            has_post_data: post_data.as_ref().map(|_| true),
            has_body: None,
            path: None,
        };
        let resolve = self
            .ctx
            .inner
            .send_route_action(action, post_data.as_deref())
            .await?;
        check_resolve(resolve)?;
        self.signal(true);
        Ok(())
    }

    /// Terminally aborts the request.
    pub async fn abort(&self, error_code: Option<&str>) -> Result<()> {
        self.begin_terminal()?;
        let action = RouteAction {
            id: self.ctx.meta.id,
            resolve_id: self.ctx.inner.next_route_resolve(),
            action: RouteActionKind::Abort,
            error_code: Some(error_code.unwrap_or("failed").to_owned()),
            url: None,
            method: None,
            headers: None,
            status: None,
            has_post_data: None,
            has_body: None,
            path: None,
        };
        let resolve = self.ctx.inner.send_route_action(action, None).await?;
        check_resolve(resolve)?;
        self.signal(true);
        Ok(())
    }

    /// Terminally fulfills the request. Resolves only after the host has
    /// performed the fulfillment.
    pub async fn fulfill(&self, options: FulfillOptions) -> Result<()> {
        self.begin_terminal()?;
        let FulfillOptions {
            body,
            status,
            headers,
            content_type,
            path,
        } = options;
        let mut headers = headers.unwrap_or_default();
        if let Some(content_type) = content_type {
            headers.push(HeaderEntry {
                name: "content-type".into(),
                value: content_type,
            });
        }
        let bytes = body.map(FulfillBody::into_bytes).filter(|b| !b.is_empty());
        let action = RouteAction {
            id: self.ctx.meta.id,
            resolve_id: self.ctx.inner.next_route_resolve(),
            action: RouteActionKind::Fulfill,
            error_code: None,
            url: None,
            method: None,
            headers: Some(headers),
            status: Some(status.unwrap_or(200)),
            has_post_data: None,
            has_body: bytes.as_ref().map(|_| true),
            path,
        };
        let resolve = self
            .ctx
            .inner
            .send_route_action(action, bytes.as_deref())
            .await?;
        check_resolve(resolve)?;
        self.signal(true);
        Ok(())
    }

    /// Final continue for a request no handler terminally handled.
    async fn inner_continue(&self) -> Result<()> {
        {
            let mut phase = self.ctx.phase.lock();
            if matches!(*phase, Phase::Handled) {
                return Ok(());
            }
            *phase = Phase::Handled;
        }
        self.perform_continue().await
    }
}

fn check_resolve(resolve: RouteResolve) -> Result<()> {
    match resolve.error {
        Some(thrown) => Err(thrown_to_error(&thrown)),
        None => Ok(()),
    }
}

fn thrown_to_error(thrown: &SerializedValue) -> Error {
    match parse(thrown, None) {
        Ok((graph, root)) => Error::from_thrown(&RemoteValue::new(graph, root)),
        Err(err) => err.into(),
    }
}

/// Runs the handler chain for one intercepted request.
pub(crate) async fn dispatch_route(
    inner: Arc<Inner>,
    request: RouteRequest,
    body: Option<Vec<u8>>,
) {
    let url = match Url::parse(&request.url) {
        Ok(url) => url,
        Err(err) => {
            tracing::error!(target: "wp", url = %request.url, error = %err, "unparseable intercepted URL");
            let route = Route::new(inner, request, body);
            if let Err(err) = route.inner_continue().await {
                tracing::error!(target: "wp", error = %err, "inner continue failed");
            }
            return;
        }
    };

    // Snapshot the matching handlers in stack order (top of stack first).
    let matched: Vec<(u64, RouteHandlerFn)> = {
        let stack = inner.routes.stack.lock();
        stack
            .iter()
            .rev()
            .filter(|entry| entry.matcher.matches(&url))
            .map(|entry| (entry.id, Arc::clone(&entry.handler)))
            .collect()
    };

    let route = Route::new(Arc::clone(&inner), request, body);

    for (entry_id, handler) in matched {
        // Spend the handler's budget before it runs; an exhausted handler
        // leaves the stack so its own errors cannot affect later requests.
        let mut emptied = false;
        {
            let mut stack = inner.routes.stack.lock();
            if let Some(position) = stack.iter().position(|entry| entry.id == entry_id) {
                let expired = stack[position]
                    .times
                    .is_some_and(|times| stack[position].handled + 1 >= times);
                if expired {
                    stack.remove(position);
                    emptied = stack.is_empty();
                } else {
                    stack[position].handled += 1;
                }
            }
        }
        if emptied {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                if let Err(err) = sync_interception(&inner).await {
                    tracing::error!(target: "wp", error = %err, "toggle-off after expiry failed");
                }
            });
        }

        let decision = route.arm();
        let mut invocation = tokio::spawn(handler(route.clone()));
        let terminal = tokio::select! {
            signal = decision => signal.unwrap_or(false),
            finished = &mut invocation => {
                if let Ok(Err(err)) = &finished {
                    tracing::error!(target: "wp", error = %err, "route handler error");
                }
                // The handler returned without signalling; a terminal call
                // that completed inside it still ends the chain.
                route.is_handled()
            }
        };
        if terminal {
            return;
        }
    }

    if let Err(err) = route.inner_continue().await {
        tracing::error!(target: "wp", error = %err, "inner continue failed");
    }
}
