//! The browser-visible harness surface.
//!
//! A [`Harness`] is one page's connection to the host: it owns the bridge
//! client, the route stack, and the init/done lifecycle that any user test
//! framework drives itself through.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use wp_runtime::message::{CONTEXT_TARGET_ID, PAGE_TARGET_ID};
use wp_runtime::transport::{link, TransportParts};

use crate::client::{self, Inner};
use crate::env::{FetchRequest, FetchResponse, PageEnvironment};
use crate::error::Result;
use crate::handle::Handle;
use crate::matcher::RouteMatcher;
use crate::route::{self, RouteHandlerFn};

/// Boxed init callback.
pub type InitFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type InitCallback = Box<dyn FnOnce() -> InitFuture + Send>;

struct HarnessShared {
    inner: Arc<Inner>,
    init: Mutex<VecDeque<InitCallback>>,
    done: AtomicBool,
}

/// One page's test harness.
#[derive(Clone)]
pub struct Harness {
    shared: Arc<HarnessShared>,
}

impl Harness {
    /// Opens the bridge over `parts`: sends the session UUID handshake and
    /// starts the dispatch task.
    pub fn connect(
        parts: TransportParts,
        session: impl Into<String>,
        env: Arc<dyn PageEnvironment>,
    ) -> Result<Self> {
        let session = session.into();
        let (sender, receiver) = link(parts);
        sender.send_raw_text(&session)?;
        let inner = Arc::new(Inner::new(session, sender, env));
        tokio::spawn(client::run(Arc::clone(&inner), receiver));
        Ok(Self {
            shared: Arc::new(HarnessShared {
                inner,
                init: Mutex::new(VecDeque::new()),
                done: AtomicBool::new(false),
            }),
        })
    }

    /// Registers a callback run after the test imports complete. Callbacks
    /// run sequentially in registration order.
    pub fn on_init<F, Fut>(&self, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.shared
            .init
            .lock()
            .push_back(Box::new(move || Box::pin(callback())));
    }

    /// Runs the registered init callbacks. A throw stops the queue and
    /// reports `done(1)` unless done was already signalled.
    pub async fn run_init(&self) {
        loop {
            let next = self.shared.init.lock().pop_front();
            let Some(callback) = next else { break };
            if let Err(err) = callback().await {
                tracing::error!(target: "wp", error = %err, "init callback failed");
                self.done(1);
                return;
            }
        }
    }

    /// Signals test termination with `exit_code`. Only the first call has
    /// an effect.
    pub fn done(&self, exit_code: i32) {
        if !self.shared.done.swap(true, Ordering::SeqCst) {
            self.shared.inner.env.dispatch_done(exit_code);
        }
    }

    /// Whether `done` has been signalled.
    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::SeqCst)
    }

    /// Handle to the automation engine's page (reserved id 1).
    pub fn page_handle(&self) -> Handle {
        self.shared.inner.handle_for(PAGE_TARGET_ID)
    }

    /// Handle to the browsing context (reserved id 0).
    pub fn context_handle(&self) -> Handle {
        self.shared.inner.handle_for(CONTEXT_TARGET_ID)
    }

    /// Pushes a route handler onto the context's interception stack.
    pub async fn context_route(
        &self,
        matcher: RouteMatcher,
        handler: RouteHandlerFn,
        times: Option<u32>,
    ) -> Result<()> {
        self.shared.inner.routes.register(matcher, handler, times);
        route::sync_interception(&self.shared.inner).await
    }

    /// Removes matching handlers; with `handler`, only that registration.
    pub async fn context_unroute(
        &self,
        matcher: &RouteMatcher,
        handler: Option<&RouteHandlerFn>,
    ) -> Result<()> {
        self.shared.inner.routes.unregister(matcher, handler);
        route::sync_interception(&self.shared.inner).await
    }

    /// Performs a fetch that bypasses every matcher on the context. The
    /// marker header is stripped by the host before the request goes out.
    pub async fn bypass_fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let marked = request.header(
            format!("bypass-{}", self.shared.inner.session),
            "true",
        );
        self.shared.inner.env.fetch(marked).await
    }

    /// Plain fetch through the page environment (subject to interception).
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        self.shared.inner.env.fetch(request).await
    }

    /// The session UUID negotiated at handshake.
    pub fn session(&self) -> &str {
        &self.shared.inner.session
    }
}
