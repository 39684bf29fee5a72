//! Bridge client connection internals.
//!
//! One dispatch task reads the bridge; replies are correlated back to their
//! waiting callers by `(id, resolveID)` oneshot channels, and incoming
//! route requests fan out to their own tasks so several can be in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use wp_runtime::message::{
    BridgeMessage, HandleMessage, HandleRequest, HandleResolve, RouteMessage, RouteResolve,
    RouteToggle,
};
use wp_runtime::transport::{MessageReceiver, MessageSender};

use crate::env::PageEnvironment;
use crate::error::{Error, Result};
use crate::handle::HandleShared;
use crate::route::RouteSet;

pub(crate) struct Inner {
    pub(crate) session: String,
    pub(crate) sender: MessageSender,
    pub(crate) env: Arc<dyn PageEnvironment>,
    pub(crate) routes: RouteSet,
    pub(crate) handles: Mutex<HashMap<u32, Weak<HandleShared>>>,
    waiters: Mutex<Waiters>,
    next_route_resolve: AtomicU32,
}

#[derive(Default)]
struct Waiters {
    handle: HashMap<(u32, u32), oneshot::Sender<HandleResolve>>,
    route: HashMap<(u32, u32), oneshot::Sender<RouteResolve>>,
    toggle: HashMap<u32, oneshot::Sender<RouteResolve>>,
}

impl Inner {
    pub(crate) fn new(
        session: String,
        sender: MessageSender,
        env: Arc<dyn PageEnvironment>,
    ) -> Self {
        Self {
            session,
            sender,
            env,
            routes: RouteSet::new(),
            handles: Mutex::new(HashMap::new()),
            waiters: Mutex::new(Waiters::default()),
            next_route_resolve: AtomicU32::new(0),
        }
    }

    pub(crate) fn next_route_resolve(&self) -> u32 {
        self.next_route_resolve.fetch_add(1, Ordering::SeqCst)
    }

    /// Sends a handle request and awaits the correlated resolve.
    pub(crate) async fn send_handle_request(
        &self,
        request: HandleRequest,
    ) -> Result<HandleResolve> {
        let key = (request.id, request.resolve_id);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().handle.insert(key, tx);
        let outcome = self
            .sender
            .send(&BridgeMessage::Handle(HandleMessage::Request(request)), None);
        if let Err(err) = outcome {
            self.waiters.lock().handle.remove(&key);
            return Err(err.into());
        }
        rx.await
            .map_err(|_| Error::Runtime(wp_runtime::Error::ChannelClosed))
    }

    /// Sends a route action (with its optional body frame) and awaits the
    /// host acknowledgement.
    pub(crate) async fn send_route_action(
        &self,
        action: wp_runtime::message::RouteAction,
        body: Option<&[u8]>,
    ) -> Result<RouteResolve> {
        let key = (action.id, action.resolve_id);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().route.insert(key, tx);
        let outcome = self
            .sender
            .send(&BridgeMessage::Route(RouteMessage::Action(action)), body);
        if let Err(err) = outcome {
            self.waiters.lock().route.remove(&key);
            return Err(err.into());
        }
        rx.await
            .map_err(|_| Error::Runtime(wp_runtime::Error::ChannelClosed))
    }

    /// Sends an interception toggle and awaits its acknowledgement.
    pub(crate) async fn send_toggle(&self, enable: bool) -> Result<()> {
        let resolve_id = self.next_route_resolve();
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().toggle.insert(resolve_id, tx);
        let message = BridgeMessage::Route(RouteMessage::Toggle(RouteToggle {
            enable,
            resolve_id,
        }));
        if let Err(err) = self.sender.send(&message, None) {
            self.waiters.lock().toggle.remove(&resolve_id);
            return Err(err.into());
        }
        rx.await
            .map_err(|_| Error::Runtime(wp_runtime::Error::ChannelClosed))?;
        Ok(())
    }

    /// Returns the proxy for target `id`, sharing the refcount with any
    /// live proxy for the same id.
    pub(crate) fn handle_for(self: &Arc<Self>, id: u32) -> crate::handle::Handle {
        let mut handles = self.handles.lock();
        if let Some(existing) = handles.get(&id).and_then(Weak::upgrade) {
            return crate::handle::Handle::from_shared(existing);
        }
        let shared = Arc::new(HandleShared::new(id, Arc::clone(self)));
        handles.insert(id, Arc::downgrade(&shared));
        crate::handle::Handle::from_shared(shared)
    }
}

/// The dispatch loop. Runs until the bridge closes; then outstanding
/// waiters are dropped so their callers observe a closed channel.
pub(crate) async fn run(inner: Arc<Inner>, mut receiver: MessageReceiver) {
    while let Some(next) = receiver.recv().await {
        let envelope = match next {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(target: "wp", error = %err, "bridge message error");
                continue;
            }
        };
        match envelope.message {
            BridgeMessage::Handle(HandleMessage::Resolve(resolve)) => {
                let waiter = inner
                    .waiters
                    .lock()
                    .handle
                    .remove(&(resolve.id, resolve.resolve_id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resolve);
                    }
                    // Fire-and-forget disposals are acknowledged without a
                    // registered waiter.
                    None => tracing::debug!(
                        target: "wp",
                        id = resolve.id,
                        resolve_id = resolve.resolve_id,
                        "handle resolve without waiter"
                    ),
                }
            }
            BridgeMessage::Route(RouteMessage::Resolve(resolve)) => {
                let waiter = match resolve.id {
                    Some(id) => inner.waiters.lock().route.remove(&(id, resolve.resolve_id)),
                    None => inner.waiters.lock().toggle.remove(&resolve.resolve_id),
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(resolve);
                    }
                    None => tracing::error!(
                        target: "wp",
                        resolve_id = resolve.resolve_id,
                        "route resolve without waiter"
                    ),
                }
            }
            BridgeMessage::Route(RouteMessage::Request(request)) => {
                let inner = Arc::clone(&inner);
                let body = envelope.body;
                tokio::spawn(crate::route::dispatch_route(inner, request, body));
            }
            other => {
                tracing::error!(target: "wp", message = ?other, "unexpected message on the client");
            }
        }
    }
    // Bridge closed: dropping the waiters rejects everything still pending.
    let mut waiters = inner.waiters.lock();
    waiters.handle.clear();
    waiters.route.clear();
    waiters.toggle.clear();
}
