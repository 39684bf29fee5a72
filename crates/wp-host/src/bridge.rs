//! The bridge endpoint: one session, one page lifetime.
//!
//! A [`Session`] owns the target vector and the parked-route list, tracks
//! the currently attached client, and runs the message loop for each
//! WebSocket connection that completes the UUID handshake. Reconnections
//! bump a generation counter the runner watches to tell a rerun from a
//! duplicate observation of one navigation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use wp_runtime::message::{
    BridgeMessage, HandleMessage, RouteMessage, RouteResolve,
};
use wp_runtime::transport::{link, Frame, MessageSender, TransportParts};

use crate::engine::{BrowserContext, HostValue, InterceptedRoute, Page};
use crate::error::{Error, Result};
use crate::{handle, route};

/// The reserved bridge path on the bundle server.
pub const BRIDGE_PATH: &str = "/__wrightplay__";

struct EngineBinding {
    context: Arc<dyn BrowserContext>,
    page: Arc<dyn Page>,
}

/// One page lifetime's worth of bridge state.
pub struct Session {
    uuid: String,
    pub(crate) targets: Mutex<crate::targets::TargetVec>,
    parked: Mutex<Vec<Option<Arc<dyn InterceptedRoute>>>>,
    client: Mutex<Option<MessageSender>>,
    engine: Mutex<Option<EngineBinding>>,
    generation: AtomicU32,
    reconnected: Notify,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            uuid: Uuid::new_v4().to_string(),
            targets: Mutex::new(crate::targets::TargetVec::new()),
            parked: Mutex::new(Vec::new()),
            client: Mutex::new(None),
            engine: Mutex::new(None),
            generation: AtomicU32::new(0),
            reconnected: Notify::new(),
        })
    }

    /// The session UUID the handshake and the bypass marker are keyed by.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Binds the engine objects and seeds the reserved target slots:
    /// id 0 is the browsing context, id 1 the page.
    pub fn install_engine(&self, context: Arc<dyn BrowserContext>, page: Arc<dyn Page>) {
        self.targets.lock().seed(
            HostValue::Object(context.remote_object()),
            HostValue::Object(page.remote_object()),
        );
        *self.engine.lock() = Some(EngineBinding { context, page });
    }

    pub(crate) fn context(&self) -> Result<Arc<dyn BrowserContext>> {
        self.engine
            .lock()
            .as_ref()
            .map(|binding| Arc::clone(&binding.context))
            .ok_or_else(|| Error::Engine("no engine bound to the session".into()))
    }

    /// The bound page, when an engine is installed.
    pub fn page(&self) -> Result<Arc<dyn Page>> {
        self.engine
            .lock()
            .as_ref()
            .map(|binding| Arc::clone(&binding.page))
            .ok_or_else(|| Error::Engine("no engine bound to the session".into()))
    }

    /// How many clients have completed the handshake so far.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Resolves once the generation moves past `seen`, i.e. a client
    /// (re)connected.
    pub async fn wait_for_reconnect(&self, seen: u32) -> u32 {
        loop {
            let current = self.generation();
            if current > seen {
                return current;
            }
            self.reconnected.notified().await;
        }
    }

    pub(crate) fn client_sender(&self) -> Option<MessageSender> {
        self.client.lock().clone()
    }

    pub(crate) fn park_route(&self, route: Arc<dyn InterceptedRoute>) -> u32 {
        let mut parked = self.parked.lock();
        let id = parked.len() as u32;
        parked.push(Some(route));
        id
    }

    pub(crate) fn take_route(&self, id: u32) -> Result<Arc<dyn InterceptedRoute>> {
        self.parked
            .lock()
            .get_mut(id as usize)
            .and_then(Option::take)
            .ok_or(Error::UnknownRoute(id))
    }

    /// Drops every parked route, continuing each so the page is not left
    /// waiting on responses that will never come.
    pub(crate) async fn flush_parked(&self) {
        let routes: Vec<_> = {
            let mut parked = self.parked.lock();
            parked.iter_mut().filter_map(Option::take).collect()
        };
        for parked in routes {
            if let Err(err) = parked.continue_with(Default::default()).await {
                tracing::debug!(target: "wp", error = %err, "continue of a dropped route failed");
            }
        }
    }

    /// Attaches or detaches the universal matcher on the context.
    pub(crate) async fn set_interception(self: &Arc<Self>, enable: bool) -> Result<()> {
        let context = self.context()?;
        if enable {
            let weak = Arc::downgrade(self);
            let handler: crate::engine::InterceptHandler = Arc::new(move |intercepted| {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(session) = weak.upgrade() {
                        route::handle_intercepted(session, intercepted).await;
                    }
                })
            });
            context.set_interception(Some(handler)).await
        } else {
            context.set_interception(None).await?;
            self.flush_parked().await;
            Ok(())
        }
    }

    /// Runs the message loop for one connected client. The first text
    /// frame must be the session UUID; anything else is not harness
    /// traffic and the socket is dropped.
    pub async fn serve_client(self: Arc<Self>, parts: TransportParts) {
        let (sender, mut receiver) = link(parts);
        match receiver.recv_raw_text().await {
            Some(Ok(handshake)) if handshake == self.uuid => {}
            Some(Ok(other)) => {
                tracing::warn!(target: "wp", got = %other, "bridge handshake mismatch");
                return;
            }
            _ => return,
        }

        *self.client.lock() = Some(sender.clone());
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.reconnected.notify_waiters();
        tracing::debug!(target: "wp", session = %self.uuid, "bridge client attached");

        while let Some(next) = receiver.recv().await {
            let envelope = match next {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::error!(target: "wp", error = %err, "bridge message error");
                    continue;
                }
            };
            match envelope.message {
                BridgeMessage::Handle(HandleMessage::Request(request)) => {
                    let session = Arc::clone(&self);
                    let sender = sender.clone();
                    tokio::spawn(async move {
                        let resolve = handle::process(&session, request).await;
                        let message =
                            BridgeMessage::Handle(HandleMessage::Resolve(resolve));
                        if let Err(err) = sender.send(&message, None) {
                            tracing::debug!(target: "wp", error = %err, "handle resolve dropped");
                        }
                    });
                }
                BridgeMessage::Route(RouteMessage::Toggle(toggle)) => {
                    // Toggles are acknowledged in order; the client queues
                    // the next transition behind this acknowledgement.
                    let error = match self.set_interception(toggle.enable).await {
                        Ok(()) => None,
                        Err(err) => {
                            tracing::error!(target: "wp", error = %err, "interception toggle failed");
                            Some(handle::thrown_value(&err))
                        }
                    };
                    let resolve = BridgeMessage::Route(RouteMessage::Resolve(RouteResolve {
                        id: None,
                        resolve_id: toggle.resolve_id,
                        error,
                    }));
                    if let Err(err) = sender.send(&resolve, None) {
                        tracing::debug!(target: "wp", error = %err, "toggle resolve dropped");
                    }
                }
                BridgeMessage::Route(RouteMessage::Action(action)) => {
                    let session = Arc::clone(&self);
                    let sender = sender.clone();
                    let body = envelope.body;
                    tokio::spawn(route::perform_action(session, sender, action, body));
                }
                other => {
                    tracing::error!(target: "wp", message = ?other, "unexpected message on the host");
                }
            }
        }

        // Client gone: stop forwarding and drop parked routes.
        {
            let mut client = self.client.lock();
            if client
                .as_ref()
                .is_some_and(|current| current.same_channel(&sender))
            {
                *client = None;
            }
        }
        self.flush_parked().await;
        tracing::debug!(target: "wp", session = %self.uuid, "bridge client detached");
    }
}

/// Adapts an accepted axum WebSocket into the frame-channel shape and
/// serves it as a bridge client.
pub(crate) async fn serve_socket(session: Arc<Session>, socket: WebSocket) {
    use futures::{SinkExt, StreamExt};

    let (mut sink, mut stream) = socket.split();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                Frame::Text(text) => WsMessage::Text(text.into()),
                Frame::Binary(bytes) => WsMessage::Binary(bytes.into()),
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let frame = match message {
                Ok(WsMessage::Text(text)) => Frame::Text(text.to_string()),
                Ok(WsMessage::Binary(bytes)) => Frame::Binary(bytes.to_vec()),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    tracing::debug!(target: "wp", error = %err, "bridge socket read failed");
                    break;
                }
            };
            if inbound_tx.send(frame).is_err() {
                break;
            }
        }
    });

    session
        .serve_client(TransportParts {
            tx: outbound_tx,
            rx: inbound_rx,
        })
        .await;

    reader.abort();
    writer.abort();
}
