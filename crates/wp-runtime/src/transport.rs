//! Bridge transports.
//!
//! The bridge is a single duplex channel of text and binary frames. Text
//! frames are JSON messages; binary frames are never standalone, they carry
//! the body announced by the immediately preceding text frame in the same
//! direction. [`link`] wraps a raw frame channel into a message-level
//! sender/receiver pair that enforces that discipline with a one-shot
//! expect-body flag.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::message::BridgeMessage;

pub mod ws;

/// One frame on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// The two halves of a frame channel, as handed to a peer.
pub struct TransportParts {
    pub tx: mpsc::UnboundedSender<Frame>,
    pub rx: mpsc::UnboundedReceiver<Frame>,
}

/// An in-process duplex transport pair. Frames sent on one side arrive on
/// the other in order.
pub fn memory_pair() -> (TransportParts, TransportParts) {
    let (left_tx, right_rx) = mpsc::unbounded_channel();
    let (right_tx, left_rx) = mpsc::unbounded_channel();
    (
        TransportParts {
            tx: left_tx,
            rx: left_rx,
        },
        TransportParts {
            tx: right_tx,
            rx: right_rx,
        },
    )
}

/// Splits a frame channel into a message-level sender and receiver.
pub fn link(parts: TransportParts) -> (MessageSender, MessageReceiver) {
    let TransportParts { tx, rx } = parts;
    (
        MessageSender {
            tx,
            order: Arc::new(Mutex::new(())),
        },
        MessageReceiver { rx },
    )
}

/// Sends bridge messages, keeping a message and its body frame adjacent
/// even when multiple tasks send concurrently.
#[derive(Clone)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<Frame>,
    order: Arc<Mutex<()>>,
}

impl MessageSender {
    /// Sends one message, plus its body when the message announces one.
    /// A body that the message does not announce is a caller bug and is
    /// rejected before anything is written.
    pub fn send(&self, message: &BridgeMessage, body: Option<&[u8]>) -> Result<()> {
        if message.announces_body() != body.is_some() {
            return Err(Error::Protocol(format!(
                "message/body mismatch: announces_body={}, body={}",
                message.announces_body(),
                body.is_some()
            )));
        }
        let text = serde_json::to_string(message)?;
        let _ordered = self.order.lock();
        self.tx
            .send(Frame::Text(text))
            .map_err(|_| Error::ChannelClosed)?;
        if let Some(body) = body {
            self.tx
                .send(Frame::Binary(body.to_vec()))
                .map_err(|_| Error::ChannelClosed)?;
        }
        Ok(())
    }

    /// Sends a bare text frame; used for the session handshake only.
    pub fn send_raw_text(&self, text: &str) -> Result<()> {
        self.tx
            .send(Frame::Text(text.to_owned()))
            .map_err(|_| Error::ChannelClosed)
    }

    /// True when the peer is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// True when both senders feed the same underlying channel.
    pub fn same_channel(&self, other: &MessageSender) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// A received message with its body, when one was announced.
#[derive(Debug)]
pub struct Envelope {
    pub message: BridgeMessage,
    pub body: Option<Vec<u8>>,
}

/// Receives bridge messages, pairing each announced body with its message.
pub struct MessageReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MessageReceiver {
    /// Receives the next message. `None` means the channel closed. A binary
    /// frame arriving when no body is expected is a protocol error.
    pub async fn recv(&mut self) -> Option<Result<Envelope>> {
        let frame = self.rx.recv().await?;
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(_) => {
                return Some(Err(Error::Protocol(
                    "standalone binary frame without a preceding announcement".into(),
                )));
            }
        };
        let message: BridgeMessage = match serde_json::from_str(&text) {
            Ok(message) => message,
            Err(err) => return Some(Err(Error::Json(err))),
        };
        if !message.announces_body() {
            return Some(Ok(Envelope {
                message,
                body: None,
            }));
        }
        // One-shot expectation: the very next frame must be the body.
        match self.rx.recv().await {
            Some(Frame::Binary(body)) => Some(Ok(Envelope {
                message,
                body: Some(body),
            })),
            Some(Frame::Text(_)) => Some(Err(Error::Protocol(
                "expected a body frame, received text".into(),
            ))),
            None => Some(Err(Error::ChannelClosed)),
        }
    }

    /// Receives a bare text frame; used for the session handshake only.
    pub async fn recv_raw_text(&mut self) -> Option<Result<String>> {
        match self.rx.recv().await? {
            Frame::Text(text) => Some(Ok(text)),
            Frame::Binary(_) => Some(Err(Error::Protocol(
                "expected a text handshake frame".into(),
            ))),
        }
    }
}
