//! WebSocket transport for a native bridge peer.
//!
//! Bridges a `tokio-tungstenite` client socket to the frame-channel shape
//! the rest of the runtime consumes. Pumping happens on two spawned tasks;
//! when either side goes away, both channels close and the peer observes
//! end-of-stream.

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};
use crate::transport::{Frame, TransportParts};

/// The negotiated bridge sub-protocol.
pub const SUBPROTOCOL: &str = "route";

/// Connects to a bridge endpoint, negotiating the `route` sub-protocol.
pub async fn connect(url: &str) -> Result<TransportParts> {
    let mut request = url
        .into_client_request()
        .map_err(|err| Error::Transport(format!("invalid bridge URL {url}: {err}")))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(SUBPROTOCOL),
    );

    let (socket, _response) = connect_async(request)
        .await
        .map_err(|err| Error::Transport(format!("bridge connect failed: {err}")))?;
    let (mut sink, mut stream) = socket.split();

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                Frame::Text(text) => Message::Text(text.into()),
                Frame::Binary(bytes) => Message::Binary(bytes.into()),
            };
            if let Err(err) = sink.send(message).await {
                tracing::debug!(target: "wp", error = %err, "bridge socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let frame = match message {
                Ok(Message::Text(text)) => Frame::Text(text.to_string()),
                Ok(Message::Binary(bytes)) => Frame::Binary(bytes.to_vec()),
                Ok(Message::Close(_)) => break,
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

    Ok(TransportParts {
        tx: outbound_tx,
        rx: inbound_rx,
    })
}
