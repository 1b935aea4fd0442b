//! Transport seam between the channel and the wire.
//!
//! A [`Connector`] opens one connection to the relay and hands back a pair of
//! text pipes. The channel never sees sockets; it only sees frames, and the
//! end of the inbound pipe means the connection closed.

use std::fmt;

use anyhow::Result;
use futures::future::BoxFuture;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};

/// An open relay connection.
///
/// Dropping `outbound` closes the connection. `inbound` yields `None` once
/// the remote side is gone.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens connections to a relay.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Connection>>;
}

/// Relay over WebSocket text frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Connection>> {
        async move {
            tracing::debug!("Connecting to relay {url}...");
            let (ws, _response) = tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| anyhow::anyhow!("WebSocket connect to {url} failed: {e}"))?;
            tracing::debug!("WebSocket handshake with {url} complete");

            let (sink, stream) = ws.split();
            Ok(bridge(sink, stream))
        }
        .boxed()
    }
}

/// Pump a split socket into a [`Connection`].
///
/// A failed write ends the inbound pipe too, so the channel sees the
/// connection as lost instead of waiting on a half-dead socket.
fn bridge<Si, St>(mut sink: Si, mut stream: St) -> Connection
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: fmt::Display,
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
    let (writer_done_tx, mut writer_done) = oneshot::channel::<()>();

    // Channel → socket. Ends when the channel drops its sender.
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::warn!("WebSocket write failed: {e}");
                let _ = writer_done_tx.send(());
                return;
            }
        }
        let _ = sink.close().await;
    });

    // Socket → channel. Dropping `in_tx` signals the close.
    tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket read failed: {e}");
                        break;
                    }
                },
                // Writer gone: either it failed or the channel hung up.
                _ = &mut writer_done => break,
            }
        }
    });

    Connection {
        outbound: out_tx,
        inbound: in_rx,
    }
}
