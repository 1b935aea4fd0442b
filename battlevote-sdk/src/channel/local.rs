//! In-process relay.
//!
//! Behaves like the real relay from a client's point of view: every frame a
//! peer sends is fanned out to every connected peer, the sender included.
//! Used for offline runs (several engines in one process) and by tests, which
//! can also take it offline, cut connections and inject raw frames.

use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::transport::{Connection, Connector};

#[derive(Default)]
struct RelayState {
    online: bool,
    next_peer: u64,
    peers: Vec<(u64, mpsc::UnboundedSender<String>)>,
    /// Every frame received from any peer, in arrival order.
    received: Vec<String>,
    connect_attempts: usize,
}

/// Shared handle to an in-process relay. Cheap to clone.
#[derive(Clone)]
pub struct LocalRelay {
    state: Arc<Mutex<RelayState>>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RelayState {
                online: true,
                ..RelayState::default()
            })),
        }
    }

    /// While offline, connection attempts fail.
    pub fn set_online(&self, online: bool) {
        self.state.lock().online = online;
    }

    /// Close every peer connection from the relay side.
    pub fn drop_connections(&self) {
        self.state.lock().peers.clear();
    }

    /// Deliver a raw frame to every peer, as if another client sent it.
    pub fn inject(&self, frame: &str) {
        self.fan_out(frame);
    }

    /// Frames received from peers so far.
    pub fn received(&self) -> Vec<String> {
        self.state.lock().received.clone()
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.lock().connect_attempts
    }

    fn fan_out(&self, frame: &str) {
        let mut state = self.state.lock();
        state
            .peers
            .retain(|(_, tx)| tx.send(frame.to_string()).is_ok());
    }

    fn attach(&self) -> Result<Connection> {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let peer = {
            let mut state = self.state.lock();
            state.connect_attempts += 1;
            if !state.online {
                anyhow::bail!("relay offline");
            }
            let id = state.next_peer;
            state.next_peer += 1;
            state.peers.push((id, in_tx));
            id
        };

        let relay = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                relay.state.lock().received.push(frame.clone());
                relay.fan_out(&frame);
            }
            relay.state.lock().peers.retain(|(id, _)| *id != peer);
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl Connector for LocalRelay {
    fn connect<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, Result<Connection>> {
        let result = self.attach();
        async move { result }.boxed()
    }
}
