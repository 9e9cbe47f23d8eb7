//! Channel transport abstraction.
//!
//! A transport opens named, ordered, bidirectional JSON channels and delivers
//! channels opened by peers to the single listener of this process. The rest
//! of the crate only sees [`Channel`], [`Incoming`] and the [`Transport`]
//! trait, so contexts can talk in-process ([`memory`]) or over loopback TCP
//! ([`tcp`]) without any other change.
//!
//! Disconnect is signalled by dropping a channel: the peer's `recv` returns
//! `None` and the peer's [`ChannelSender::closed`] completes.

pub mod memory;
pub mod tcp;

pub use memory::{MemoryHub, MemoryTransport};
pub use tcp::{TcpListenerHandle, TcpTransport};

use crate::{CrossportError, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Send half of a channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    id: u64,
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Value>,
}

impl ChannelSender {
    /// Identity of the channel this sender belongs to.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a message to the peer.
    pub fn send(&self, message: Value) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| CrossportError::channel_unavailable(&*self.name, "peer disconnected"))
    }

    /// Whether the peer has disconnected.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Completes once the peer has disconnected.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// One end of a named, ordered, bidirectional message pipe.
#[derive(Debug)]
pub struct Channel {
    sender: ChannelSender,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl Channel {
    /// Assemble a channel from an outbound queue and an inbound queue.
    ///
    /// Transports that bridge an external connection use this to hand the
    /// core a channel whose queues they pump.
    pub fn from_parts(
        name: impl Into<String>,
        tx: mpsc::UnboundedSender<Value>,
        rx: mpsc::UnboundedReceiver<Value>,
    ) -> Self {
        let name: String = name.into();
        Self {
            sender: ChannelSender {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                name: Arc::from(name),
                tx,
            },
            rx,
        }
    }

    /// Create two connected ends of a channel with the same name.
    pub fn pair(name: impl Into<String>) -> (Channel, Channel) {
        let name: String = name.into();
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Channel::from_parts(name.clone(), a_tx, a_rx),
            Channel::from_parts(name, b_tx, b_rx),
        )
    }

    pub fn name(&self) -> &str {
        self.sender.name()
    }

    pub fn id(&self) -> u64 {
        self.sender.id()
    }

    pub fn send(&self, message: Value) -> Result<()> {
        self.sender.send(message)
    }

    /// A cloneable handle for sending on this channel.
    pub fn sender(&self) -> ChannelSender {
        self.sender.clone()
    }

    /// Receive the next message, or `None` once the peer has disconnected.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<Value>> {
        self.rx.poll_recv(cx)
    }

    /// Disconnect from the peer.
    pub fn disconnect(self) {
        drop(self);
    }
}

/// Stream of channels opened by peers.
#[derive(Debug)]
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<Channel>,
}

impl Incoming {
    /// Create an incoming stream and the sender a transport feeds it with.
    pub fn channel() -> (mpsc::UnboundedSender<Channel>, Incoming) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Incoming { rx })
    }

    /// Wait for the next inbound channel. `None` once the transport stops.
    pub async fn next(&mut self) -> Option<Channel> {
        self.rx.recv().await
    }
}

/// Host capability for opening and accepting channels.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a channel to whichever context publishes `name`.
    async fn connect(&self, name: &str) -> Result<Channel>;

    /// Start receiving channels opened by peers.
    ///
    /// A transport has exactly one listener; a second call fails with a
    /// configuration error.
    fn listen(&self) -> Result<Incoming>;
}
