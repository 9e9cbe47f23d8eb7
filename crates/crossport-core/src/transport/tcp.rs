//! Loopback TCP transport.
//!
//! Every channel is its own TCP connection. The caller opens the connection,
//! sends a [`Handshake`] frame naming the channel, and from then on each
//! length-prefixed frame carries one JSON message. EOF in either direction is
//! the disconnect notification.
//!
//! Outbound channels are routed by module name: `route("Background", addr)`
//! sends every `"Background.*"` channel to `addr`.

use super::{Channel, Incoming, Transport};
use crate::config::ChannelConfig;
use crate::protocol::{module_of, read_message, write_message, Handshake};
use crate::{CrossportError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running accept loop. Dropping shuts it down.
pub struct TcpListenerHandle {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl TcpListenerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting channels and close every accepted channel.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for TcpListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Transport carrying each channel over its own TCP connection.
pub struct TcpTransport {
    routes: RwLock<HashMap<String, SocketAddr>>,
    incoming: Mutex<Option<Incoming>>,
    listener: Option<TcpListenerHandle>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    /// Create an outbound-only transport. Its listener never yields a channel.
    pub fn new() -> Self {
        let (_, incoming) = Incoming::channel();
        Self {
            routes: RwLock::new(HashMap::new()),
            incoming: Mutex::new(Some(incoming)),
            listener: None,
        }
    }

    /// Bind a listener and start accepting channels.
    ///
    /// Use port 0 for an OS-assigned port; [`TcpTransport::local_addr`]
    /// reports the result.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("Channel listener bound to {}", addr);

        let (incoming_tx, incoming) = Incoming::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(accept_loop(
            listener,
            incoming_tx,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(Self {
            routes: RwLock::new(HashMap::new()),
            incoming: Mutex::new(Some(incoming)),
            listener: Some(TcpListenerHandle {
                addr,
                shutdown_tx: Some(shutdown_tx),
                conn_shutdown_tx,
                task_handle: Some(task_handle),
            }),
        })
    }

    /// Route channels for `module_name` to `addr`.
    pub fn with_route(self, module_name: impl Into<String>, addr: SocketAddr) -> Self {
        self.add_route(module_name, addr);
        self
    }

    pub fn add_route(&self, module_name: impl Into<String>, addr: SocketAddr) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module_name.into(), addr);
    }

    /// Address of the bound listener, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(TcpListenerHandle::addr)
    }

    /// Stop the listener, closing every accepted channel.
    pub fn shutdown(&mut self) {
        if let Some(listener) = self.listener.as_mut() {
            listener.shutdown();
        }
    }

    fn route(&self, module_name: &str) -> Option<SocketAddr> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module_name)
            .copied()
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, name: &str) -> Result<Channel> {
        let module = module_of(name).ok_or_else(|| {
            CrossportError::channel_unavailable(name, "channel name has no module part")
        })?;
        let addr = self.route(module).ok_or_else(|| {
            CrossportError::channel_unavailable(name, format!("no route for module {}", module))
        })?;

        let mut stream = tokio::time::timeout(ChannelConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CrossportError::channel_unavailable(name, format!("connect to {} timed out", addr)))?
            .map_err(|e| CrossportError::channel_unavailable(name, format!("connect to {}: {}", addr, e)))?;

        let handshake = serde_json::to_value(Handshake {
            channel: name.to_string(),
        })?;
        write_message(&mut stream, &handshake)
            .await
            .map_err(|e| CrossportError::channel_unavailable(name, e.to_string()))?;

        debug!("TCP channel {} connected to {}", name, addr);

        let (channel, pump) = bridge(stream, name, None);
        tokio::spawn(pump);
        Ok(channel)
    }

    fn listen(&self) -> Result<Incoming> {
        self.incoming
            .lock()
            .map_err(|_| CrossportError::Other("tcp transport lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| CrossportError::configuration("tcp transport is already listening"))
    }
}

async fn accept_loop(
    listener: TcpListener,
    incoming_tx: mpsc::UnboundedSender<Channel>,
    mut shutdown_rx: oneshot::Receiver<()>,
    conn_shutdown_rx: watch::Receiver<bool>,
    active_connections: Arc<AtomicUsize>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("Channel listener shutting down");
                break;
            }
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let current = active_connections.load(Ordering::Relaxed);
                        if current >= ChannelConfig::MAX_CONNECTIONS {
                            warn!(
                                "Rejecting channel from {}: at max capacity ({})",
                                peer_addr,
                                ChannelConfig::MAX_CONNECTIONS
                            );
                            continue;
                        }

                        active_connections.fetch_add(1, Ordering::Relaxed);
                        let incoming_tx = incoming_tx.clone();
                        let conns = active_connections.clone();
                        let conn_shutdown = conn_shutdown_rx.clone();

                        tokio::spawn(async move {
                            if let Err(e) = accept_channel(stream, incoming_tx, conn_shutdown).await {
                                debug!("Channel from {} ended: {}", peer_addr, e);
                            }
                            conns.fetch_sub(1, Ordering::Relaxed);
                        });
                    }
                    Err(e) => {
                        error!("Channel accept error: {}", e);
                    }
                }
            }
        }
    }
}

async fn accept_channel(
    mut stream: TcpStream,
    incoming_tx: mpsc::UnboundedSender<Channel>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let first = tokio::time::timeout(ChannelConfig::CONNECT_TIMEOUT, read_message(&mut stream))
        .await
        .map_err(|_| CrossportError::ProtocolViolation {
            message: "no handshake received".to_string(),
        })??
        .ok_or_else(|| CrossportError::ProtocolViolation {
            message: "connection closed before handshake".to_string(),
        })?;

    let handshake: Handshake =
        serde_json::from_value(first).map_err(|e| CrossportError::ProtocolViolation {
            message: format!("malformed handshake: {}", e),
        })?;

    debug!("Accepted TCP channel {}", handshake.channel);

    let (channel, pump) = bridge(stream, &handshake.channel, Some(shutdown));
    incoming_tx
        .send(channel)
        .map_err(|_| CrossportError::channel_unavailable(&handshake.channel, "no listener"))?;

    pump.await;
    Ok(())
}

/// Pair a connected stream with a [`Channel`].
///
/// The returned future pumps frames in both directions until either side
/// disconnects or `shutdown` fires.
fn bridge(
    stream: TcpStream,
    name: &str,
    shutdown: Option<watch::Receiver<bool>>,
) -> (Channel, impl Future<Output = ()> + Send + 'static) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Value>();
    let channel = Channel::from_parts(name, out_tx, in_rx);
    let name = name.to_string();

    let pump = async move {
        let (mut reader, mut writer) = stream.into_split();

        let inbound = async {
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(message)) => {
                        if in_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        debug!("TCP channel {} read failed: {}", name, e);
                        break;
                    }
                }
            }
        };

        let outbound = async {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = write_message(&mut writer, &message).await {
                    debug!("TCP channel {} write failed: {}", name, e);
                    break;
                }
            }
            let _ = writer.shutdown().await;
        };

        let stopped = async {
            match shutdown {
                Some(mut rx) => {
                    let _ = rx.changed().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = inbound => {}
            _ = outbound => {}
            _ = stopped => {}
        }

        debug!("TCP channel {} closed", name);
    };

    (channel, pump)
}
