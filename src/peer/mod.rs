//! Peer connections.
//!
//! This module provides:
//! - The pre-handshake connection state and the handshake itself
//! - The authenticated [`Peer`] wrapping a multiplexed connection
//! - The size-bounded [`PeerSet`]

pub mod set;

pub use set::PeerSet;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use crate::connection::{
    ChannelDescriptor, Frame, FrameCodec, FrameStream, MultiplexConn, SendBackend, TrafficStatus,
};
use crate::error::{P2pError, P2pResult};
use crate::netaddress::NetAddress;
use crate::node_info::{NodeInfo, ServiceFlags};
use crate::reactor::ReactorRegistry;

/// Direction of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote connected to us.
    Inbound,
    /// We initiated the connection.
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Raised by a connection task when the peer must be torn down.
/// Emitted at most once per peer.
#[derive(Debug)]
pub(crate) struct PeerStopEvent {
    pub peer_id: String,
    pub reason: String,
}

/// Pre-handshake connection state.
pub(crate) struct PeerConn {
    pub direction: Direction,
    pub remote: SocketAddr,
    stream: TcpStream,
}

/// A connection that has completed the node-info exchange but is not yet
/// a registered peer.
pub(crate) struct HandshakenConn {
    pub framed: Framed<TcpStream, FrameCodec>,
    pub node_info: NodeInfo,
    pub direction: Direction,
    pub remote: SocketAddr,
}

impl PeerConn {
    /// Wrap an accepted inbound connection.
    pub fn inbound(stream: TcpStream) -> P2pResult<Self> {
        let remote = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %remote, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(Self {
            direction: Direction::Inbound,
            remote,
            stream,
        })
    }

    /// Dial an outbound connection with a connect timeout.
    pub async fn dial(addr: &NetAddress, dial_timeout: Duration) -> P2pResult<Self> {
        let socket_addr = addr.socket_addr();
        let stream = match tokio::time::timeout(dial_timeout, TcpStream::connect(socket_addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(P2pError::Io(e)),
            Err(_) => return Err(P2pError::DialTimeout { addr: socket_addr }),
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(addr = %socket_addr, error = %e, "Failed to set TCP_NODELAY");
        }

        Ok(Self {
            direction: Direction::Outbound,
            remote: socket_addr,
            stream,
        })
    }

    /// Exchange node-info frames within the handshake deadline.
    pub async fn handshake_timeout(
        self,
        our_info: NodeInfo,
        deadline: Duration,
    ) -> P2pResult<HandshakenConn> {
        let mut framed = Framed::new(self.stream, FrameCodec::new());

        let their_info = match tokio::time::timeout(deadline, exchange_node_info(&mut framed, our_info)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(P2pError::HandshakeTimeout),
        };

        Ok(HandshakenConn {
            framed,
            node_info: their_info,
            direction: self.direction,
            remote: self.remote,
        })
    }
}

/// Send our node info and read the remote's. The first frame in each
/// direction must be a node-info frame.
async fn exchange_node_info(
    framed: &mut Framed<TcpStream, FrameCodec>,
    our_info: NodeInfo,
) -> P2pResult<NodeInfo> {
    framed.send(Frame::NodeInfo(our_info)).await?;

    match framed.next().await {
        Some(Ok(Frame::NodeInfo(info))) => Ok(info),
        Some(Ok(_)) => Err(P2pError::HandshakeFailed(
            "expected node info frame".to_string(),
        )),
        Some(Err(e)) => Err(e),
        None => Err(P2pError::HandshakeFailed(
            "connection closed during handshake".to_string(),
        )),
    }
}

struct PendingTasks {
    backend: SendBackend,
    stream: FrameStream,
}

/// An authenticated, handshake-complete remote endpoint.
///
/// Owned exclusively by the [`PeerSet`]; reactors see it only inside
/// their callbacks and must not retain owning references.
pub struct Peer {
    id: String,
    node_info: NodeInfo,
    direction: Direction,
    remote: SocketAddr,
    conn: MultiplexConn,
    stop_reported: AtomicBool,
    pending: Mutex<Option<PendingTasks>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    /// Build a peer from a handshaken connection.
    pub(crate) fn new(
        hc: HandshakenConn,
        descriptors: &[ChannelDescriptor],
        send_timeout: Duration,
    ) -> Arc<Self> {
        let (conn, backend, stream) = MultiplexConn::new(hc.framed, descriptors, send_timeout);
        Arc::new(Self {
            id: hc.node_info.peer_id(),
            node_info: hc.node_info,
            direction: hc.direction,
            remote: hc.remote,
            conn,
            stop_reported: AtomicBool::new(false),
            pending: Mutex::new(Some(PendingTasks { backend, stream })),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Hex-encoded public key identifying this peer.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Node info snapshot taken at handshake.
    pub fn node_info(&self) -> &NodeInfo {
        &self.node_info
    }

    /// Direction of this connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether we initiated this connection.
    pub fn is_outbound(&self) -> bool {
        self.direction == Direction::Outbound
    }

    /// Remote socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Remote host string, the ban-list key.
    pub fn remote_addr_host(&self) -> String {
        self.remote.ip().to_string()
    }

    /// Advertised service capabilities.
    pub fn service_flags(&self) -> ServiceFlags {
        self.node_info.service_flags
    }

    /// Queue a frame on a channel, waiting up to the enqueue deadline.
    pub async fn send(&self, channel_id: u8, payload: Vec<u8>) -> bool {
        self.conn.send(channel_id, payload).await
    }

    /// Queue a frame without blocking.
    pub fn try_send(&self, channel_id: u8, payload: Vec<u8>) -> bool {
        self.conn.try_send(channel_id, payload)
    }

    /// Snapshot of traffic on this connection.
    pub fn traffic_status(&self) -> TrafficStatus {
        self.conn.traffic_status()
    }

    /// Spawn the send scheduler and receive dispatcher for a peer.
    pub(crate) fn start(
        peer: &Arc<Peer>,
        registry: Arc<ReactorRegistry>,
        stop_tx: mpsc::UnboundedSender<PeerStopEvent>,
    ) {
        let Some(PendingTasks { backend, stream }) = peer
            .pending
            .lock()
            .expect("lock poisoned")
            .take()
        else {
            return;
        };

        peer.conn.start();

        // Subscribe before spawning so an immediate stop is not missed.
        let shutdown_rx = peer.conn.subscribe_shutdown();

        let sender = peer.clone();
        let tx = stop_tx.clone();
        let send_handle = tokio::spawn(async move {
            if let Err(e) = backend.run().await {
                sender.report_stop(&tx, &format!("send failed: {}", e));
            }
            sender.conn.mark_closed();
        });

        let recv_handle = tokio::spawn(run_recv_loop(
            peer.clone(),
            stream,
            registry,
            stop_tx,
            shutdown_rx,
        ));

        peer.handles
            .lock()
            .expect("lock poisoned")
            .extend([send_handle, recv_handle]);
    }

    /// Stop the peer. Idempotent; closes the multiplexed connection and
    /// suppresses any further stop events from the connection tasks.
    pub fn stop(&self) {
        self.stop_reported.store(true, Ordering::SeqCst);
        self.conn.close();
    }

    /// Surface a transport error as a single stop event, then close.
    pub(crate) fn report_stop(&self, tx: &mpsc::UnboundedSender<PeerStopEvent>, reason: &str) {
        if !self.stop_reported.swap(true, Ordering::SeqCst) {
            let _ = tx.send(PeerStopEvent {
                peer_id: self.id.clone(),
                reason: reason.to_string(),
            });
        }
        self.conn.close();
    }

    /// Hand out the connection task handles for bounded join at shutdown.
    pub(crate) fn take_task_handles(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.handles.lock().expect("lock poisoned"))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({})",
            &self.id[..8.min(self.id.len())],
            self.remote,
            self.direction
        )
    }
}

/// Per-peer receive dispatcher: reads data frames and routes each to the
/// reactor that owns the channel. The read path is serialized per
/// connection, so reactors must not block indefinitely in `receive`.
async fn run_recv_loop(
    peer: Arc<Peer>,
    mut stream: FrameStream,
    registry: Arc<ReactorRegistry>,
    stop_tx: mpsc::UnboundedSender<PeerStopEvent>,
    mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            frame = stream.next() => match frame {
                Some(Ok(Frame::Data { channel_id, payload })) => {
                    peer.conn.traffic().record_recv(payload.len());
                    match registry.route(channel_id) {
                        Some(reactor) => reactor.receive(channel_id, &peer, &payload),
                        None => {
                            peer.report_stop(&stop_tx, &format!("unknown channel {:#04x}", channel_id));
                            break;
                        }
                    }
                }
                Some(Ok(Frame::NodeInfo(_))) => {
                    peer.report_stop(&stop_tx, "unexpected node info frame");
                    break;
                }
                Some(Err(e)) => {
                    peer.report_stop(&stop_tx, &format!("read failed: {}", e));
                    break;
                }
                None => {
                    peer.report_stop(&stop_tx, "connection closed");
                    break;
                }
            }
        }
    }

    peer.conn.mark_closed();
}
