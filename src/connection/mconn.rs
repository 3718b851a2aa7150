//! Multiplexed connection: one TCP stream carrying prioritized channels.
//!
//! Outbound frames are queued per channel; a scheduler task drains the
//! queues with weighted-fair selection (least `recently_sent / priority`
//! first, ties round-robin). Frames on a single channel stay strictly
//! FIFO; nothing is promised across channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;

use super::codec::{Frame, FrameCodec};
use crate::error::P2pResult;

/// Default outbound queue capacity per channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Write half of a framed connection.
pub(crate) type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;

/// Read half of a framed connection.
pub(crate) type FrameStream = SplitStream<Framed<TcpStream, FrameCodec>>;

/// Descriptor for one logical channel on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelDescriptor {
    /// Globally unique channel id.
    pub id: u8,
    /// Relative scheduling weight.
    pub priority: usize,
    /// Outbound queue capacity.
    pub capacity: usize,
}

impl ChannelDescriptor {
    /// Create a descriptor with the default queue capacity.
    pub fn new(id: u8, priority: usize) -> Self {
        Self {
            id,
            priority,
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    /// Set the outbound queue capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

const STATE_NEW: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Byte and frame counters for one connection.
#[derive(Debug)]
pub struct TrafficCounters {
    started: Instant,
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    frames_sent: AtomicU64,
    frames_recv: AtomicU64,
}

/// Snapshot of connection traffic, used for disconnect logging.
#[derive(Debug, Clone)]
pub struct TrafficStatus {
    /// How long the connection has been up.
    pub duration: Duration,
    /// Total payload bytes sent.
    pub bytes_sent: u64,
    /// Total payload bytes received.
    pub bytes_recv: u64,
    /// Total frames sent.
    pub frames_sent: u64,
    /// Total frames received.
    pub frames_recv: u64,
}

impl TrafficCounters {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            frames_recv: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
        self.frames_recv.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of the counters.
    pub fn status(&self) -> TrafficStatus {
        TrafficStatus {
            duration: self.started.elapsed(),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_recv: self.frames_recv.load(Ordering::Relaxed),
        }
    }
}

/// One channel as seen by the send scheduler.
struct SchedChannel {
    id: u8,
    priority: u64,
    rx: mpsc::Receiver<Vec<u8>>,
    /// Head of the queue, held here so selection does not reorder frames.
    peeked: Option<Vec<u8>>,
    recently_sent: u64,
}

/// Send-scheduler half of a connection, consumed by the peer's send task.
pub(crate) struct SendBackend {
    sink: FrameSink,
    channels: Vec<SchedChannel>,
    kick_rx: mpsc::UnboundedReceiver<()>,
    shutdown_rx: broadcast::Receiver<()>,
    traffic: Arc<TrafficCounters>,
    rotation: usize,
}

impl SendBackend {
    /// Drain channel queues into the socket until shutdown or write error.
    pub(crate) async fn run(mut self) -> P2pResult<()> {
        loop {
            if self.shutdown_signaled() {
                let _ = self.sink.close().await;
                return Ok(());
            }

            self.fill_peeked();

            match self.pick_channel() {
                Some(idx) => {
                    let payload = self.channels[idx].peeked.take().expect("picked channel has a frame");
                    let channel_id = self.channels[idx].id;
                    let len = payload.len();

                    self.sink
                        .send(Frame::Data {
                            channel_id,
                            payload,
                        })
                        .await?;

                    self.channels[idx].recently_sent += len as u64;
                    self.traffic.record_sent(len);
                }
                None => {
                    // Idle: reset fairness counters and wait for work.
                    for ch in &mut self.channels {
                        ch.recently_sent = 0;
                    }
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => {
                            let _ = self.sink.close().await;
                            return Ok(());
                        }
                        kick = self.kick_rx.recv() => {
                            if kick.is_none() {
                                let _ = self.sink.close().await;
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }

    fn shutdown_signaled(&mut self) -> bool {
        matches!(
            self.shutdown_rx.try_recv(),
            Ok(_) | Err(broadcast::error::TryRecvError::Closed)
        )
    }

    fn fill_peeked(&mut self) {
        for ch in &mut self.channels {
            if ch.peeked.is_none() {
                ch.peeked = ch.rx.try_recv().ok();
            }
        }
    }

    /// Weighted-fair pick: least `recently_sent / priority`, ties broken
    /// round-robin by rotating the scan start.
    fn pick_channel(&mut self) -> Option<usize> {
        let n = self.channels.len();
        let mut best: Option<usize> = None;

        for off in 0..n {
            let i = (self.rotation + off) % n;
            if self.channels[i].peeked.is_none() {
                continue;
            }
            match best {
                None => best = Some(i),
                Some(b) => {
                    let ratio_i =
                        self.channels[i].recently_sent as f64 / self.channels[i].priority as f64;
                    let ratio_b =
                        self.channels[b].recently_sent as f64 / self.channels[b].priority as f64;
                    if ratio_i < ratio_b {
                        best = Some(i);
                    }
                }
            }
        }

        if let Some(b) = best {
            self.rotation = (b + 1) % n;
        }
        best
    }
}

/// Handle for sending on a multiplexed connection.
///
/// State machine: new → running → closing → closed. `close` is
/// idempotent; all senders observe a closed connection thereafter.
pub struct MultiplexConn {
    senders: HashMap<u8, mpsc::Sender<Vec<u8>>>,
    kick_tx: mpsc::UnboundedSender<()>,
    shutdown_tx: broadcast::Sender<()>,
    state: Arc<AtomicU8>,
    traffic: Arc<TrafficCounters>,
    send_timeout: Duration,
}

impl MultiplexConn {
    /// Split a handshaken framed stream into a connection handle, the
    /// send-scheduler backend, and the read half.
    ///
    /// Channel ids must be unique; the reactor registry guarantees this
    /// for descriptors it hands out, so a collision here is a programming
    /// error.
    pub(crate) fn new(
        framed: Framed<TcpStream, FrameCodec>,
        descriptors: &[ChannelDescriptor],
        send_timeout: Duration,
    ) -> (Self, SendBackend, FrameStream) {
        let (sink, stream) = framed.split();
        let (kick_tx, kick_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let mut senders = HashMap::new();
        let mut channels = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            let (tx, rx) = mpsc::channel(desc.capacity.max(1));
            if senders.insert(desc.id, tx).is_some() {
                panic!("channel id {:#04x} defined twice on one connection", desc.id);
            }
            channels.push(SchedChannel {
                id: desc.id,
                priority: desc.priority.max(1) as u64,
                rx,
                peeked: None,
                recently_sent: 0,
            });
        }

        let traffic = Arc::new(TrafficCounters::new());
        let state = Arc::new(AtomicU8::new(STATE_NEW));

        let conn = Self {
            senders,
            kick_tx,
            shutdown_tx,
            state: state.clone(),
            traffic: traffic.clone(),
            send_timeout,
        };
        let backend = SendBackend {
            sink,
            channels,
            kick_rx,
            shutdown_rx,
            traffic,
            rotation: 0,
        };
        (conn, backend, stream)
    }

    /// Transition new → running. Called once the peer tasks are spawned.
    pub(crate) fn start(&self) {
        let _ = self.state.compare_exchange(
            STATE_NEW,
            STATE_RUNNING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Queue a frame on a channel, blocking until the queue accepts it or
    /// the enqueue deadline elapses. Returns false on deadline, unknown
    /// channel, or closed connection.
    pub async fn send(&self, channel_id: u8, payload: Vec<u8>) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(tx) = self.senders.get(&channel_id) else {
            return false;
        };
        match tx.send_timeout(payload, self.send_timeout).await {
            Ok(()) => {
                let _ = self.kick_tx.send(());
                true
            }
            Err(_) => false,
        }
    }

    /// Queue a frame without blocking. Returns false if the queue is full,
    /// the channel is unknown, or the connection is closed.
    pub fn try_send(&self, channel_id: u8, payload: Vec<u8>) -> bool {
        if self.is_closed() {
            return false;
        }
        let Some(tx) = self.senders.get(&channel_id) else {
            return false;
        };
        match tx.try_send(payload) {
            Ok(()) => {
                let _ = self.kick_tx.send(());
                true
            }
            Err(_) => false,
        }
    }

    /// Begin teardown. Idempotent; signals both connection tasks.
    pub fn close(&self) {
        loop {
            let current = self.state.load(Ordering::SeqCst);
            if current >= STATE_CLOSING {
                return;
            }
            if self
                .state
                .compare_exchange(current, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let _ = self.shutdown_tx.send(());
                return;
            }
        }
    }

    /// Final state, set when the connection tasks have exited.
    pub(crate) fn mark_closed(&self) {
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
    }

    /// Whether the connection is closing or closed.
    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= STATE_CLOSING
    }

    /// Subscribe to the connection shutdown signal.
    pub(crate) fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Traffic counters shared with the connection tasks.
    pub(crate) fn traffic(&self) -> &Arc<TrafficCounters> {
        &self.traffic
    }

    /// Snapshot of traffic on this connection.
    pub fn traffic_status(&self) -> TrafficStatus {
        self.traffic.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn descriptors() -> Vec<ChannelDescriptor> {
        vec![
            ChannelDescriptor::new(0x00, 1),
            ChannelDescriptor::new(0x01, 10),
        ]
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = socket_pair().await;
        let framed = Framed::new(client, FrameCodec::new());
        let (conn, _backend, _stream) =
            MultiplexConn::new(framed, &descriptors(), Duration::from_millis(100));

        conn.start();
        assert!(!conn.is_closed());

        conn.close();
        conn.close();
        assert!(conn.is_closed());
        assert!(!conn.send(0x00, vec![1]).await);
        assert!(!conn.try_send(0x00, vec![1]));
    }

    #[tokio::test]
    async fn test_send_unknown_channel() {
        let (client, _server) = socket_pair().await;
        let framed = Framed::new(client, FrameCodec::new());
        let (conn, _backend, _stream) =
            MultiplexConn::new(framed, &descriptors(), Duration::from_millis(100));
        conn.start();

        assert!(!conn.send(0x7f, vec![1]).await);
    }

    #[tokio::test]
    async fn test_try_send_full_queue() {
        let (client, _server) = socket_pair().await;
        let framed = Framed::new(client, FrameCodec::new());
        let descs = vec![ChannelDescriptor::new(0x00, 1).with_capacity(1)];
        let (conn, _backend, _stream) =
            MultiplexConn::new(framed, &descs, Duration::from_millis(50));
        conn.start();

        assert!(conn.try_send(0x00, vec![1]));
        // Backend is not draining, so the queue stays full.
        assert!(!conn.try_send(0x00, vec![2]));
        assert!(!conn.send(0x00, vec![3]).await);
    }

    #[tokio::test]
    async fn test_scheduler_fifo_and_priority() {
        let (client, server) = socket_pair().await;
        let framed = Framed::new(client, FrameCodec::new());
        let (conn, backend, _stream) =
            MultiplexConn::new(framed, &descriptors(), Duration::from_millis(100));
        conn.start();

        // Queue everything before the scheduler runs so selection order
        // is deterministic.
        for i in 0..5u8 {
            assert!(conn.send(0x00, vec![0, i]).await);
        }
        for i in 0..20u8 {
            assert!(conn.send(0x01, vec![1, i]).await);
        }

        tokio::spawn(backend.run());

        let mut reader = tokio_util::codec::FramedRead::new(server, FrameCodec::new());
        let mut received = Vec::new();
        while received.len() < 25 {
            match reader.next().await {
                Some(Ok(Frame::Data { channel_id, payload })) => {
                    received.push((channel_id, payload));
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }

        // Per-channel FIFO.
        for ch in [0x00u8, 0x01u8] {
            let seq: Vec<u8> = received
                .iter()
                .filter(|(id, _)| *id == ch)
                .map(|(_, p)| p[1])
                .collect();
            let mut sorted = seq.clone();
            sorted.sort_unstable();
            assert_eq!(seq, sorted, "channel {:#04x} reordered", ch);
        }

        // The high-priority channel dominates the early schedule.
        let early_low = received[..11].iter().filter(|(id, _)| *id == 0x00).count();
        assert!(early_low <= 2, "low-priority channel sent {} of first 11", early_low);
    }
}
