//! UDP transport and driver for the discovery protocol.
//!
//! A single driver task owns the socket, the pending-ping map, and the
//! timers. Table access goes through a mutex that is never held across
//! I/O. New nodes are liveness-gated: they enter the table only after
//! answering a ping, and a full bucket challenges its oldest entry
//! before replacing it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant};

use crate::wire;

use super::persistence;
use super::table::{NodeId, NodeRecord, NodeTable, BUCKET_SIZE};

/// Discovery packets fit a single unfragmented datagram.
pub(crate) const MAX_PACKET_SIZE: usize = 1280;

const PING_TIMEOUT: Duration = Duration::from_secs(2);
const REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const PERSIST_INTERVAL: Duration = Duration::from_secs(120);

/// How many nodes receive a FindNode per refresh.
const LOOKUP_FANOUT: usize = 3;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Packet {
    pub from: NodeId,
    pub body: PacketBody,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum PacketBody {
    /// Liveness probe; carries the sender's TCP port so the receiver can
    /// build a dialable record from the datagram source address.
    Ping { tcp_port: u16 },
    /// Answer to a ping.
    Pong,
    /// Ask for the nodes closest to a target id.
    FindNode { target: NodeId },
    /// Answer to FindNode.
    Neighbors { nodes: Vec<NodeRecord> },
}

struct PendingPing {
    record: NodeRecord,
    deadline: Instant,
    /// Candidate that replaces `record` if the challenge times out.
    evicting: Option<NodeRecord>,
}

pub(crate) struct Driver {
    socket: Arc<UdpSocket>,
    table: Arc<Mutex<NodeTable>>,
    our_id: NodeId,
    tcp_port: u16,
    fallback: Vec<NodeRecord>,
    /// Outstanding pings keyed by remote endpoint. Seed records carry
    /// synthetic ids, so pongs are matched by address and the real id
    /// is taken from the answer.
    pending: HashMap<SocketAddr, PendingPing>,
    db_path: PathBuf,
}

impl Driver {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        table: Arc<Mutex<NodeTable>>,
        our_id: NodeId,
        tcp_port: u16,
        fallback: Vec<NodeRecord>,
        db_path: PathBuf,
    ) -> Self {
        Self {
            socket,
            table,
            our_id,
            tcp_port,
            fallback,
            pending: HashMap::new(),
            db_path,
        }
    }

    pub(crate) async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        let socket = self.socket.clone();
        let mut buf = vec![0u8; MAX_PACKET_SIZE];

        let mut refresh = interval(REFRESH_INTERVAL);
        let mut sweep = interval(PENDING_SWEEP_INTERVAL);
        let mut persist = interval(PERSIST_INTERVAL);

        loop {
            let datagram = tokio::select! {
                _ = shutdown_rx.recv() => break,

                result = socket.recv_from(&mut buf) => match result {
                    Ok((n, src)) => Some((n, src)),
                    Err(e) => {
                        tracing::warn!(error = %e, "Discovery receive error");
                        None
                    }
                },

                _ = refresh.tick() => {
                    self.refresh().await;
                    None
                }

                _ = sweep.tick() => {
                    self.sweep_pending();
                    None
                }

                _ = persist.tick() => {
                    self.persist().await;
                    None
                }
            };

            if let Some((n, src)) = datagram {
                self.handle_packet(&buf[..n], src).await;
            }
        }

        self.persist().await;
    }

    async fn handle_packet(&mut self, bytes: &[u8], src: SocketAddr) {
        let packet: Packet = match wire::deserialize(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(src = %src, error = %e, "Dropping malformed discovery packet");
                return;
            }
        };

        if packet.from == self.our_id {
            return;
        }

        match packet.body {
            PacketBody::Ping { tcp_port } => {
                self.send(PacketBody::Pong, src).await;
                let record = NodeRecord {
                    id: packet.from,
                    ip: src.ip(),
                    tcp_port,
                    udp_port: src.port(),
                };
                self.note_alive(record).await;
            }

            PacketBody::Pong => {
                if let Some(pending) = self.pending.remove(&src) {
                    let record = NodeRecord {
                        id: packet.from,
                        ip: src.ip(),
                        tcp_port: pending.record.tcp_port,
                        udp_port: src.port(),
                    };
                    self.note_alive(record).await;
                }
            }

            PacketBody::FindNode { target } => {
                let nodes = self
                    .table
                    .lock()
                    .expect("lock poisoned")
                    .closest(&target, BUCKET_SIZE);
                self.send(PacketBody::Neighbors { nodes }, src).await;
            }

            PacketBody::Neighbors { nodes } => {
                for node in nodes.into_iter().take(BUCKET_SIZE) {
                    if node.id == self.our_id || self.pending.contains_key(&node.udp_addr()) {
                        continue;
                    }
                    let known = self.table.lock().expect("lock poisoned").contains(&node.id);
                    if !known {
                        // Liveness gate before the table accepts it.
                        self.ping(node, None).await;
                    }
                }
            }
        }
    }

    /// Record a node that just proved liveness. A full bucket hands back
    /// its oldest entry, which gets challenged with the new record as
    /// the replacement candidate.
    async fn note_alive(&mut self, record: NodeRecord) {
        let evict = self
            .table
            .lock()
            .expect("lock poisoned")
            .note_seen(record.clone());

        if let Some(oldest) = evict {
            if !self.pending.contains_key(&oldest.udp_addr()) {
                self.ping(oldest, Some(record)).await;
            }
        }
    }

    async fn ping(&mut self, record: NodeRecord, evicting: Option<NodeRecord>) {
        let addr = record.udp_addr();
        self.pending.insert(
            addr,
            PendingPing {
                record,
                deadline: Instant::now() + PING_TIMEOUT,
                evicting,
            },
        );
        self.send(
            PacketBody::Ping {
                tcp_port: self.tcp_port,
            },
            addr,
        )
        .await;
    }

    async fn send(&self, body: PacketBody, to: SocketAddr) {
        let packet = Packet {
            from: self.our_id,
            body,
        };
        match wire::serialize(&packet) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, to).await {
                    tracing::debug!(to = %to, error = %e, "Discovery send failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode discovery packet");
            }
        }
    }

    fn sweep_pending(&mut self) {
        let now = Instant::now();
        let expired: Vec<SocketAddr> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in expired {
            let pending = self.pending.remove(&addr).expect("collected above");
            if let Some(candidate) = pending.evicting {
                // Challenge failed: the unresponsive node makes room.
                self.table
                    .lock()
                    .expect("lock poisoned")
                    .replace(&pending.record.id, candidate);
            }
        }
    }

    /// Periodic maintenance: bootstrap from the fallback seeds while the
    /// table is empty, otherwise walk the network with random lookups.
    async fn refresh(&mut self) {
        let (empty, mut sample) = {
            let table = self.table.lock().expect("lock poisoned");
            (table.is_empty(), table.nodes())
        };

        if empty {
            for seed in self.fallback.clone() {
                if seed.id != self.our_id && !self.pending.contains_key(&seed.udp_addr()) {
                    self.ping(seed, None).await;
                }
            }
            return;
        }

        sample.shuffle(&mut rand::thread_rng());
        sample.truncate(LOOKUP_FANOUT);

        let target = NodeId::random();
        for node in sample {
            self.send(PacketBody::FindNode { target }, node.udp_addr())
                .await;
        }
    }

    async fn persist(&self) {
        let nodes = self.table.lock().expect("lock poisoned").nodes();
        if let Err(e) = persistence::save_nodes(&self.db_path, &nodes).await {
            tracing::warn!(error = %e, "Failed to save discovery snapshot");
        }
    }
}
