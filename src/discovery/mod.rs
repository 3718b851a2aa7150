//! Peer discovery.
//!
//! This module provides:
//! - The Kademlia-style node table with random sampling
//! - The UDP ping/pong and lookup transport
//! - Seed bootstrap via deterministic enode URLs
//! - On-disk table snapshots (`discover.db`)

pub mod persistence;
pub mod seeds;
pub mod table;
pub mod udp;

pub use persistence::DB_FILE_NAME;
pub use seeds::{parse_node_url, seed_to_url, seeds_from_config};
pub use table::{NodeId, NodeRecord, NodeTable, BUCKET_SIZE};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::P2pConfig;
use crate::error::P2pResult;
use crate::netaddress::NetAddress;

use udp::Driver;

/// Source of outbound dial candidates, sampled by the switch.
pub trait Discv: Send + Sync {
    /// Fill `buf` with random known nodes without blocking; returns the
    /// number of entries written.
    fn read_random_nodes(&self, buf: &mut [NodeRecord]) -> usize;
}

/// The UDP discovery network: a persistent node table plus its driver
/// task.
pub struct Network {
    our_id: NodeId,
    table: Arc<Mutex<NodeTable>>,
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Network {
    /// Bind the discovery socket and start the driver task.
    ///
    /// The persisted snapshot at `db_path` seeds the table; `fallback`
    /// nodes are pinged whenever the table is empty.
    pub async fn listen(
        our_id: NodeId,
        bind_addr: SocketAddr,
        tcp_port: u16,
        db_path: PathBuf,
        fallback: Vec<NodeRecord>,
    ) -> P2pResult<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;

        let mut table = NodeTable::new(our_id);
        match persistence::load_nodes(&db_path).await {
            Ok(nodes) => {
                for node in nodes {
                    table.note_seen(node);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable discovery snapshot");
            }
        }
        let table = Arc::new(Mutex::new(table));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let driver = Driver::new(
            socket,
            table.clone(),
            our_id,
            tcp_port,
            fallback,
            db_path,
        );
        let handle = tokio::spawn(driver.run(shutdown_rx));

        tracing::info!(addr = %local_addr, "Discovery listening");

        Ok(Arc::new(Self {
            our_id,
            table,
            local_addr,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Start discovery the way the node does at boot: UDP on the same
    /// port family as the listener, seeds from configuration, snapshot
    /// in the data directory.
    pub async fn from_config(config: &P2pConfig, our_id: NodeId) -> P2pResult<Arc<Self>> {
        let listen = NetAddress::from_listen_addr(&config.listen_address)?;
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), listen.port);
        let fallback = seeds_from_config(&config.seeds)?;
        let db_path = config.data_dir.join(DB_FILE_NAME);

        Self::listen(our_id, bind_addr, listen.port, db_path, fallback).await
    }

    /// Our discovery id.
    pub fn our_id(&self) -> NodeId {
        self.our_id
    }

    /// The bound UDP address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of nodes currently in the table.
    pub fn node_count(&self) -> usize {
        self.table.lock().expect("lock poisoned").len()
    }

    /// Stop the driver and write a final snapshot.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self.handle.lock().expect("lock poisoned").take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

impl Discv for Network {
    fn read_random_nodes(&self, buf: &mut [NodeRecord]) -> usize {
        self.table
            .lock()
            .expect("lock poisoned")
            .read_random_nodes(buf)
    }
}
