//! The switch: peer lifecycle orchestrator.
//!
//! Owns the peer set, the reactor registry, the listener, the dialing
//! set, and the ban list. Incoming frames are received on reactors;
//! outgoing traffic goes through the peers themselves.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::{P2pConfig, OUTBOUND_MAINTENANCE_INTERVAL};
use crate::discovery::{Discv, NodeId, NodeRecord};
use crate::error::{P2pError, P2pResult};
use crate::lan::{LanDiscover, LanPeerEvent};
use crate::netaddress::NetAddress;
use crate::node_info::{NodeInfo, ServiceFlags};
use crate::peer::{Direction, Peer, PeerConn, PeerSet, PeerStopEvent};
use crate::reactor::{Reactor, ReactorRegistry};
use crate::trust::{BannedPeers, KvStore};

/// Software version advertised in the handshake.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bound on joining a single task at shutdown.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Removes the dialing-set entry on every exit path.
struct DialingGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    host: String,
}

impl<'a> DialingGuard<'a> {
    fn new(set: &'a Mutex<HashSet<String>>, host: String) -> Self {
        set.lock().expect("lock poisoned").insert(host.clone());
        Self { set, host }
    }
}

impl Drop for DialingGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().expect("lock poisoned").remove(&self.host);
    }
}

/// Handles peer connections and exposes an API to receive incoming
/// frames on reactors. Each reactor is responsible for one or more
/// channels, so while sending outgoing frames is typically performed on
/// the peer, incoming frames are received on the reactor.
pub struct Switch {
    /// Back-reference used to hand task loops an owning handle.
    self_ref: Weak<Switch>,
    config: P2pConfig,
    registry: Arc<ReactorRegistry>,
    peers: PeerSet,
    dialing: Mutex<HashSet<String>>,
    node_info: RwLock<NodeInfo>,
    node_key: SigningKey,
    discv: Option<Arc<dyn Discv>>,
    banned: BannedPeers,
    lan: Mutex<Option<Arc<LanDiscover>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    stop_tx: Mutex<Option<mpsc::UnboundedSender<PeerStopEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Switch {
    /// Create a switch with a fresh node key.
    ///
    /// `discv` supplies outbound dial candidates; `store` holds the
    /// persisted ban map.
    pub fn new(
        config: P2pConfig,
        genesis_hash: [u8; 32],
        best_height: u64,
        best_hash: [u8; 32],
        discv: Option<Arc<dyn Discv>>,
        store: Arc<dyn KvStore>,
    ) -> P2pResult<Arc<Self>> {
        let listen = NetAddress::from_listen_addr(&config.listen_address)?;
        let node_key = SigningKey::generate(&mut OsRng);

        let node_info = NodeInfo {
            pub_key: node_key.verifying_key().to_bytes(),
            version: VERSION.to_string(),
            listen_addr: listen.to_string(),
            genesis_hash,
            best_height,
            best_hash,
            service_flags: ServiceFlags::FULL_NODE,
        };

        let banned = BannedPeers::load(store)?;
        let (shutdown_tx, _) = broadcast::channel(1);
        let max_num_peers = config.max_num_peers;

        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            peers: PeerSet::new(max_num_peers),
            config,
            registry: Arc::new(ReactorRegistry::new()),
            dialing: Mutex::new(HashSet::new()),
            node_info: RwLock::new(node_info),
            node_key,
            discv,
            banned,
            lan: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            stop_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
        }))
    }

    /// Owning handle for spawned task loops.
    fn arc(&self) -> Arc<Switch> {
        self.self_ref.upgrade().expect("switch is alive")
    }

    /// Register a reactor. Must happen before the switch starts; once
    /// running, the registry is immutable. Panics on channel-id
    /// collision.
    pub fn add_reactor(&self, name: &str, reactor: Arc<dyn Reactor>) {
        if self.started.load(Ordering::SeqCst) {
            panic!("reactors must be registered before the switch starts");
        }
        reactor.attach_switch(self.self_ref.clone());
        self.registry.add(name, reactor);
    }

    /// Start reactors, the listener, the outbound-maintenance loop, and
    /// LAN discovery.
    pub async fn start(&self) -> P2pResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(P2pError::Shutdown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(P2pError::AlreadyRunning);
        }

        self.registry.start_all()?;

        let listen = NetAddress::from_listen_addr(&self.config.listen_address)?;
        let listener = TcpListener::bind(listen.socket_addr()).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().expect("lock poisoned") = Some(local_addr);
        {
            // Fix up the declared address when the OS picked the port.
            let mut info = self.node_info.write().expect("lock poisoned");
            info.listen_addr = NetAddress::new(listen.ip, local_addr.port()).to_string();
        }
        tracing::info!(addr = %local_addr, "P2P switch listening");

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        *self.stop_tx.lock().expect("lock poisoned") = Some(stop_tx);

        let mut tasks = vec![
            tokio::spawn(event_loop(self.arc(), stop_rx)),
            tokio::spawn(listener_loop(self.arc(), listener)),
            tokio::spawn(maintenance_loop(self.arc())),
        ];

        if self.config.lan_discoverable {
            match LanDiscover::new(&self.config.listen_address, &self.config.chain_id) {
                Ok(lan) => {
                    let lan = Arc::new(lan);
                    *self.lan.lock().expect("lock poisoned") = Some(lan.clone());
                    match lan.subscribe() {
                        Ok(events) => {
                            tasks.push(tokio::spawn(lan_loop(self.arc(), events)));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "LAN discovery resolver unavailable");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "LAN discovery unavailable");
                }
            }
        }

        self.tasks.lock().expect("lock poisoned").extend(tasks);
        Ok(())
    }

    /// Graceful shutdown: stop the listener, stop and remove every peer,
    /// stop reactors, stop LAN discovery. Idempotent; subsequent switch
    /// operations return [`P2pError::Shutdown`].
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        *self.stop_tx.lock().expect("lock poisoned") = None;

        let peers = self.peers.list();
        for peer in &peers {
            self.stop_and_remove_peer(peer, "switch shutdown");
        }
        for peer in &peers {
            for handle in peer.take_task_handles() {
                join_or_abort(handle).await;
            }
        }

        self.registry.stop_all();

        if let Some(lan) = self.lan.lock().expect("lock poisoned").take() {
            lan.stop();
        }

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("lock poisoned"));
        for task in tasks {
            join_or_abort(task).await;
        }

        tracing::info!("P2P switch stopped");
    }

    /// Dial a peer by address. The dialing-set entry lives for the whole
    /// attempt and is dropped on every exit path.
    pub async fn dial_peer_with_address(&self, addr: &NetAddress) -> P2pResult<()> {
        if self.stopped.load(Ordering::SeqCst) || !self.started.load(Ordering::SeqCst) {
            return Err(P2pError::Shutdown);
        }
        tracing::debug!(addr = %addr, "Dialing peer");

        let _guard = DialingGuard::new(&self.dialing, addr.host());

        self.filter_conn_by_addr(addr)?;

        let pc = PeerConn::dial(addr, self.config.dial_timeout).await?;
        match self.add_peer(pc).await {
            Ok(()) => {
                tracing::debug!(addr = %addr, "Dial peer added");
                Ok(())
            }
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Dial peer failed");
                Err(e)
            }
        }
    }

    /// Run the handshake on a connection and, if every check passes,
    /// start the peer and register it.
    pub(crate) async fn add_peer(&self, pc: PeerConn) -> P2pResult<()> {
        let our_info = self.node_info();
        let hc = pc
            .handshake_timeout(our_info.clone(), self.config.handshake_timeout)
            .await?;

        our_info.compatible_with(&hc.node_info)?;
        self.filter_conn_by_peer(&our_info, &hc.node_info, &hc.remote)?;

        if hc.direction == Direction::Outbound
            && !hc.node_info.service_flags.contains(ServiceFlags::FULL_NODE)
        {
            return Err(P2pError::ConnectSpvPeer);
        }

        let stop_tx = self
            .stop_tx
            .lock()
            .expect("lock poisoned")
            .clone()
            .ok_or(P2pError::Shutdown)?;

        let descriptors = self.registry.descriptors();
        let peer = Peer::new(hc, &descriptors, self.config.send_timeout);

        self.peers.add(peer.clone())?;
        Peer::start(&peer, self.registry.clone(), stop_tx);

        for reactor in self.registry.in_order() {
            if let Err(e) = reactor.add_peer(&peer) {
                self.stop_and_remove_peer(&peer, "reactor rejected peer");
                return Err(e);
            }
        }

        tracing::info!(peer = %peer, "Peer connected");
        Ok(())
    }

    fn filter_conn_by_addr(&self, addr: &NetAddress) -> P2pResult<()> {
        if addr.to_string() == self.node_info().listen_addr {
            return Err(P2pError::ConnectSelf);
        }
        self.banned.check(&addr.host())
    }

    fn filter_conn_by_peer(
        &self,
        our_info: &NodeInfo,
        their_info: &NodeInfo,
        remote: &SocketAddr,
    ) -> P2pResult<()> {
        self.banned.check(&remote.ip().to_string())?;

        if their_info.pub_key == our_info.pub_key {
            return Err(P2pError::ConnectSelf);
        }

        if self.peers.has(&their_info.peer_id()) {
            return Err(P2pError::DuplicatePeer);
        }
        Ok(())
    }

    /// Disconnect from a peer due to an external error.
    pub fn stop_peer_for_error(&self, peer_id: &str, reason: &str) {
        if let Some(peer) = self.peers.get(peer_id) {
            tracing::debug!(peer = %peer, reason, "Stopping peer for error");
            self.stop_and_remove_peer(&peer, reason);
        }
    }

    /// Disconnect from a peer gracefully.
    pub fn stop_peer_gracefully(&self, peer_id: &str) {
        if let Some(peer) = self.peers.get(peer_id) {
            self.stop_and_remove_peer(&peer, "graceful stop");
        }
    }

    fn stop_and_remove_peer(&self, peer: &Arc<Peer>, reason: &str) {
        self.peers.remove(peer.id());
        for reactor in self.registry.in_order() {
            reactor.remove_peer(peer, reason);
        }
        peer.stop();

        let status = peer.traffic_status();
        tracing::info!(
            address = %peer.remote_addr(),
            reason,
            duration = ?status.duration,
            total_sent = status.bytes_sent,
            total_received = status.bytes_recv,
            "Disconnect with peer"
        );
    }

    /// Top up the outbound peer set from discovery. Runs at startup and
    /// every maintenance tick.
    pub(crate) async fn ensure_outbound_peers(&self) {
        let (outbound, _, dialing) = self.num_peers();
        let need = self
            .config
            .min_num_outbound_peers
            .saturating_sub(outbound + dialing);
        tracing::debug!(outbound, dialing, need, "Ensure outbound peers");
        if need == 0 {
            return;
        }

        let Some(discv) = self.discv.clone() else {
            return;
        };

        let placeholder = NodeRecord {
            id: NodeId([0u8; 32]),
            ip: std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED),
            tcp_port: 0,
            udp_port: 0,
        };
        let mut buf = vec![placeholder; need];
        let n = discv.read_random_nodes(&mut buf);

        let connected: HashSet<String> = self
            .peers
            .list()
            .iter()
            .map(|p| p.remote_addr_host())
            .collect();
        let listen_addr = self.node_info().listen_addr;

        let mut dials = Vec::new();
        for node in &buf[..n] {
            let candidate = node.tcp_addr();
            if candidate.to_string() == listen_addr {
                continue;
            }
            if self.is_dialing(&candidate.host()) {
                continue;
            }
            if connected.contains(&candidate.host()) {
                continue;
            }
            if self.banned.check(&candidate.host()).is_err() {
                continue;
            }

            let sw = self.arc();
            dials.push(tokio::spawn(async move {
                if let Err(e) = sw.dial_peer_with_address(&candidate).await {
                    tracing::debug!(addr = %candidate, error = %e, "Outbound dial failed");
                }
            }));
        }

        for dial in dials {
            let _ = dial.await;
        }
    }

    /// Ban an IP for the default duration. Enforcement happens on every
    /// subsequent dial and accept.
    pub fn add_banned_peer(&self, ip: &str) -> P2pResult<()> {
        self.banned.ban(ip)
    }

    /// Ban an IP until an explicit expiry.
    pub fn ban_peer_until(&self, ip: &str, until: DateTime<Utc>) -> P2pResult<()> {
        self.banned.ban_until(ip, until)
    }

    /// The connected peer set.
    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    /// Counts of outbound, inbound, and outbound-dialing peers.
    pub fn num_peers(&self) -> (usize, usize, usize) {
        let mut outbound = 0;
        let mut inbound = 0;
        for peer in self.peers.list() {
            if peer.is_outbound() {
                outbound += 1;
            } else {
                inbound += 1;
            }
        }
        let dialing = self.dialing.lock().expect("lock poisoned").len();
        (outbound, inbound, dialing)
    }

    /// Whether a host is currently being dialed.
    pub fn is_dialing(&self, host: &str) -> bool {
        self.dialing.lock().expect("lock poisoned").contains(host)
    }

    /// Read copy of our node info.
    pub fn node_info(&self) -> NodeInfo {
        self.node_info.read().expect("lock poisoned").clone()
    }

    /// Our discovery node id, derived from the node key.
    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_key.verifying_key().to_bytes())
    }

    /// Record a new local best block, advertised to future peers.
    pub fn update_best_height(&self, height: u64, hash: [u8; 32]) {
        self.node_info
            .write()
            .expect("lock poisoned")
            .update_best(height, hash);
    }

    /// The actual listener address once the switch has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("lock poisoned")
    }

    /// The listener address as a dialable endpoint.
    pub fn listen_net_address(&self) -> Option<NetAddress> {
        self.local_addr().map(NetAddress::from)
    }

    async fn add_peer_from_stream(&self, stream: TcpStream) -> P2pResult<()> {
        let pc = PeerConn::inbound(stream)?;
        self.add_peer(pc).await
    }
}

/// Join a task within the shutdown grace period, aborting it otherwise.
async fn join_or_abort(handle: JoinHandle<()>) {
    let aborter = handle.abort_handle();
    if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await.is_err() {
        aborter.abort();
    }
}

/// Accept loop. Accept errors stop the loop but not the switch.
async fn listener_loop(sw: Arc<Switch>, listener: TcpListener) {
    let mut shutdown_rx = sw.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    if sw.peers.size() >= sw.config.max_num_peers {
                        tracing::info!(addr = %addr, "Ignoring inbound connection: already have enough peers");
                        continue;
                    }

                    let switch = sw.clone();
                    tokio::spawn(async move {
                        if let Err(e) = switch.add_peer_from_stream(stream).await {
                            if e.is_policy() {
                                tracing::debug!(addr = %addr, error = %e, "Rejected inbound peer");
                            } else {
                                tracing::info!(addr = %addr, error = %e, "Ignoring inbound connection: error while adding peer");
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept error, stopping listener");
                    break;
                }
            }
        }
    }
}

/// Consumes stop events raised by peer connection tasks.
async fn event_loop(sw: Arc<Switch>, mut stop_rx: mpsc::UnboundedReceiver<PeerStopEvent>) {
    let mut shutdown_rx = sw.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            event = stop_rx.recv() => match event {
                Some(event) => sw.stop_peer_for_error(&event.peer_id, &event.reason),
                None => break,
            }
        }
    }
}

/// Outbound maintenance: initial run, then every 10 seconds.
async fn maintenance_loop(sw: Arc<Switch>) {
    let mut shutdown_rx = sw.shutdown_tx.subscribe();
    let mut ticker = interval(OUTBOUND_MAINTENANCE_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => sw.ensure_outbound_peers().await,
        }
    }
}

/// Dials peers hinted by LAN discovery; the usual dial filters apply.
async fn lan_loop(sw: Arc<Switch>, mut events: broadcast::Receiver<LanPeerEvent>) {
    let mut shutdown_rx = sw.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,

            event = events.recv() => match event {
                Ok(event) => {
                    for ip in event.ips {
                        let addr = NetAddress::new(ip, event.port);
                        if let Err(e) = sw.dial_peer_with_address(&addr).await {
                            tracing::debug!(addr = %addr, error = %e, "LAN dial failed");
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}
