//! Switch integration tests.
//!
//! These cover the peer-management invariants end to end over loopback:
//! connect, identity filtering, ban enforcement and persistence, channel
//! routing, registration errors, outbound maintenance, and shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::codec::Framed;

use bytomd_p2p::discovery::{Discv, NodeId, NodeRecord};
use bytomd_p2p::trust::{MemoryKv, SledKv};
use bytomd_p2p::{
    ChannelDescriptor, Frame, FrameCodec, NetAddress, NodeInfo, P2pConfig, P2pError, Peer,
    Reactor, ServiceFlags, Switch,
};

const GENESIS: [u8; 32] = [7u8; 32];

fn test_config_on(host: &str) -> P2pConfig {
    P2pConfig::new(format!("{}:0", host))
        .with_lan_discoverable(false)
        .with_handshake_timeout(Duration::from_secs(2))
        .with_dial_timeout(Duration::from_secs(2))
}

fn test_config() -> P2pConfig {
    test_config_on("127.0.0.1")
}

fn make_switch(config: P2pConfig, discv: Option<Arc<dyn Discv>>) -> Arc<Switch> {
    Switch::new(config, GENESIS, 0, [0u8; 32], discv, Arc::new(MemoryKv::new())).unwrap()
}

/// Poll a condition until it holds or the timeout elapses.
async fn wait_for(timeout_ms: u64, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    condition()
}

struct TestReactor {
    channels: Vec<ChannelDescriptor>,
    received: Mutex<Vec<(u8, Vec<u8>)>>,
    added: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    reject_peers: bool,
    add_log: Option<(String, Arc<Mutex<Vec<String>>>)>,
}

impl TestReactor {
    fn new(ids: &[u8]) -> Arc<Self> {
        Arc::new(Self::unwrapped(ids))
    }

    fn rejecting(ids: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            reject_peers: true,
            ..Self::unwrapped(ids)
        })
    }

    fn with_add_log(ids: &[u8], label: &str, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self {
            add_log: Some((label.to_string(), log)),
            ..Self::unwrapped(ids)
        })
    }

    fn unwrapped(ids: &[u8]) -> Self {
        Self {
            channels: ids.iter().map(|id| ChannelDescriptor::new(*id, 10)).collect(),
            received: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            reject_peers: false,
            add_log: None,
        }
    }

    fn received_on(&self, channel_id: u8) -> Vec<Vec<u8>> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == channel_id)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    fn added_count(&self) -> usize {
        self.added.lock().unwrap().len()
    }

    fn removed_count(&self) -> usize {
        self.removed.lock().unwrap().len()
    }
}

impl Reactor for TestReactor {
    fn channels(&self) -> Vec<ChannelDescriptor> {
        self.channels.clone()
    }

    fn add_peer(&self, peer: &Arc<Peer>) -> Result<(), P2pError> {
        if self.reject_peers {
            return Err(P2pError::HandshakeFailed("reactor has no capacity".to_string()));
        }
        if let Some((label, log)) = &self.add_log {
            log.lock().unwrap().push(label.clone());
        }
        self.added.lock().unwrap().push(peer.id().to_string());
        Ok(())
    }

    fn remove_peer(&self, peer: &Arc<Peer>, _reason: &str) {
        self.removed.lock().unwrap().push(peer.id().to_string());
    }

    fn receive(&self, channel_id: u8, _peer: &Arc<Peer>, payload: &[u8]) {
        self.received.lock().unwrap().push((channel_id, payload.to_vec()));
    }
}

/// A bare protocol endpoint that answers every handshake with a fixed
/// node info. Used to simulate remotes with chosen identities.
async fn spawn_remote_peer(info: NodeInfo) -> NetAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let info = info.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, FrameCodec::new());
                let _ = framed.next().await;
                let _ = framed.send(Frame::NodeInfo(info)).await;
                sleep(Duration::from_secs(2)).await;
            });
        }
    });

    NetAddress::from(addr)
}

fn remote_info(key_byte: u8, genesis: [u8; 32], version: &str, flags: ServiceFlags) -> NodeInfo {
    NodeInfo {
        pub_key: [key_byte; 32],
        version: version.to_string(),
        listen_addr: "127.0.0.1:1".to_string(),
        genesis_hash: genesis,
        best_height: 0,
        best_hash: [0u8; 32],
        service_flags: flags,
    }
}

// ============================================================================
// Two switches connect over loopback
// ============================================================================

#[tokio::test]
async fn test_two_switches_connect() {
    let s1 = make_switch(test_config(), None);
    let s2 = make_switch(test_config(), None);
    s1.add_reactor("foo", TestReactor::new(&[0x00]));
    s2.add_reactor("foo", TestReactor::new(&[0x00]));

    s1.start().await.unwrap();
    s2.start().await.unwrap();

    let s2_addr = s2.listen_net_address().unwrap();
    s1.dial_peer_with_address(&s2_addr).await.unwrap();

    assert_eq!(s1.peers().size(), 1);
    assert!(wait_for(3000, || s2.peers().size() == 1).await);

    let (outbound, inbound, _) = s1.num_peers();
    assert_eq!((outbound, inbound), (1, 0));
    let (outbound, inbound, _) = s2.num_peers();
    assert_eq!((outbound, inbound), (0, 1));

    s1.stop().await;
    s2.stop().await;
}

// ============================================================================
// Self-connection is filtered by identity
// ============================================================================

#[tokio::test]
async fn test_dial_peer_with_own_key_is_rejected() {
    let s1 = make_switch(test_config(), None);
    s1.add_reactor("foo", TestReactor::new(&[0x00]));
    s1.start().await.unwrap();

    // A remote that presents our own public key.
    let rp = spawn_remote_peer(s1.node_info()).await;

    let result = s1.dial_peer_with_address(&rp).await;
    assert!(matches!(result, Err(P2pError::ConnectSelf)));
    assert_eq!(s1.peers().size(), 0);

    s1.stop().await;
}

// ============================================================================
// Handshake compatibility checks
// ============================================================================

#[tokio::test]
async fn test_wrong_genesis_is_rejected() {
    let s1 = make_switch(test_config(), None);
    s1.add_reactor("foo", TestReactor::new(&[0x00]));
    s1.start().await.unwrap();

    let rp = spawn_remote_peer(remote_info(9, [9u8; 32], "0.1.0", ServiceFlags::FULL_NODE)).await;

    let result = s1.dial_peer_with_address(&rp).await;
    assert!(matches!(result, Err(P2pError::WrongNetwork { .. })));

    s1.stop().await;
}

#[tokio::test]
async fn test_incompatible_version_is_rejected() {
    let s1 = make_switch(test_config(), None);
    s1.add_reactor("foo", TestReactor::new(&[0x00]));
    s1.start().await.unwrap();

    let rp = spawn_remote_peer(remote_info(9, GENESIS, "9.0.0", ServiceFlags::FULL_NODE)).await;

    let result = s1.dial_peer_with_address(&rp).await;
    assert!(matches!(result, Err(P2pError::IncompatibleVersion { .. })));

    s1.stop().await;
}

#[tokio::test]
async fn test_outbound_spv_peer_is_rejected() {
    let s1 = make_switch(test_config(), None);
    s1.add_reactor("foo", TestReactor::new(&[0x00]));
    s1.start().await.unwrap();

    let rp = spawn_remote_peer(remote_info(9, GENESIS, "0.1.0", ServiceFlags::NONE)).await;

    let result = s1.dial_peer_with_address(&rp).await;
    assert!(matches!(result, Err(P2pError::ConnectSpvPeer)));
    assert_eq!(s1.peers().size(), 0);

    s1.stop().await;
}

// ============================================================================
// Ban enforcement, expiry, and persistence across a store reopen
// ============================================================================

#[tokio::test]
async fn test_ban_expiry_and_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("trusthistory");

    let config = test_config().with_dial_timeout(Duration::from_millis(300));
    let store = Arc::new(SledKv::open(&db_path).unwrap());
    let s1 = Switch::new(config.clone(), GENESIS, 0, [0u8; 32], None, store).unwrap();
    s1.add_reactor("foo", TestReactor::new(&[0x00]));
    s1.start().await.unwrap();

    s1.add_banned_peer("10.0.0.7").unwrap();
    s1.ban_peer_until("10.0.0.8", Utc::now() - ChronoDuration::seconds(1))
        .unwrap();

    let banned_addr: NetAddress = "10.0.0.7:26656".parse().unwrap();
    assert!(matches!(
        s1.dial_peer_with_address(&banned_addr).await,
        Err(P2pError::ConnectBannedPeer)
    ));

    // The expired entry no longer rejects the dial; the attempt fails at
    // the transport instead.
    let expired_addr: NetAddress = "10.0.0.8:26656".parse().unwrap();
    let result = s1.dial_peer_with_address(&expired_addr).await;
    assert!(!matches!(result, Err(P2pError::ConnectBannedPeer)));
    assert!(result.is_err());

    s1.stop().await;
    drop(s1);

    // Simulated restart: reopen the store.
    let store = Arc::new(SledKv::open(&db_path).unwrap());
    let s2 = Switch::new(config, GENESIS, 0, [0u8; 32], None, store).unwrap();
    s2.add_reactor("foo", TestReactor::new(&[0x00]));
    s2.start().await.unwrap();

    assert!(matches!(
        s2.dial_peer_with_address(&banned_addr).await,
        Err(P2pError::ConnectBannedPeer)
    ));
    let result = s2.dial_peer_with_address(&expired_addr).await;
    assert!(!matches!(result, Err(P2pError::ConnectBannedPeer)));

    s2.stop().await;
}

// ============================================================================
// Frames surface in exactly the reactor that declared the channel
// ============================================================================

#[tokio::test]
async fn test_channel_routing_to_owning_reactor() {
    let s1 = make_switch(test_config(), None);
    let s2 = make_switch(test_config(), None);

    s1.add_reactor("foo", TestReactor::new(&[0x00, 0x01]));
    s1.add_reactor("bar", TestReactor::new(&[0x02, 0x03]));

    let reactor_a = TestReactor::new(&[0x00, 0x01]);
    let reactor_b = TestReactor::new(&[0x02, 0x03]);
    s2.add_reactor("foo", reactor_a.clone());
    s2.add_reactor("bar", reactor_b.clone());

    s1.start().await.unwrap();
    s2.start().await.unwrap();

    let s2_addr = s2.listen_net_address().unwrap();
    s1.dial_peer_with_address(&s2_addr).await.unwrap();
    assert!(wait_for(3000, || s2.peers().size() == 1).await);

    let peer = s1.peers().list().remove(0);
    assert!(peer.send(0x02, b"channel two".to_vec()).await);
    assert!(peer.send(0x00, b"channel zero".to_vec()).await);

    assert!(wait_for(3000, || reactor_b.received_count() == 1).await);
    assert!(wait_for(3000, || reactor_a.received_count() == 1).await);

    assert_eq!(reactor_b.received_on(0x02), vec![b"channel two".to_vec()]);
    assert_eq!(reactor_a.received_on(0x00), vec![b"channel zero".to_vec()]);
    assert!(reactor_a.received_on(0x02).is_empty());
    assert!(reactor_b.received_on(0x00).is_empty());

    s1.stop().await;
    s2.stop().await;
}

// ============================================================================
// Duplicate channel claims are a fatal configuration error
// ============================================================================

#[tokio::test]
#[should_panic(expected = "multiple reactors")]
async fn test_duplicate_channel_registration_panics() {
    let s1 = make_switch(test_config(), None);
    s1.add_reactor("foo", TestReactor::new(&[0x00, 0x01]));
    s1.add_reactor("bar", TestReactor::new(&[0x01]));
}

// ============================================================================
// Reactor add_peer ordering and rejection
// ============================================================================

#[tokio::test]
async fn test_add_peer_callbacks_in_registration_order() {
    let s1 = make_switch(test_config(), None);
    let s2 = make_switch(test_config(), None);

    let log = Arc::new(Mutex::new(Vec::new()));
    s2.add_reactor("first", TestReactor::with_add_log(&[0x00], "first", log.clone()));
    s2.add_reactor("second", TestReactor::with_add_log(&[0x01], "second", log.clone()));
    s1.add_reactor("foo", TestReactor::new(&[0x00, 0x01]));

    s1.start().await.unwrap();
    s2.start().await.unwrap();

    s1.dial_peer_with_address(&s2.listen_net_address().unwrap())
        .await
        .unwrap();
    assert!(wait_for(3000, || s2.peers().size() == 1).await);

    assert_eq!(*log.lock().unwrap(), vec!["first".to_string(), "second".to_string()]);

    s1.stop().await;
    s2.stop().await;
}

#[tokio::test]
async fn test_reactor_rejection_removes_peer() {
    let s1 = make_switch(test_config(), None);
    let s2 = make_switch(test_config(), None);

    s1.add_reactor("foo", TestReactor::new(&[0x00]));
    let rejecting = TestReactor::rejecting(&[0x00]);
    s2.add_reactor("foo", rejecting.clone());

    s1.start().await.unwrap();
    s2.start().await.unwrap();

    // The dial may or may not error on s1's side depending on when s2
    // drops the connection; s2 must end up with no peers either way.
    let _ = s1
        .dial_peer_with_address(&s2.listen_net_address().unwrap())
        .await;

    assert!(wait_for(3000, || s2.peers().size() == 0).await);
    assert!(wait_for(3000, || rejecting.removed_count() == 1).await);
    assert!(wait_for(3000, || s1.peers().size() == 0).await);
    assert_eq!(rejecting.added_count(), 0);

    s1.stop().await;
    s2.stop().await;
}

// ============================================================================
// Peer-set size bound under accept pressure
// ============================================================================

#[tokio::test]
async fn test_max_num_peers_bounds_inbound() {
    let server = make_switch(test_config().with_max_num_peers(1), None);
    server.add_reactor("foo", TestReactor::new(&[0x00]));
    server.start().await.unwrap();
    let server_addr = server.listen_net_address().unwrap();

    let c1 = make_switch(test_config(), None);
    c1.add_reactor("foo", TestReactor::new(&[0x00]));
    c1.start().await.unwrap();
    c1.dial_peer_with_address(&server_addr).await.unwrap();
    assert!(wait_for(3000, || server.peers().size() == 1).await);

    let c2 = make_switch(test_config(), None);
    c2.add_reactor("foo", TestReactor::new(&[0x00]));
    c2.start().await.unwrap();
    let result = c2.dial_peer_with_address(&server_addr).await;

    assert!(result.is_err());
    assert_eq!(server.peers().size(), 1);

    server.stop().await;
    c1.stop().await;
    c2.stop().await;
}

// ============================================================================
// Outbound maintenance reaches the target from discovery candidates
// ============================================================================

struct StaticDiscv {
    nodes: Vec<NodeRecord>,
}

impl Discv for StaticDiscv {
    fn read_random_nodes(&self, buf: &mut [NodeRecord]) -> usize {
        let n = buf.len().min(self.nodes.len());
        for (slot, node) in buf.iter_mut().zip(self.nodes.iter()) {
            *slot = node.clone();
        }
        n
    }
}

#[tokio::test]
async fn test_outbound_maintenance_reaches_target() {
    // Distinct loopback hosts so the per-host connected filter does not
    // collapse the candidates.
    let mut servers = Vec::new();
    let mut nodes = Vec::new();
    for (i, host) in ["127.0.0.1", "127.0.0.2", "127.0.0.3"].iter().enumerate() {
        let server = make_switch(test_config_on(host), None);
        server.add_reactor("foo", TestReactor::new(&[0x00]));
        server.start().await.unwrap();

        let addr = server.local_addr().unwrap();
        nodes.push(NodeRecord {
            id: NodeId([i as u8 + 1; 32]),
            ip: addr.ip(),
            tcp_port: addr.port(),
            udp_port: addr.port(),
        });
        servers.push(server);
    }

    let discv: Arc<dyn Discv> = Arc::new(StaticDiscv { nodes });
    let client = make_switch(test_config(), Some(discv));
    client.add_reactor("foo", TestReactor::new(&[0x00]));
    client.start().await.unwrap();

    assert!(
        wait_for(5000, || client.num_peers().0 >= 3).await,
        "outbound count never reached the target: {:?}",
        client.num_peers()
    );

    client.stop().await;
    for server in servers {
        server.stop().await;
    }
}

#[tokio::test]
async fn test_maintenance_with_empty_discovery_is_a_no_op() {
    let discv: Arc<dyn Discv> = Arc::new(StaticDiscv { nodes: Vec::new() });
    let s1 = make_switch(test_config(), Some(discv));
    s1.add_reactor("foo", TestReactor::new(&[0x00]));
    s1.start().await.unwrap();

    // Let the initial maintenance run fire.
    sleep(Duration::from_millis(200)).await;

    assert_eq!(s1.num_peers(), (0, 0, 0));
    s1.stop().await;
}

// ============================================================================
// Graceful shutdown
// ============================================================================

#[tokio::test]
async fn test_graceful_shutdown() {
    let s1 = make_switch(test_config(), None);
    let s2 = make_switch(test_config(), None);
    s1.add_reactor("foo", TestReactor::new(&[0x00]));
    let reactor = TestReactor::new(&[0x00]);
    s2.add_reactor("foo", reactor.clone());

    s1.start().await.unwrap();
    s2.start().await.unwrap();

    s1.dial_peer_with_address(&s2.listen_net_address().unwrap())
        .await
        .unwrap();
    assert!(wait_for(3000, || s2.peers().size() == 1).await);

    s1.stop().await;
    assert_eq!(s1.peers().size(), 0);

    // Post-stop operations fail with the closed-state error.
    let addr = s2.listen_net_address().unwrap();
    assert!(matches!(
        s1.dial_peer_with_address(&addr).await,
        Err(P2pError::Shutdown)
    ));

    // The remote notices the disconnect and cleans up.
    assert!(wait_for(3000, || s2.peers().size() == 0).await);
    assert!(wait_for(3000, || reactor.removed_count() == 1).await);

    s2.stop().await;
    // stop is idempotent
    s2.stop().await;
}
