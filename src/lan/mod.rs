//! LAN peer discovery over multicast DNS.
//!
//! Publishes a `lanDiscv` service record for this node and, once the
//! first subscriber arrives, browses for the same service on the local
//! network. Observed peers are posted as [`LanPeerEvent`]s on a typed
//! broadcast bus that the switch consumes like any other dial hint.
//!
//! The record is re-registered hourly to survive responder restarts.
//! Shutdown closes the resolver quit, then the service quit, then the
//! daemon; dropping the discover closes the event bus last.

use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::config::protocol_and_address;
use crate::error::{P2pError, P2pResult};

/// Service type browsed and registered on the LAN.
pub const SERVICE_TYPE: &str = "_lanDiscv._tcp.local.";

/// Instance name of our service record.
pub const INSTANCE_NAME: &str = "bytomd";

const HOST_NAME: &str = "bytomd.local.";

/// The responder record is refreshed at this interval.
const REREGISTER_INTERVAL: Duration = Duration::from_secs(3600);

/// Recently resolved instances, to drop repeated announcements.
const SEEN_CACHE_SIZE: usize = 64;

const EVENT_BUS_CAPACITY: usize = 16;

/// A peer observed on the local network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanPeerEvent {
    /// Addresses the service resolved to.
    pub ips: Vec<IpAddr>,
    /// Advertised peer listen port.
    pub port: u16,
}

/// LAN discovery beacon and resolver.
pub struct LanDiscover {
    daemon: ServiceDaemon,
    event_tx: broadcast::Sender<LanPeerEvent>,
    resolver_started: AtomicBool,
    resolver_quit: broadcast::Sender<()>,
    service_quit: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LanDiscover {
    /// Start the beacon for a node listening on `listen_addr`. The
    /// resolver side stays idle until the first [`LanDiscover::subscribe`].
    pub fn new(listen_addr: &str, chain_id: &str) -> P2pResult<Self> {
        let (_, address) = protocol_and_address(listen_addr);
        let service_port: u16 = address
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
            .ok_or_else(|| P2pError::InvalidAddress(listen_addr.to_string()))?;

        let daemon = ServiceDaemon::new().map_err(|e| P2pError::Mdns(e.to_string()))?;
        let (event_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (resolver_quit, _) = broadcast::channel(1);
        let (service_quit, _) = broadcast::channel(1);

        let discover = Self {
            daemon,
            event_tx,
            resolver_started: AtomicBool::new(false),
            resolver_quit,
            service_quit,
            handles: Mutex::new(Vec::new()),
        };
        discover.spawn_service_routine(service_port, chain_id.to_string());

        Ok(discover)
    }

    /// Subscribe to LAN peer events. The first subscription starts the
    /// resolver.
    pub fn subscribe(&self) -> P2pResult<broadcast::Receiver<LanPeerEvent>> {
        if !self.resolver_started.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.start_resolver() {
                self.resolver_started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        Ok(self.event_tx.subscribe())
    }

    /// Stop resolver, then service, then the responder daemon.
    pub fn stop(&self) {
        let _ = self.resolver_quit.send(());
        let _ = self.service_quit.send(());
        let _ = self.daemon.shutdown();
    }

    fn spawn_service_routine(&self, service_port: u16, chain_id: String) {
        let daemon = self.daemon.clone();
        let mut quit = self.service_quit.subscribe();

        let handle = tokio::spawn(async move {
            if let Err(e) = register_service(&daemon, service_port, &chain_id) {
                tracing::error!(error = %e, "mDNS service register error");
                return;
            }

            let mut ticker = interval(REREGISTER_INTERVAL);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let fullname = format!("{}.{}", INSTANCE_NAME, SERVICE_TYPE);
                        let _ = daemon.unregister(&fullname);
                        if let Err(e) = register_service(&daemon, service_port, &chain_id) {
                            tracing::error!(error = %e, "mDNS service register error");
                            return;
                        }
                    }
                    _ = quit.recv() => return,
                }
            }
        });

        self.handles.lock().expect("lock poisoned").push(handle);
    }

    fn start_resolver(&self) -> P2pResult<()> {
        let receiver = self
            .daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| P2pError::Mdns(e.to_string()))?;

        let event_tx = self.event_tx.clone();
        let mut quit = self.resolver_quit.subscribe();

        let handle = tokio::spawn(async move {
            let mut seen = LruCache::new(NonZeroUsize::new(SEEN_CACHE_SIZE).expect("nonzero"));

            loop {
                tokio::select! {
                    _ = quit.recv() => return,

                    event = receiver.recv_async() => match event {
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            let ips: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
                            if ips.is_empty() {
                                continue;
                            }
                            let key = (info.get_fullname().to_string(), info.get_port());
                            if seen.put(key, ()).is_some() {
                                continue;
                            }
                            tracing::debug!(port = info.get_port(), "LAN peer resolved");
                            let _ = event_tx.send(LanPeerEvent {
                                ips,
                                port: info.get_port(),
                            });
                        }
                        Ok(_) => {}
                        Err(_) => return,
                    }
                }
            }
        });

        self.handles.lock().expect("lock poisoned").push(handle);
        Ok(())
    }
}

fn register_service(daemon: &ServiceDaemon, port: u16, chain_id: &str) -> P2pResult<()> {
    let properties = [("ChainID", chain_id)];
    let info = ServiceInfo::new(SERVICE_TYPE, INSTANCE_NAME, HOST_NAME, "", port, &properties[..])
        .map_err(|e| P2pError::Mdns(e.to_string()))?
        .enable_addr_auto();

    daemon
        .register(info)
        .map_err(|e| P2pError::Mdns(e.to_string()))
}
