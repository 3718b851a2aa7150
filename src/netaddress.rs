//! Network endpoint addresses.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::protocol_and_address;
use crate::error::{P2pError, P2pResult};

/// A dialable network endpoint. The canonical string form `ip:port` is
/// the dialing key; ban and dialing bookkeeping key on the host string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    /// IP address of the endpoint.
    pub ip: IpAddr,
    /// TCP port of the endpoint.
    pub port: u16,
}

impl NetAddress {
    /// Create a new address from IP and port.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The host string, used as ban-list and dialing-set key.
    pub fn host(&self) -> String {
        self.ip.to_string()
    }

    /// Whether two addresses refer to the same host.
    pub fn same_host(&self, other: &NetAddress) -> bool {
        self.ip == other.ip
    }

    /// Convert to a socket address for dialing.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Parse a listen string of the form `[proto://]host:port`.
    /// The protocol prefix is accepted and discarded; only tcp is used.
    pub fn from_listen_addr(listen_addr: &str) -> P2pResult<Self> {
        let (_, address) = protocol_and_address(listen_addr);
        address.parse()
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl FromStr for NetAddress {
    type Err = P2pError;

    fn from_str(s: &str) -> P2pResult<Self> {
        let addr: SocketAddr = s
            .parse()
            .map_err(|_| P2pError::InvalidAddress(s.to_string()))?;
        Ok(addr.into())
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}
