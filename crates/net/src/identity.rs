//! Endpoint identity used to key client tables.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Address and port of a remote endpoint.
///
/// Clients bind their datagram socket to the local port of their stream, so
/// one identity names both transports of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetIdentity {
    /// Remote address.
    pub address: IpAddr,
    /// Remote port.
    pub port: u16,
}

impl NetIdentity {
    /// Construct an identity.
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    /// Socket address for sending.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl From<SocketAddr> for NetIdentity {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for NetIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}
