//! Network addresses in multiaddr text form
//!
//! Supported forms:
//! - `/ip4/127.0.0.1/tcp/4001`
//! - `/ip6/::1/tcp/4001`
//! - `/memory/7` (in-process transport)
//!
//! A [`P2pAddr`] appends the peer identity: `/ip4/127.0.0.1/tcp/4001/p2p/<hex>`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::ProtocolError;
use crate::types::PeerId;

/// Network-reachability descriptor for a peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    /// TCP over IPv4 or IPv6
    Tcp(SocketAddr),

    /// In-process memory transport port
    Memory(u64),
}

impl Address {
    /// TCP socket address, if this is a TCP address
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Address::Tcp(addr) => Some(*addr),
            Address::Memory(_) => None,
        }
    }

    /// Memory port, if this is a memory address
    pub fn memory_port(&self) -> Option<u64> {
        match self {
            Address::Memory(port) => Some(*port),
            Address::Tcp(_) => None,
        }
    }

    /// Whether this is a TCP wildcard address (`0.0.0.0` or `::`)
    pub fn is_unspecified(&self) -> bool {
        matches!(self, Address::Tcp(addr) if addr.ip().is_unspecified())
    }

    /// Attach a peer identity to this address
    pub fn with_peer(self, peer_id: PeerId) -> P2pAddr {
        P2pAddr {
            address: self,
            peer_id,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(SocketAddr::V4(addr)) => {
                write!(f, "/ip4/{}/tcp/{}", addr.ip(), addr.port())
            }
            Address::Tcp(SocketAddr::V6(addr)) => {
                write!(f, "/ip6/{}/tcp/{}", addr.ip(), addr.port())
            }
            Address::Memory(port) => write!(f, "/memory/{}", port),
        }
    }
}

/// Parse the transport part of a multiaddr, returning the unparsed remainder
fn parse_transport<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    input: &str,
) -> Result<Address, ProtocolError> {
    let invalid = |reason: &str| ProtocolError::InvalidAddress(format!("{}: {}", input, reason));

    match parts.next() {
        Some(proto @ ("ip4" | "ip6")) => {
            let ip: IpAddr = parts
                .next()
                .ok_or_else(|| invalid("missing ip"))?
                .parse()
                .map_err(|_| invalid("bad ip"))?;
            if (proto == "ip4") != ip.is_ipv4() {
                return Err(invalid("ip version mismatch"));
            }
            if parts.next() != Some("tcp") {
                return Err(invalid("expected /tcp"));
            }
            let port: u16 = parts
                .next()
                .ok_or_else(|| invalid("missing port"))?
                .parse()
                .map_err(|_| invalid("bad port"))?;
            Ok(Address::Tcp(SocketAddr::new(ip, port)))
        }
        Some("memory") => {
            let port: u64 = parts
                .next()
                .ok_or_else(|| invalid("missing memory port"))?
                .parse()
                .map_err(|_| invalid("bad memory port"))?;
            Ok(Address::Memory(port))
        }
        Some(other) => Err(invalid(&format!("unsupported protocol '{}'", other))),
        None => Err(invalid("empty address")),
    }
}

fn split_multiaddr(s: &str) -> Result<impl Iterator<Item = &str>, ProtocolError> {
    let rest = s
        .strip_prefix('/')
        .ok_or_else(|| ProtocolError::InvalidAddress(format!("{}: must start with '/'", s)))?;
    Ok(rest.split('/'))
}

impl FromStr for Address {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = split_multiaddr(s)?;
        let address = parse_transport(&mut parts, s)?;
        if parts.next().is_some() {
            return Err(ProtocolError::InvalidAddress(format!(
                "{}: trailing components",
                s
            )));
        }
        Ok(address)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Tcp(addr)
    }
}

/// Address with the identity of the peer expected behind it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct P2pAddr {
    pub address: Address,
    pub peer_id: PeerId,
}

impl fmt::Display for P2pAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/p2p/{}", self.address, self.peer_id.to_hex())
    }
}

impl FromStr for P2pAddr {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = split_multiaddr(s)?;
        let address = parse_transport(&mut parts, s)?;

        if parts.next() != Some("p2p") {
            return Err(ProtocolError::InvalidAddress(format!(
                "{}: expected /p2p/<peer-id>",
                s
            )));
        }
        let peer_id = PeerId::from_hex(parts.next().unwrap_or_default())?;
        if parts.next().is_some() {
            return Err(ProtocolError::InvalidAddress(format!(
                "{}: trailing components",
                s
            )));
        }

        Ok(P2pAddr { address, peer_id })
    }
}
