//! Peer addresses in multiaddr-style text form

use crate::{NodeError, Result};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tss_core::PeerId;

/// A dialable peer: socket address plus overlay identity.
///
/// Renders as `/ip4/<ip>/tcp/<port>/p2p/<peer-id>`, the format used in the
/// address book seed file and the `--peer` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetAddress {
    pub addr: SocketAddr,
    pub peer: PeerId,
}

impl NetAddress {
    pub fn new(addr: SocketAddr, peer: PeerId) -> Self {
        Self { addr, peer }
    }

    /// Whether this entry points at a loopback interface
    pub fn is_loopback(&self) -> bool {
        self.addr.ip().is_loopback()
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.addr.ip() {
            IpAddr::V4(_) => "ip4",
            IpAddr::V6(_) => "ip6",
        };
        write!(
            f,
            "/{}/{}/tcp/{}/p2p/{}",
            proto,
            self.addr.ip(),
            self.addr.port(),
            self.peer
        )
    }
}

impl FromStr for NetAddress {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            [proto, ip, "tcp", port, "p2p", peer] if *proto == "ip4" || *proto == "ip6" => {
                let ip: IpAddr = ip
                    .parse()
                    .map_err(|e| NodeError::InvalidRequest(format!("invalid ip in address {s}: {e}")))?;
                let port: u16 = port
                    .parse()
                    .map_err(|e| NodeError::InvalidRequest(format!("invalid port in address {s}: {e}")))?;
                Ok(NetAddress {
                    addr: SocketAddr::new(ip, port),
                    peer: PeerId::from(*peer),
                })
            }
            _ => Err(NodeError::InvalidRequest(format!(
                "invalid address in address book {s}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let addr = NetAddress {
            addr: "192.168.1.7:6668".parse().unwrap(),
            peer: PeerId::from("abcdef"),
        };
        let text = addr.to_string();
        assert_eq!(text, "/ip4/192.168.1.7/tcp/6668/p2p/abcdef");
        assert_eq!(text.parse::<NetAddress>().unwrap(), addr);
    }

    #[test]
    fn test_loopback_detection() {
        let addr: NetAddress = "/ip4/127.0.0.1/tcp/6668/p2p/abc".parse().unwrap();
        assert!(addr.is_loopback());
        let addr: NetAddress = "/ip4/10.0.0.1/tcp/6668/p2p/abc".parse().unwrap();
        assert!(!addr.is_loopback());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("/ip4/127.0.0.1/udp/1/p2p/x".parse::<NetAddress>().is_err());
        assert!("gibberish".parse::<NetAddress>().is_err());
        assert!("/ip4/not-an-ip/tcp/1/p2p/x".parse::<NetAddress>().is_err());
    }
}
