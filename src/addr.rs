//! Translation between the game's IPX-shaped addresses and IPv4.
//!
//! The game only speaks IPX. Its `sockaddr_ipx` has room for a 6-byte node
//! number and a 4-byte network number, which is enough to smuggle an IPv4
//! address, a port and one spare flag byte through the game untouched:
//!
//! ```text
//! netnum  [0]=1  [1]=p2p flag  [2]=0  [3]=0
//! nodenum [0..4]=IPv4 octets  [4..6]=port (network order)
//! ```
//!
//! All-0xFF netnum or all-0xFF nodenum means broadcast.

use std::net::{Ipv4Addr, SocketAddrV4};

/// `AF_IPX`, the address family the game opens its sockets with.
pub const AF_IPX: i32 = 6;
/// `AF_INET`.
pub const AF_INET: i32 = 2;

/// Native (`sockaddr_ipx`) address as handed to and from the game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpxAddress {
    pub family: i32,
    pub netnum: [u8; 4],
    pub nodenum: [u8; 6],
    pub socket: u16,
}

impl IpxAddress {
    /// The address the game sends to when it broadcasts.
    pub const BROADCAST: IpxAddress = IpxAddress {
        family: AF_IPX,
        netnum: [0xFF; 4],
        nodenum: [0xFF; 6],
        socket: 0,
    };

    pub fn is_broadcast(&self) -> bool {
        self.netnum.iter().all(|&b| b == 0xFF) || self.nodenum.iter().all(|&b| b == 0xFF)
    }

    /// Recover the IPv4 endpoint and flag carried by this address.
    pub fn to_peer(&self) -> PeerAddress {
        let ip = Ipv4Addr::new(
            self.nodenum[0],
            self.nodenum[1],
            self.nodenum[2],
            self.nodenum[3],
        );
        PeerAddress {
            ip,
            port: u16::from_be_bytes([self.nodenum[4], self.nodenum[5]]),
            p2p: self.netnum[1] != 0,
        }
    }
}

impl From<PeerAddress> for IpxAddress {
    fn from(peer: PeerAddress) -> Self {
        let ip = peer.ip.octets();
        let port = peer.port.to_be_bytes();
        IpxAddress {
            family: AF_IPX,
            netnum: [1, peer.p2p as u8, 0, 0],
            nodenum: [ip[0], ip[1], ip[2], ip[3], port[0], port[1]],
            socket: 0,
        }
    }
}

/// Logical IPv4 endpoint of a tunneled datagram plus its P2P flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub p2p: bool,
}

impl PeerAddress {
    pub fn new(ip: Ipv4Addr, port: u16, p2p: bool) -> Self {
        Self { ip, port, p2p }
    }

    pub fn from_socket(addr: SocketAddrV4, p2p: bool) -> Self {
        Self::new(*addr.ip(), addr.port(), p2p)
    }

    pub fn socket_addr(&self) -> SocketAddrV4 {
        SocketAddrV4::new(self.ip, self.port)
    }
}

/// Address argument of a socket call: either the game's IPX address or a
/// plain IPv4 one belonging to some other socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockAddr {
    Ipx(IpxAddress),
    Inet(SocketAddrV4),
}

impl SockAddr {
    pub fn family(&self) -> i32 {
        match self {
            SockAddr::Ipx(addr) => addr.family,
            SockAddr::Inet(_) => AF_INET,
        }
    }
}
