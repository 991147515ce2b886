//! CnCNet4 relay tunnel for IPX games.
//!
//! The game believes it is talking IPX. Its socket calls are redirected to a
//! [`SocketFacade`], which hands IPX traffic to a [`TunnelSession`]: every
//! datagram is wrapped for a CnCNet relay server over one UDP socket, or sent
//! straight to a peer once the relay has confirmed direct connectivity.
//!
//! ```text
//! game ──> SocketFacade ──> TunnelSession ──> wire + addr ──> UDP ──> relay / peer
//!               └────────────> OS sockets (everything that is not IPX)
//! ```

pub mod addr;
pub mod config;
pub mod facade;
pub mod tunnel;
pub mod udp;
pub mod wire;

mod tunnel_info_bridge;

pub use addr::{IpxAddress, PeerAddress, SockAddr};
pub use config::{ConfigError, TunnelConfig};
pub use facade::{HostResolver, SocketApi, SocketFacade, SystemHostResolver};
pub use tunnel::{
    InitError, TunnelSession, TunnelState, IDLE_POLL_TIMEOUT, P2P_PORT, TUNNEL_SOCKET,
};
pub use tunnel_info_bridge::TunnelTraffic;
pub use udp::{SocketHandle, Transport, UdpTransport};
