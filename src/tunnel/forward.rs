//! Translation of the game's IPX datagrams to and from relay traffic.
//!
//! Relay-wrapped datagrams, in both directions:
//!
//! ```text
//! +------+---------+--------+---------+
//! | flag | IPv4 (4)| port(2)| payload |
//! +------+---------+--------+---------+
//! ```
//!
//! Outbound the address is the destination, inbound it is the origin the
//! relay received the datagram from. Address and port keep the byte order
//! they have inside a `sockaddr_in`. Direct P2P datagrams carry the bare
//! payload.

use super::{not_active, TunnelSession, P2P_PORT};
use crate::addr::{IpxAddress, PeerAddress};
use crate::udp::{is_timeout, Transport};
use crate::wire::Command;
use log::{debug, trace};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

const BROADCAST_IP: Ipv4Addr = Ipv4Addr::BROADCAST;
const BROADCAST_PORT: u16 = 0xFFFF;

impl<T: Transport> TunnelSession<T> {
    /// Receive one datagram for the game.
    ///
    /// Returns the number of payload bytes copied into `buf` and the IPX
    /// address of the logical sender. `Ok((0, None))` means nothing usable
    /// arrived: a relay keepalive that was answered here, or a datagram from
    /// a sender the session does not accept, or nothing at all within the
    /// poll timeout.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<IpxAddress>)> {
        let transport = self.transport.as_mut().ok_or_else(not_active)?;
        let (len, from) = match transport.recv_from(self.inbound.prepare()) {
            Ok(received) => received,
            Err(e) if is_timeout(&e) => return Ok((0, None)),
            Err(e) => return Err(e),
        };
        self.inbound.set_filled(len);
        if len == 0 {
            return Ok((0, None));
        }
        self.traffic.record_rx(len);

        let mut peer = PeerAddress::from_socket(from, false);
        if self.dedicated && Some(from) == self.server {
            let command = self.inbound.read_i8();
            if command == Command::Ping as i8 {
                let echo = self.inbound.read_i32();
                trace!("answering relay keepalive {echo}");
                self.outbound.write_i8(Command::Ping as i8);
                self.outbound.write_i32(echo);
                self.flush(from);
                return Ok((0, None));
            }
            peer.p2p = command != 0;
            peer.ip = Ipv4Addr::from(self.inbound.read_i32().to_ne_bytes());
            peer.port = u16::from_be_bytes(self.inbound.read_i16().to_ne_bytes());
        } else if self.dedicated && self.peer_to_peer {
            peer.p2p = true;
        } else if self.dedicated {
            debug!("dropping {len} byte datagram from unexpected sender {from}");
            self.info_bridge
                .post_log(&format!("dropped datagram from unexpected sender {from}"));
            return Ok((0, None));
        }

        // Peers always answer each other on the P2P listen port.
        if peer.p2p {
            peer.port = P2P_PORT;
        }

        let copied = self.inbound.read_bytes(buf);
        Ok((copied, Some(IpxAddress::from(peer))))
    }

    /// Send one game datagram to `to`.
    ///
    /// Always reports the full payload as sent; delivery failures are only
    /// logged, like any lost datagram.
    ///
    /// # Panics
    ///
    /// Panics if the payload plus the relay header exceeds the datagram
    /// buffer.
    pub fn send_to(&mut self, payload: &[u8], to: &IpxAddress) -> io::Result<usize> {
        let server = self.server.ok_or_else(not_active)?;
        if self.transport.is_none() {
            return Err(not_active());
        }

        if !self.dedicated {
            let dest = if to.is_broadcast() {
                server
            } else {
                to.to_peer().socket_addr()
            };
            self.outbound.write_bytes(payload);
            self.flush(dest);
            return Ok(payload.len());
        }

        if to.is_broadcast() {
            self.write_relay_header(BROADCAST_IP, BROADCAST_PORT);
        } else {
            let peer = to.to_peer();
            if peer.p2p && self.peer_to_peer {
                self.outbound.write_bytes(payload);
                self.flush(peer.socket_addr());
                return Ok(payload.len());
            }
            self.write_relay_header(peer.ip, peer.port);
        }
        self.outbound.write_bytes(payload);
        self.flush(server);
        Ok(payload.len())
    }

    /// The game closed its IPX socket. Tells the relay we left; the tunnel
    /// socket itself stays open until [`TunnelSession::shutdown`].
    pub fn close_socket(&mut self) {
        if !self.dedicated {
            return;
        }
        if let Some(server) = self.server {
            debug!("notifying relay {server} of disconnect");
            self.outbound.write_i8(Command::Disconnect as i8);
            self.flush(server);
        }
    }

    fn write_relay_header(&mut self, ip: Ipv4Addr, port: u16) {
        self.outbound.write_i8(self.peer_to_peer as i8);
        self.outbound.write_i32(i32::from_ne_bytes(ip.octets()));
        self.outbound.write_i16(i16::from_ne_bytes(port.to_be_bytes()));
    }

    /// Send the assembled datagram to `to` and clear the buffer.
    fn flush(&mut self, to: SocketAddrV4) {
        if let Some(transport) = self.transport.as_mut() {
            match transport.send_to(self.outbound.as_slice(), to) {
                Ok(len) => self.traffic.record_tx(len),
                Err(e) => debug!("send to {to} failed: {e}"),
            }
        }
        self.outbound.discard();
    }
}
