//! UDP transport used by the tunnel.
//!
//! The tunnel talks to the relay (and to peers) through a single datagram
//! socket. [`Transport`] is the seam the session is written against so the
//! handshake and forwarding logic can run over a scripted socket in tests.

use log::debug;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// Raw OS socket handle as seen by the game.
pub type SocketHandle = u64;

/// Datagram socket operations the tunnel session needs.
pub trait Transport {
    /// Send one datagram, returning the number of bytes handed to the OS.
    fn send_to(&mut self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize>;

    /// Receive one datagram. Timeouts surface as `WouldBlock`/`TimedOut`.
    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)>;

    /// Bound how long [`Transport::recv_from`] may block; `None` blocks forever.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Bind the socket to a local listen address.
    fn bind(&mut self, addr: SocketAddrV4) -> io::Result<()>;

    /// Underlying OS handle.
    fn raw_handle(&self) -> SocketHandle;
}

/// [`Transport`] over a real UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Create an unbound datagram socket with `SO_REUSEADDR` and
    /// `SO_BROADCAST` set. The OS binds it implicitly on first send.
    pub fn open() -> io::Result<Self> {
        Ok(Self {
            socket: new_socket()?.into(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

fn new_socket() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    Ok(socket)
}

impl Transport for UdpTransport {
    fn send_to(&mut self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
        self.socket.send_to(buf, addr)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        loop {
            let (len, from) = self.socket.recv_from(buf)?;
            match from {
                SocketAddr::V4(from) => return Ok((len, from)),
                SocketAddr::V6(from) => debug!("ignoring datagram from {from}"),
            }
        }
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    fn bind(&mut self, addr: SocketAddrV4) -> io::Result<()> {
        if let Err(e) = SockRef::from(&self.socket).bind(&addr.into()) {
            // Sending implicitly bound the socket already; reopen it on the
            // requested address instead, keeping the configured timeout.
            debug!("socket already bound ({e}), reopening on {addr}");
            let timeout = self.socket.read_timeout()?;
            let socket = new_socket()?;
            socket.bind(&addr.into())?;
            self.socket = socket.into();
            self.socket.set_read_timeout(timeout)?;
        }
        Ok(())
    }

    fn raw_handle(&self) -> SocketHandle {
        raw_handle(&self.socket)
    }
}

#[cfg(unix)]
fn raw_handle(socket: &UdpSocket) -> SocketHandle {
    use std::os::unix::io::AsRawFd;
    socket.as_raw_fd() as SocketHandle
}

#[cfg(windows)]
fn raw_handle(socket: &UdpSocket) -> SocketHandle {
    use std::os::windows::io::AsRawSocket;
    socket.as_raw_socket() as SocketHandle
}

/// Resolve `host:port` to the first IPv4 address it maps to.
pub fn resolve_address(host: &str, port: u16) -> io::Result<SocketAddrV4> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(SocketAddrV4::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()?
        .find_map(|addr| match addr {
            SocketAddr::V4(addr) => Some(addr),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host} has no IPv4 address"),
            )
        })
}

/// True for the errors a socket read timeout produces on any platform.
pub fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
