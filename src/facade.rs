//! Socket-call facade.
//!
//! The game's socket imports are redirected to a [`SocketFacade`], which
//! decides per call whether it concerns the tunneled IPX socket or should go
//! to the real socket API untouched. How the calls get redirected (import
//! patching, a wrapper DLL, ...) is up to the platform adapter implementing
//! [`SocketApi`] for the real OS functions.

use crate::addr::{IpxAddress, PeerAddress, SockAddr, AF_IPX};
use crate::tunnel::{TunnelSession, TUNNEL_SOCKET};
use crate::udp::{resolve_address, SocketHandle, Transport, UdpTransport};
use log::debug;
use std::io;
use std::net::Ipv4Addr;

/// Option levels the game uses for IPX-specific queries. Answered locally.
pub const IPX_OPTION_LEVELS: [i32; 2] = [999, 1000];

/// The socket calls the game makes, in the shape of the platform API.
pub trait SocketApi {
    fn socket(&mut self, family: i32, ty: i32, protocol: i32) -> io::Result<SocketHandle>;

    fn bind(&mut self, s: SocketHandle, addr: &SockAddr) -> io::Result<()>;

    fn send_to(
        &mut self,
        s: SocketHandle,
        buf: &[u8],
        flags: i32,
        to: &SockAddr,
    ) -> io::Result<usize>;

    /// `Ok((0, _))` means no datagram was delivered by this call.
    fn recv_from(
        &mut self,
        s: SocketHandle,
        buf: &mut [u8],
        flags: i32,
    ) -> io::Result<(usize, Option<SockAddr>)>;

    fn getsockopt(&mut self, s: SocketHandle, level: i32, optname: i32) -> io::Result<i32>;

    fn setsockopt(&mut self, s: SocketHandle, level: i32, optname: i32, value: i32)
        -> io::Result<()>;

    fn closesocket(&mut self, s: SocketHandle) -> io::Result<()>;

    /// Fill in the local address of `s`. Fields not known to the callee are
    /// left as they are.
    fn getsockname(&mut self, s: SocketHandle, name: &mut SockAddr) -> io::Result<()>;
}

/// Resolves the local host name to its first IPv4 address.
pub trait HostResolver {
    fn host_ipv4(&mut self) -> io::Result<Ipv4Addr>;
}

/// Looks up the machine's own host name through the system resolver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHostResolver;

impl HostResolver for SystemHostResolver {
    fn host_ipv4(&mut self) -> io::Result<Ipv4Addr> {
        let name = gethostname::gethostname();
        let name = name.to_str().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "host name is not valid UTF-8")
        })?;
        resolve_address(name, 0).map(|addr| *addr.ip())
    }
}

/// Dispatches socket calls between the tunnel session and the OS.
pub struct SocketFacade<N, T: Transport = UdpTransport, R = SystemHostResolver> {
    session: TunnelSession<T>,
    native: N,
    resolver: R,
}

impl<N, T> SocketFacade<N, T>
where
    N: SocketApi,
    T: Transport,
{
    pub fn new(session: TunnelSession<T>, native: N) -> Self {
        Self::with_resolver(session, native, SystemHostResolver)
    }
}

impl<N, T, R> SocketFacade<N, T, R>
where
    N: SocketApi,
    T: Transport,
    R: HostResolver,
{
    pub fn with_resolver(session: TunnelSession<T>, native: N, resolver: R) -> Self {
        Self {
            session,
            native,
            resolver,
        }
    }

    pub fn session(&self) -> &TunnelSession<T> {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut TunnelSession<T> {
        &mut self.session
    }

    pub fn native_mut(&mut self) -> &mut N {
        &mut self.native
    }

    fn is_tunneled(&self, s: SocketHandle) -> bool {
        s == TUNNEL_SOCKET && self.session.is_active()
    }
}

impl<N, T, R> SocketApi for SocketFacade<N, T, R>
where
    N: SocketApi,
    T: Transport,
    R: HostResolver,
{
    fn socket(&mut self, family: i32, ty: i32, protocol: i32) -> io::Result<SocketHandle> {
        if family == AF_IPX && self.session.is_active() {
            debug!("handing out tunnel socket for IPX");
            return Ok(TUNNEL_SOCKET);
        }
        self.native.socket(family, ty, protocol)
    }

    fn bind(&mut self, s: SocketHandle, addr: &SockAddr) -> io::Result<()> {
        if self.is_tunneled(s) {
            // The tunnel socket was bound during init.
            return Ok(());
        }
        self.native.bind(s, addr)
    }

    fn send_to(
        &mut self,
        s: SocketHandle,
        buf: &[u8],
        flags: i32,
        to: &SockAddr,
    ) -> io::Result<usize> {
        match to {
            SockAddr::Ipx(ipx) if self.is_tunneled(s) && ipx.family == AF_IPX => {
                self.session.send_to(buf, ipx)
            }
            _ => self.native.send_to(s, buf, flags, to),
        }
    }

    fn recv_from(
        &mut self,
        s: SocketHandle,
        buf: &mut [u8],
        flags: i32,
    ) -> io::Result<(usize, Option<SockAddr>)> {
        if self.is_tunneled(s) {
            let (len, from) = self.session.recv_from(buf)?;
            return Ok((len, from.map(SockAddr::Ipx)));
        }
        self.native.recv_from(s, buf, flags)
    }

    fn getsockopt(&mut self, s: SocketHandle, level: i32, optname: i32) -> io::Result<i32> {
        if self.session.is_active() && IPX_OPTION_LEVELS.contains(&level) {
            return Ok(1);
        }
        self.native.getsockopt(s, level, optname)
    }

    fn setsockopt(
        &mut self,
        s: SocketHandle,
        level: i32,
        optname: i32,
        value: i32,
    ) -> io::Result<()> {
        if self.session.is_active() && IPX_OPTION_LEVELS.contains(&level) {
            return Ok(());
        }
        self.native.setsockopt(s, level, optname, value)
    }

    fn closesocket(&mut self, s: SocketHandle) -> io::Result<()> {
        if self.is_tunneled(s) {
            self.session.close_socket();
            return Ok(());
        }
        self.native.closesocket(s)
    }

    fn getsockname(&mut self, s: SocketHandle, name: &mut SockAddr) -> io::Result<()> {
        if !self.is_tunneled(s) {
            return self.native.getsockname(s, name);
        }

        match self.resolver.host_ipv4() {
            Ok(ip) => {
                *name = SockAddr::Ipx(IpxAddress::from(PeerAddress::new(ip, 0, false)));
            }
            Err(e) => debug!("local host lookup failed: {e}"),
        }
        // The OS fills in whatever it knows about the real tunnel socket.
        let raw = self.session.raw_handle().unwrap_or(s);
        self.native.getsockname(raw, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::AF_INET;
    use crate::tunnel::testing::{active_session, enabled_config, relay, Record, ScriptedTransport};
    use crate::config::TunnelConfig;
    use std::net::SocketAddrV4;
    use std::sync::{Arc, Mutex};

    /// Stand-in for the OS socket API that records what reached it.
    #[derive(Default)]
    struct NativeLog {
        calls: Vec<String>,
    }

    /// Resolver answering with a fixed address, or failing without one.
    struct FixedHost(Option<Ipv4Addr>);

    impl SocketApi for NativeLog {
        fn socket(&mut self, family: i32, _ty: i32, _protocol: i32) -> io::Result<SocketHandle> {
            self.calls.push(format!("socket {family}"));
            Ok(7)
        }

        fn bind(&mut self, s: SocketHandle, _addr: &SockAddr) -> io::Result<()> {
            self.calls.push(format!("bind {s}"));
            Ok(())
        }

        fn send_to(
            &mut self,
            s: SocketHandle,
            buf: &[u8],
            _flags: i32,
            _to: &SockAddr,
        ) -> io::Result<usize> {
            self.calls.push(format!("send_to {s}"));
            Ok(buf.len())
        }

        fn recv_from(
            &mut self,
            s: SocketHandle,
            _buf: &mut [u8],
            _flags: i32,
        ) -> io::Result<(usize, Option<SockAddr>)> {
            self.calls.push(format!("recv_from {s}"));
            Ok((0, None))
        }

        fn getsockopt(&mut self, s: SocketHandle, level: i32, _optname: i32) -> io::Result<i32> {
            self.calls.push(format!("getsockopt {s} {level}"));
            Ok(0)
        }

        fn setsockopt(
            &mut self,
            s: SocketHandle,
            level: i32,
            _optname: i32,
            _value: i32,
        ) -> io::Result<()> {
            self.calls.push(format!("setsockopt {s} {level}"));
            Ok(())
        }

        fn closesocket(&mut self, s: SocketHandle) -> io::Result<()> {
            self.calls.push(format!("closesocket {s}"));
            Ok(())
        }

        fn getsockname(&mut self, s: SocketHandle, name: &mut SockAddr) -> io::Result<()> {
            self.calls.push(format!("getsockname {s}"));
            if let SockAddr::Ipx(ipx) = name {
                ipx.socket = 0x4B00;
            }
            Ok(())
        }
    }

    impl HostResolver for FixedHost {
        fn host_ipv4(&mut self) -> io::Result<Ipv4Addr> {
            self.0
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no host"))
        }
    }

    type TestFacade = SocketFacade<NativeLog, ScriptedTransport, FixedHost>;

    fn facade() -> (TestFacade, Arc<Mutex<Record>>) {
        let (transport, record) = ScriptedTransport::new();
        let facade = SocketFacade::with_resolver(
            active_session(transport),
            NativeLog::default(),
            FixedHost(Some(Ipv4Addr::new(192, 168, 0, 10))),
        );
        (facade, record)
    }

    fn inet() -> SockAddr {
        SockAddr::Inet(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 53))
    }

    #[test]
    fn ipx_socket_is_the_tunnel() {
        let (mut facade, _) = facade();
        assert_eq!(facade.socket(AF_IPX, 2, 1000).unwrap(), TUNNEL_SOCKET);
        assert_eq!(facade.socket(AF_INET, 2, 17).unwrap(), 7);
        assert_eq!(facade.native_mut().calls, vec!["socket 2"]);
    }

    #[test]
    fn disabled_tunnel_passes_everything_through() {
        let mut session: TunnelSession<ScriptedTransport> =
            TunnelSession::new(TunnelConfig::default());
        session
            .init_with(|| panic!("no socket should be opened"))
            .unwrap();
        let mut facade = SocketFacade::new(session, NativeLog::default());

        assert_eq!(facade.socket(AF_IPX, 2, 1000).unwrap(), 7);
        facade.getsockopt(TUNNEL_SOCKET, 1000, 1).unwrap();
        facade.closesocket(TUNNEL_SOCKET).unwrap();
        assert_eq!(
            facade.native_mut().calls,
            vec![
                "socket 6".to_string(),
                format!("getsockopt {TUNNEL_SOCKET} 1000"),
                format!("closesocket {TUNNEL_SOCKET}"),
            ]
        );
    }

    #[test]
    fn tunnel_bind_is_a_no_op() {
        let (mut facade, _) = facade();
        facade
            .bind(TUNNEL_SOCKET, &SockAddr::Ipx(IpxAddress::default()))
            .unwrap();
        facade.bind(3, &inet()).unwrap();
        assert_eq!(facade.native_mut().calls, vec!["bind 3"]);
    }

    #[test]
    fn ipx_options_are_answered_locally() {
        let (mut facade, _) = facade();
        assert_eq!(facade.getsockopt(TUNNEL_SOCKET, 1000, 0x4000).unwrap(), 1);
        assert_eq!(facade.getsockopt(TUNNEL_SOCKET, 999, 0x4000).unwrap(), 1);
        facade.setsockopt(TUNNEL_SOCKET, 1000, 0x4000, 5).unwrap();
        assert_eq!(facade.getsockopt(3, 0xFFFF, 4).unwrap(), 0);
        facade.setsockopt(3, 0xFFFF, 4, 1).unwrap();
        assert_eq!(
            facade.native_mut().calls,
            vec!["getsockopt 3 65535", "setsockopt 3 65535"]
        );
    }

    #[test]
    fn tunneled_send_reaches_the_relay() {
        let (mut facade, record) = facade();
        let sent = facade
            .send_to(TUNNEL_SOCKET, b"hi", 0, &SockAddr::Ipx(IpxAddress::BROADCAST))
            .unwrap();
        assert_eq!(sent, 2);
        assert_eq!(record.lock().unwrap().sent[0].1, relay());
        assert!(facade.native_mut().calls.is_empty());
    }

    #[test]
    fn non_ipx_destination_passes_through() {
        let (mut facade, record) = facade();
        facade.send_to(TUNNEL_SOCKET, b"hi", 0, &inet()).unwrap();
        facade.send_to(3, b"hi", 0, &SockAddr::Ipx(IpxAddress::BROADCAST)).unwrap();
        assert!(record.lock().unwrap().sent.is_empty());
        assert_eq!(
            facade.native_mut().calls,
            vec![format!("send_to {TUNNEL_SOCKET}"), "send_to 3".to_string()]
        );
    }

    #[test]
    fn tunneled_receive_yields_ipx_sender() {
        let (mut transport, _) = ScriptedTransport::new();
        let mut datagram = vec![0u8, 10, 0, 0, 7];
        datagram.extend_from_slice(&5000u16.to_be_bytes());
        datagram.extend_from_slice(b"data");
        transport.push(&datagram, relay());
        let mut facade = SocketFacade::new(active_session(transport), NativeLog::default());

        let mut buf = [0u8; 16];
        let (len, from) = facade.recv_from(TUNNEL_SOCKET, &mut buf, 0).unwrap();
        assert_eq!(&buf[..len], b"data");
        let Some(SockAddr::Ipx(from)) = from else {
            panic!("expected an IPX sender, got {from:?}");
        };
        assert_eq!(from.to_peer().socket_addr(), "10.0.0.7:5000".parse::<SocketAddrV4>().unwrap());

        facade.recv_from(3, &mut buf, 0).unwrap();
        assert_eq!(facade.native_mut().calls, vec!["recv_from 3"]);
    }

    #[test]
    fn closing_the_tunnel_socket_only_notifies_the_relay() {
        let (mut facade, record) = facade();
        facade.closesocket(TUNNEL_SOCKET).unwrap();
        assert_eq!(record.lock().unwrap().sent, vec![(vec![2u8], relay())]);
        assert!(facade.session().is_active());
        assert!(facade.native_mut().calls.is_empty());
    }

    #[test]
    fn getsockname_synthesizes_then_asks_the_os() {
        let (mut facade, _) = facade();
        let mut name = SockAddr::Inet(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        facade.getsockname(TUNNEL_SOCKET, &mut name).unwrap();

        let SockAddr::Ipx(ipx) = name else {
            panic!("expected an IPX name, got {name:?}");
        };
        assert_eq!(ipx.family, AF_IPX);
        assert_eq!(&ipx.nodenum[..4], &[192, 168, 0, 10]);
        // Filled in by the OS call that follows.
        assert_eq!(ipx.socket, 0x4B00);
        assert_eq!(facade.native_mut().calls, vec!["getsockname 42"]);
    }

    #[test]
    fn getsockname_survives_host_lookup_failure() {
        let (transport, _) = ScriptedTransport::new();
        let mut facade = SocketFacade::with_resolver(
            active_session(transport),
            NativeLog::default(),
            FixedHost(None),
        );
        let mut name = SockAddr::Ipx(IpxAddress::default());
        facade.getsockname(TUNNEL_SOCKET, &mut name).unwrap();
        assert_eq!(facade.native_mut().calls, vec!["getsockname 42"]);
    }

    #[test]
    fn facade_exposes_session_state() {
        let (mut facade, _) = facade();
        assert_eq!(facade.session().config(), &enabled_config());
        facade.session_mut().shutdown();
        assert_eq!(facade.socket(AF_IPX, 2, 1000).unwrap(), 7);
    }

    #[test]
    fn system_resolver_reports_a_usable_host_address() {
        assert!(!gethostname::gethostname().is_empty());
        // Hosts without a resolvable name are tolerated by getsockname.
        if let Ok(ip) = SystemHostResolver.host_ipv4() {
            assert!(!ip.is_unspecified());
        }
    }

    #[test]
    fn default_facade_names_the_tunnel_after_this_host() {
        let (transport, _) = ScriptedTransport::new();
        let mut facade = SocketFacade::new(active_session(transport), NativeLog::default());
        let mut name = SockAddr::Ipx(IpxAddress::default());
        facade.getsockname(TUNNEL_SOCKET, &mut name).unwrap();

        let SockAddr::Ipx(ipx) = name else {
            panic!("expected an IPX name, got {name:?}");
        };
        if let Ok(ip) = SystemHostResolver.host_ipv4() {
            assert_eq!(ipx.family, AF_IPX);
            assert_eq!(&ipx.nodenum[..4], &ip.octets());
        }
        assert_eq!(facade.native_mut().calls, vec!["getsockname 42"]);
    }
}
