//! Relay tunnel session.
//!
//! A [`TunnelSession`] owns the one UDP socket all tunneled game traffic
//! goes through, the resolved relay server address and the two datagram
//! buffers. It is created from a [`TunnelConfig`], brought up with
//! [`TunnelSession::init`] and torn down with [`TunnelSession::shutdown`].
//!
//! ```text
//! Uninitialized ──init──> Disabled            (Enabled=0)
//!               ──init──> Failed              (legacy shim, socket, DNS)
//!               ──init──> [ProbingP2P] ──> Active ──shutdown──> Closed
//! ```

mod forward;
mod probe;

use crate::config::TunnelConfig;
use crate::tunnel_info_bridge::{TunnelInfo, TunnelInfoBridge, TunnelInfoType, TunnelTraffic};
use crate::udp::{resolve_address, SocketHandle, Transport, UdpTransport};
use crate::wire::{InBuffer, OutBuffer};
use log::{error, info, warn};
use serde::Serialize;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Port peers listen on for direct traffic once P2P is confirmed.
pub const P2P_PORT: u16 = 8054;

/// Handle returned to the game for its IPX socket. It is never a valid OS
/// socket, so tunneled calls can be told apart from everything else.
pub const TUNNEL_SOCKET: SocketHandle = u64::MAX - 1;

/// Read timeout of the tunnel socket after init, so a tunneled receive on a
/// quiet tunnel returns "nothing received" instead of blocking the game.
pub const IDLE_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Socket shims that hook the same calls and break the tunnel when loaded.
const LEGACY_SHIMS: [&str; 2] = ["wsock32.dll", "cncnet.dll"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TunnelState {
    Uninitialized,
    Disabled,
    ProbingP2P,
    Active,
    Failed,
    Closed,
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("found {}, remove it to play over the CnCNet tunnel", .0.display())]
    FileConflict(PathBuf),
    #[error("could not resolve relay server {host}:{port}: {source}")]
    AddressResolution {
        host: String,
        port: u16,
        source: io::Error,
    },
    #[error("failed to create tunnel socket: {0}")]
    Socket(#[from] io::Error),
    #[error("tunnel is already active")]
    AlreadyActive,
}

pub struct TunnelSession<T: Transport = UdpTransport> {
    config: TunnelConfig,
    state: TunnelState,
    transport: Option<T>,
    server: Option<SocketAddrV4>,
    dedicated: bool,
    peer_to_peer: bool,
    inbound: InBuffer,
    outbound: OutBuffer,
    traffic: TunnelTraffic,
    info_bridge: TunnelInfoBridge,
}

impl TunnelSession<UdpTransport> {
    /// Bring the tunnel up over a real UDP socket.
    pub fn init(&mut self) -> Result<(), InitError> {
        self.init_with(UdpTransport::open)
    }
}

impl<T: Transport> TunnelSession<T> {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            state: TunnelState::Uninitialized,
            transport: None,
            server: None,
            dedicated: false,
            peer_to_peer: false,
            inbound: InBuffer::new(),
            outbound: OutBuffer::new(),
            traffic: TunnelTraffic::default(),
            info_bridge: TunnelInfoBridge::new(),
        }
    }

    /// Bring the tunnel up, creating the socket with `open`.
    ///
    /// A disabled configuration succeeds without creating anything. When P2P
    /// is requested this blocks for up to five seconds while the relay is
    /// asked to confirm direct connectivity; a probe that gets no answer only
    /// leaves the session in relay-only mode.
    pub fn init_with<F>(&mut self, open: F) -> Result<(), InitError>
    where
        F: FnOnce() -> io::Result<T>,
    {
        if self.state == TunnelState::Active {
            return Err(InitError::AlreadyActive);
        }

        if !self.config.enabled || !self.config.use_udp {
            info!("CnCNet4 tunnel disabled");
            self.set_state(TunnelState::Disabled);
            return Ok(());
        }

        match self.bring_up(open) {
            Ok(()) => {
                self.set_state(TunnelState::Active);
                Ok(())
            }
            Err(e) => {
                error!("CnCNet4 tunnel failed to start: {e}");
                self.transport = None;
                self.server = None;
                self.dedicated = false;
                self.set_state(TunnelState::Failed);
                Err(e)
            }
        }
    }

    fn bring_up<F>(&mut self, open: F) -> Result<(), InitError>
    where
        F: FnOnce() -> io::Result<T>,
    {
        check_legacy_shims(&self.config.work_dir)?;

        self.transport = Some(open()?);

        let host = self.config.host.clone();
        let port = self.config.effective_port();
        if i64::from(port) != self.config.port {
            warn!(
                "relay port {} out of range, using {}",
                self.config.port, port
            );
        }
        let server = resolve_address(&host, port)
            .map_err(|source| InitError::AddressResolution { host: host.clone(), port, source })?;
        info!("relay server {host}:{port} resolved to {server}");
        self.server = Some(server);
        self.dedicated = true;
        self.peer_to_peer = false;

        if self.config.peer_to_peer {
            self.set_state(TunnelState::ProbingP2P);
            if self.probe_p2p() {
                self.listen_p2p();
            } else {
                warn!("P2P probe got no answer from {server}, continuing in relay-only mode");
                self.info_bridge.post_log("P2P probe timed out, relay-only mode");
            }
        }

        self.set_poll_timeout(Some(IDLE_POLL_TIMEOUT))?;
        Ok(())
    }

    fn listen_p2p(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, P2P_PORT);
        match transport.bind(addr) {
            Ok(()) => {
                info!("P2P confirmed, listening on {addr}");
                self.peer_to_peer = true;
            }
            Err(e) => {
                warn!("P2P confirmed but {addr} is unavailable ({e}), relay-only mode");
                self.info_bridge.post_log("P2P listen port unavailable, relay-only mode");
            }
        }
    }

    /// Close the tunnel socket. Does nothing if the tunnel never came up.
    pub fn shutdown(&mut self) {
        if self.transport.take().is_some() {
            info!(
                "CnCNet4 tunnel closed, rx {} dgrams/{} bytes, tx {} dgrams/{} bytes",
                self.traffic.rx_dgrams,
                self.traffic.rx_bytes,
                self.traffic.tx_dgrams,
                self.traffic.tx_bytes
            );
            self.server = None;
            self.dedicated = false;
            self.peer_to_peer = false;
            self.set_state(TunnelState::Closed);
        }
    }

    fn set_state(&mut self, state: TunnelState) {
        self.state = state;
        if self.info_bridge.has_listener() {
            self.info_bridge
                .post_tunnel_info(TunnelInfo::new(TunnelInfoType::TunnelState, Box::new(state)));
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TunnelState::Active && self.transport.is_some()
    }

    pub fn is_dedicated(&self) -> bool {
        self.dedicated
    }

    /// Whether the relay confirmed direct connectivity and the P2P port is open.
    pub fn peer_to_peer(&self) -> bool {
        self.peer_to_peer
    }

    pub fn server_address(&self) -> Option<SocketAddrV4> {
        self.server
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn traffic(&self) -> TunnelTraffic {
        self.traffic
    }

    /// OS handle of the tunnel socket, while the tunnel is up.
    pub fn raw_handle(&self) -> Option<SocketHandle> {
        self.transport.as_ref().map(|transport| transport.raw_handle())
    }

    pub fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// Bound how long a tunneled receive may block.
    ///
    /// Init leaves the socket at [`IDLE_POLL_TIMEOUT`]. `None` blocks until a
    /// datagram arrives.
    pub fn set_poll_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.transport.as_mut() {
            Some(transport) => transport.set_read_timeout(timeout),
            None => Err(not_active()),
        }
    }

    /// Install a listener receiving JSON state, log and traffic reports.
    pub fn set_info_listener(&mut self, listener: impl FnMut(&str) + 'static + Send + Sync) {
        self.info_bridge.set_listener(listener);
    }

    /// Report the current traffic counters to the info listener.
    pub fn post_traffic(&self) {
        if self.info_bridge.has_listener() {
            self.info_bridge.post_tunnel_info(TunnelInfo::new(
                TunnelInfoType::TunnelTraffic,
                Box::new(self.traffic),
            ));
        }
    }
}

fn check_legacy_shims(dir: &Path) -> Result<(), InitError> {
    for name in LEGACY_SHIMS {
        let path = dir.join(name);
        if path.exists() {
            return Err(InitError::FileConflict(path));
        }
    }
    Ok(())
}

pub(crate) fn not_active() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "CnCNet4 tunnel is not active")
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for exercising the session without a network.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// What a [`ScriptedTransport`] did, shared with the test after the
    /// transport has moved into the session.
    #[derive(Default)]
    pub struct Record {
        pub sent: Vec<(Vec<u8>, SocketAddrV4)>,
        pub bound: Vec<SocketAddrV4>,
        pub timeouts: Vec<Option<Duration>>,
    }

    pub type Reply = Box<dyn FnMut(&[(Vec<u8>, SocketAddrV4)]) -> Option<(Vec<u8>, SocketAddrV4)> + Send>;

    pub struct ScriptedTransport {
        pub record: Arc<Mutex<Record>>,
        pub queue: VecDeque<(Vec<u8>, SocketAddrV4)>,
        /// Consulted when the queue is empty; may answer based on what was sent.
        pub reply: Option<Reply>,
        pub timeout: Option<Duration>,
        /// Returned instead of `WouldBlock` when there is nothing to receive.
        pub error: Option<io::ErrorKind>,
    }

    impl ScriptedTransport {
        pub fn new() -> (Self, Arc<Mutex<Record>>) {
            let record = Arc::new(Mutex::new(Record::default()));
            let transport = Self {
                record: record.clone(),
                queue: VecDeque::new(),
                reply: None,
                timeout: None,
                error: None,
            };
            (transport, record)
        }

        pub fn push(&mut self, data: &[u8], from: SocketAddrV4) {
            self.queue.push_back((data.to_vec(), from));
        }
    }

    impl Transport for ScriptedTransport {
        fn send_to(&mut self, buf: &[u8], addr: SocketAddrV4) -> io::Result<usize> {
            self.record.lock().unwrap().sent.push((buf.to_vec(), addr));
            Ok(buf.len())
        }

        fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
            let mut next = self.queue.pop_front();
            if next.is_none() {
                if let Some(reply) = self.reply.as_mut() {
                    let sent = self.record.lock().unwrap().sent.clone();
                    next = reply(&sent);
                }
            }
            match next {
                Some((data, from)) => {
                    let len = data.len().min(buf.len());
                    buf[..len].copy_from_slice(&data[..len]);
                    Ok((len, from))
                }
                None => {
                    if let Some(timeout) = self.timeout {
                        std::thread::sleep(timeout);
                    }
                    Err(self.error.unwrap_or(io::ErrorKind::WouldBlock).into())
                }
            }
        }

        fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
            self.timeout = timeout;
            self.record.lock().unwrap().timeouts.push(timeout);
            Ok(())
        }

        fn bind(&mut self, addr: SocketAddrV4) -> io::Result<()> {
            self.record.lock().unwrap().bound.push(addr);
            Ok(())
        }

        fn raw_handle(&self) -> SocketHandle {
            42
        }
    }

    pub fn relay() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9001)
    }

    pub fn enabled_config() -> TunnelConfig {
        TunnelConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            ..Default::default()
        }
    }

    /// An active relay-only session over a scripted transport.
    pub fn active_session(
        transport: ScriptedTransport,
    ) -> TunnelSession<ScriptedTransport> {
        let mut session = TunnelSession::new(enabled_config());
        session.init_with(move || Ok(transport)).unwrap();
        session
    }
}
