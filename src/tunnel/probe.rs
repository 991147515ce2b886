//! Peer-to-peer capability probe.
//!
//! The relay echoes a `TESTP2P` datagram back when it can reach us directly.
//! We resend the same datagram once a second and give up after five seconds.

use super::TunnelSession;
use crate::udp::{is_timeout, Transport};
use crate::wire::Command;
use chrono::Utc;
use log::{debug, warn};
use std::time::{Duration, Instant};

const PROBE_WINDOW: Duration = Duration::from_secs(5);
const PROBE_INTERVAL: Duration = Duration::from_secs(1);

impl<T: Transport> TunnelSession<T> {
    /// Returns true once the relay echoed our probe.
    pub(super) fn probe_p2p(&mut self) -> bool {
        let (Some(server), Some(transport)) = (self.server, self.transport.as_mut()) else {
            return false;
        };

        let stamp = Utc::now().timestamp() as i32;
        self.outbound.discard();
        self.outbound.write_i8(Command::TestP2P as i8);
        self.outbound.write_i32(stamp);

        if let Err(e) = transport.set_read_timeout(Some(PROBE_INTERVAL)) {
            warn!("failed to set probe read timeout: {e}");
        }

        debug!("probing P2P connectivity through {server}");
        let started = Instant::now();
        let mut last_sent: Option<Instant> = None;
        let mut passed = false;

        while started.elapsed() < PROBE_WINDOW {
            if last_sent.map_or(true, |sent| sent.elapsed() >= PROBE_INTERVAL) {
                // The datagram stays buffered so every retry resends it as-is.
                match transport.send_to(self.outbound.as_slice(), server) {
                    Ok(len) => self.traffic.record_tx(len),
                    Err(e) => debug!("probe send to {server} failed: {e}"),
                }
                last_sent = Some(Instant::now());
            }

            match transport.recv_from(self.inbound.prepare()) {
                Ok((len, from)) => {
                    self.inbound.set_filled(len);
                    self.traffic.record_rx(len);
                    if self.inbound.read_i8() == Command::TestP2P as i8
                        && self.inbound.read_i32() == stamp
                    {
                        debug!("probe echoed by {from} after {:?}", started.elapsed());
                        passed = true;
                        break;
                    }
                    debug!("ignoring {len} byte datagram from {from} while probing");
                }
                Err(e) if is_timeout(&e) => {}
                Err(e) => {
                    debug!("probe receive failed: {e}");
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        self.outbound.discard();
        passed
    }
}
