//! Lightweight bridge for reporting tunnel state/log/traffic to an optional listener.
//!
//! A launcher embedding the tunnel can install a listener to be told when the
//! session changes state, when it silently degrades (P2P probe timeout, stray
//! datagrams) and how much traffic went through it. Payloads are JSON.

use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Serialize, Default, Clone, Copy, Debug, PartialEq, Eq)]
/// Datagram and byte counters for the tunnel socket.
pub struct TunnelTraffic {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub tx_dgrams: u64,
    pub rx_dgrams: u64,
}

impl TunnelTraffic {
    pub(crate) fn record_rx(&mut self, len: usize) {
        self.rx_dgrams += 1;
        self.rx_bytes += len as u64;
    }

    pub(crate) fn record_tx(&mut self, len: usize) {
        self.tx_dgrams += 1;
        self.tx_bytes += len as u64;
    }
}

#[derive(Serialize)]
/// Discriminator for the type of info carried in TunnelInfo.
pub(crate) enum TunnelInfoType {
    TunnelState,
    TunnelLog,
    TunnelTraffic,
}

#[derive(Serialize)]
/// A serializable wrapper carrying a typed info payload for reporting.
pub(crate) struct TunnelInfo<T>
where
    T: ?Sized + Serialize,
{
    pub info_type: TunnelInfoType,
    pub data: Box<T>,
}

impl<T> TunnelInfo<T>
where
    T: ?Sized + Serialize,
{
    pub(crate) fn new(info_type: TunnelInfoType, data: Box<T>) -> Self {
        Self { info_type, data }
    }
}

/// Posts serialized tunnel info to a user-provided listener, if installed.
#[derive(Default)]
pub(crate) struct TunnelInfoBridge {
    listener: Option<Arc<Mutex<dyn FnMut(&str) + 'static + Send + Sync>>>,
}

impl TunnelInfoBridge {
    pub(crate) fn new() -> Self {
        TunnelInfoBridge { listener: None }
    }

    /// Install a listener that will receive JSON-serialized TunnelInfo payloads.
    pub(crate) fn set_listener(&mut self, listener: impl FnMut(&str) + 'static + Send + Sync) {
        self.listener = Some(Arc::new(Mutex::new(listener)));
    }

    pub(crate) fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    /// Serialize and post a TunnelInfo to the installed listener (if any).
    pub(crate) fn post_tunnel_info<T>(&self, data: TunnelInfo<T>)
    where
        T: ?Sized + Serialize,
    {
        if let Some(ref listener) = self.listener {
            if let Ok(json) = serde_json::to_string(&data) {
                if let Ok(mut listener) = listener.lock() {
                    listener(json.as_str());
                }
            }
        }
    }

    pub(crate) fn post_log(&self, message: &str) {
        if self.has_listener() {
            self.post_tunnel_info(TunnelInfo::new(
                TunnelInfoType::TunnelLog,
                Box::new(message),
            ));
        }
    }
}
