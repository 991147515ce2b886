use anyhow::{Context, Result};
use clap::Parser;
use cncnet4::wire::BUFFER_SIZE;
use cncnet4::{TunnelConfig, TunnelSession};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const TRAFFIC_REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Bring up a CnCNet4 relay tunnel, report what the relay confirmed and
/// service the tunnel socket until stopped.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON file with a "CnCNet4" section; without it the tunnel is enabled
    /// with default settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay server host
    #[arg(long)]
    host: Option<String>,

    /// Relay server port, 1024-65534
    #[arg(short, long)]
    port: Option<i64>,

    /// Probe the relay for direct peer-to-peer connectivity
    #[arg(long)]
    p2p: bool,

    /// Run with the tunnel disabled
    #[arg(long)]
    disabled: bool,

    /// Seconds to service the tunnel, 0 runs until Ctrl-C
    #[arg(short, long, default_value_t = 0)]
    duration: u64,

    /// Log level used when RUST_LOG is not set
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level);

    let config = build_config(&args)?;
    let duration = (args.duration > 0).then(|| Duration::from_secs(args.duration));

    let stop = Arc::new(AtomicBool::new(false));
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            ctrl_c_stop.store(true, Ordering::Relaxed);
        }
    });

    tokio::task::spawn_blocking(move || run_session(config, duration, stop))
        .await
        .context("tunnel worker panicked")?
}

fn init_logger(level: &str) {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) => builder.parse_filters(level),
    };
    builder.init();
}

fn build_config(args: &Args) -> Result<TunnelConfig> {
    let mut config = match &args.config {
        Some(path) => TunnelConfig::load(path)?,
        None => TunnelConfig {
            enabled: true,
            ..Default::default()
        },
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.p2p {
        config.peer_to_peer = true;
    }
    if args.disabled {
        config.enabled = false;
    }
    Ok(config)
}

fn run_session(config: TunnelConfig, duration: Option<Duration>, stop: Arc<AtomicBool>) -> Result<()> {
    let mut session = TunnelSession::new(config);
    session.set_info_listener(|json| debug!("tunnel info: {json}"));
    session.init().context("failed to start CnCNet4 tunnel")?;

    let Some(server) = session.server_address() else {
        info!("tunnel is disabled, nothing to do");
        return Ok(());
    };
    info!(
        "tunnel active through relay {server}, peer-to-peer {}",
        if session.peer_to_peer() { "confirmed" } else { "off" }
    );

    session.set_poll_timeout(Some(POLL_INTERVAL))?;
    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut buf = [0u8; BUFFER_SIZE];

    while !stop.load(Ordering::Relaxed) && duration.map_or(true, |d| started.elapsed() < d) {
        match session.recv_from(&mut buf) {
            Ok((len, Some(from))) => {
                let peer = from.to_peer();
                info!(
                    "{len} bytes from {}{}",
                    peer.socket_addr(),
                    if peer.p2p { " (p2p)" } else { "" }
                );
            }
            Ok(_) => {}
            Err(e) => warn!("tunnel receive failed: {e}"),
        }

        if last_report.elapsed() >= TRAFFIC_REPORT_INTERVAL {
            session.post_traffic();
            last_report = Instant::now();
        }
    }

    session.close_socket();
    session.post_traffic();
    session.shutdown();
    Ok(())
}
