//! Ad-hoc discovery daemon for Linux: runs one protocol node over UDP broadcast.
//!
//! ```bash
//! # server and client on the same host, logging peer changes
//! adhoc-linux --role server --broadcast 127.255.255.255
//! adhoc-linux --role client --broadcast 127.255.255.255 --greeting-interval 2000
//!
//! # mint a fresh operational group id for a deployment
//! adhoc-linux --new-group-id
//! ```

mod config;
mod link;
mod transport;

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use adhoc_core::liveness::IntervalTimer;
use adhoc_core::{GroupId, MacAddr, ProtocolCore, Role, Transport};
use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::transport::UdpTransport;

#[derive(Parser, Debug)]
#[command(name = "adhoc-linux")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node role
    #[arg(short, long, value_enum)]
    role: Option<RoleArg>,

    /// Radio channel
    #[arg(long)]
    channel: Option<u8>,

    /// UDP port shared by all nodes
    #[arg(short, long)]
    port: Option<u16>,

    /// Broadcast address frames are sent to
    #[arg(long)]
    broadcast: Option<Ipv4Addr>,

    /// Emulated MAC address (random if unset)
    #[arg(long)]
    mac: Option<MacAddr>,

    /// Enable security mode (requires both keys)
    #[arg(long)]
    secure: bool,

    /// Network key, at most 16 bytes
    #[arg(long)]
    network_key: Option<String>,

    /// Link key, at most 16 bytes
    #[arg(long)]
    link_key: Option<String>,

    /// Send a greeting to the opposite role every N ms
    #[arg(long)]
    greeting_interval: Option<u64>,

    /// Clients ignore traffic from other clients
    #[arg(long)]
    role_filter: bool,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print a random group id and exit
    #[arg(long)]
    new_group_id: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Server,
    Client,
}

impl From<RoleArg> for Role {
    fn from(r: RoleArg) -> Self {
        match r {
            RoleArg::Server => Role::Server,
            RoleArg::Client => Role::Client,
        }
    }
}

impl Cli {
    /// Flags win over file and environment.
    fn apply(&self, c: &mut Config) {
        if let Some(r) = self.role {
            c.node.role = r.into();
        }
        if let Some(ch) = self.channel {
            c.node.channel = ch;
        }
        if let Some(p) = self.port {
            c.port = p;
        }
        if let Some(b) = self.broadcast {
            c.broadcast_addr = b;
        }
        if let Some(m) = self.mac {
            c.mac = Some(m);
        }
        if self.secure {
            c.node.secure = true;
        }
        if let Some(k) = &self.network_key {
            c.node.network_key = Some(k.clone());
        }
        if let Some(k) = &self.link_key {
            c.node.link_key = Some(k.clone());
        }
        if let Some(ms) = self.greeting_interval {
            c.greeting_interval_ms = Some(ms);
        }
        if self.role_filter {
            c.node.role_filter = true;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.new_group_id {
        println!("{}", GroupId::random());
        return Ok(());
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut cfg = config::load(cli.config.as_deref()).context("loading config")?;
    cli.apply(&mut cfg);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let mac = cfg.mac.unwrap_or_else(transport::random_mac);
    let transport = UdpTransport::new(cfg.port, cfg.broadcast_addr, mac, cfg.node.channel);
    let mut core = ProtocolCore::new(cfg.node.clone(), transport);

    core.add_peer_handler(|e| {
        if e.connected {
            info!(mac = %e.mac, role = %e.role, "peer connected");
        } else {
            info!(mac = %e.mac, role = %e.role, "peer disconnected");
        }
    });
    core.add_data_handler(|src, msg, broadcast| {
        info!(%src, broadcast, command = ?msg.command, text = %msg.payload_text(), "data received");
    });

    core.begin().context("starting node")?;
    let sink = core.frame_sink();
    core.transport_mut().spawn_receiver(sink)?;
    info!(port = cfg.port, broadcast = %cfg.broadcast_addr, "listening");

    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(cfg.tick_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut status = IntervalTimer::new(cfg.status_interval_ms);
    let mut greeting = cfg.greeting_interval_ms.map(IntervalTimer::new);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = started.elapsed().as_millis() as u64;
                core.tick(now);
                if status.poll(now) {
                    info!("{}", core.status(now));
                }
                if let Some(timer) = greeting.as_mut() {
                    if timer.poll(now) {
                        greet(&mut core)?;
                    }
                }
            }
            res = &mut shutdown => {
                res?;
                info!("shutting down");
                break;
            }
        }
    }
    core.shutdown()?;
    Ok(())
}

/// DATA to every peer of the opposite role.
fn greet(core: &mut ProtocolCore<UdpTransport>) -> anyhow::Result<()> {
    let role = core.config().role;
    let text = format!("Hello from {} {}", role, core.transport().local_mac());
    let all_ok = match role {
        Role::Server => core.send_to_clients(text.as_bytes())?,
        Role::Client => core.send_to_servers(text.as_bytes())?,
    };
    if all_ok {
        debug!("greeting sent");
    } else {
        warn!("greeting not delivered to every peer");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
