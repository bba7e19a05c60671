use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod broadcast;
mod caster;
mod config;
mod relay;
mod stats;

use crate::broadcast::SubscriberRegistry;
use crate::caster::{LOCAL_SOURCE_RESPONSE, ListenerOptions};
use crate::config::FileConfig;
use crate::relay::{DRAIN_GRACE, Egress, Ingress, Relay};
use crate::stats::RelayStats;
use mav_tunnel::{SerialTunnel, TunnelEndpoint};
use relay_io::{Endpoint, SerialEndpoint, TcpEndpoint};

#[derive(Parser)]
#[command(name = "rtk-relay")]
#[command(about = "Relay RTCM3 corrections from an NTRIP caster to GNSS receivers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ./config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Print the effective configuration and exit
    #[arg(long, global = true)]
    print_config: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay caster corrections to a directly attached serial receiver
    Forward(ForwardArgs),

    /// Re-serve caster corrections to local NTRIP clients
    Proxy(ProxyArgs),

    /// Bridge a receiver behind a MAVLink serial tunnel to a local TCP port
    Bridge(BridgeArgs),
}

#[derive(Parser)]
struct ForwardArgs {
    /// Caster host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Caster mountpoint (overrides config)
    #[arg(long)]
    mountpoint: Option<String>,

    /// Serial port of the receiver, e.g. /dev/ttyUSB0 (overrides config)
    #[arg(long)]
    serial_port: Option<String>,

    /// Receiver baud rate (overrides config)
    #[arg(long)]
    baud: Option<u32>,
}

#[derive(Parser)]
struct ProxyArgs {
    /// Caster host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Caster mountpoint (overrides config)
    #[arg(long)]
    mountpoint: Option<String>,

    /// Local listen port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Parser)]
struct BridgeArgs {
    /// Telemetry link: serial path or tcp:host:port (overrides config)
    #[arg(long)]
    link: Option<String>,

    /// Local listen port for the bridged receiver (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Also pull corrections from the configured caster into the tunnel
    #[arg(long)]
    with_caster: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "rtk_relay=debug,mav_tunnel=debug,ntrip_client=debug,relay_io=debug,info"
    } else {
        "rtk_relay=info,mav_tunnel=info,ntrip_client=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let cfg: FileConfig = config::load_config(&config_path)
        .extract()
        .context("invalid configuration")?;

    if cli.print_config {
        print!("{}", toml::to_string_pretty(&cfg)?);
        return Ok(());
    }

    // Stop on Ctrl-C; every loop watches this channel.
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = stop_tx.send(true);
        }
    });

    let result = match cli.command {
        Commands::Forward(args) => run_forward(cfg, args, stop_rx).await,
        Commands::Proxy(args) => run_proxy(cfg, args, stop_rx).await,
        Commands::Bridge(args) => run_bridge(cfg, args, stop_rx).await,
    };

    tokio::time::sleep(DRAIN_GRACE).await;
    result
}

/// NTRIP caster -> serial receiver.
async fn run_forward(mut cfg: FileConfig, args: ForwardArgs, stop: watch::Receiver<bool>) -> Result<()> {
    if let Some(host) = args.host {
        cfg.caster.host = host;
    }
    if let Some(mountpoint) = args.mountpoint {
        cfg.caster.mountpoint = mountpoint;
    }
    if let Some(port) = args.serial_port {
        cfg.serial.port = Some(port);
    }
    if let Some(baud) = args.baud {
        cfg.serial.baud = baud;
    }
    require_caster(&cfg)?;
    let serial_port = cfg
        .serial
        .port
        .clone()
        .context("no serial port configured ([serial] port or --serial-port)")?;

    let receiver = SerialEndpoint::open(&serial_port, cfg.serial.baud)
        .with_context(|| format!("failed to open receiver port {}", serial_port))?;

    let stats = Arc::new(RelayStats::new());
    let relay = Relay::new(Arc::clone(&stats));
    spawn_stats_logger(Arc::clone(&stats), stop.clone());

    relay
        .run(
            Ingress::Ntrip(cfg.caster_config()),
            Egress::Direct(Box::new(receiver)),
            cfg.decoder(),
            stop,
        )
        .await
        .context("forward relay failed")
}

/// NTRIP caster -> local caster re-serving many clients.
async fn run_proxy(mut cfg: FileConfig, args: ProxyArgs, stop: watch::Receiver<bool>) -> Result<()> {
    if let Some(host) = args.host {
        cfg.caster.host = host;
    }
    if let Some(mountpoint) = args.mountpoint {
        cfg.caster.mountpoint = mountpoint;
    }
    if let Some(port) = args.port {
        cfg.local.port = port;
    }
    require_caster(&cfg)?;

    let stats = Arc::new(RelayStats::new());
    let relay = Relay::new(Arc::clone(&stats));
    spawn_stats_logger(Arc::clone(&stats), stop.clone());

    // Connect upstream first so late joiners can be replayed the
    // leading payload.
    let (upstream, leading) = relay.connect(Ingress::Ntrip(cfg.caster_config())).await?;

    let listen_addr = format!("{}:{}", cfg.local.host, cfg.local.port);
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;
    info!("serving corrections on {}", listen_addr);

    let registry = Arc::new(SubscriberRegistry::new(cfg.local.single_slot));
    tokio::spawn(caster::run_listener(
        listener,
        Arc::clone(&registry),
        ListenerOptions {
            greeting: Some(LOCAL_SOURCE_RESPONSE.to_vec()),
            replay: leading.clone(),
            upstream: None,
        },
        stop.clone(),
    ));

    relay
        .stream(upstream, leading, Egress::Registry(registry), cfg.decoder(), stop)
        .await
        .context("proxy relay failed")
}

/// MAVLink tunnel <-> local TCP port (and optionally caster -> tunnel).
async fn run_bridge(mut cfg: FileConfig, args: BridgeArgs, stop: watch::Receiver<bool>) -> Result<()> {
    if let Some(link) = args.link {
        cfg.tunnel.link = Some(link);
    }
    if let Some(port) = args.port {
        cfg.local.port = port;
    }
    let link_spec = cfg
        .tunnel
        .link
        .clone()
        .context("no tunnel link configured ([tunnel] link or --link)")?;

    let link = open_link(&link_spec, cfg.tunnel.link_baud).await?;
    let (tunnel, inbound) = SerialTunnel::spawn(link, cfg.tunnel_config());

    // Receiver bytes out of the tunnel go to the newest TCP client;
    // bytes the client sends come back as corrections for the tunnel.
    let listen_addr = format!("{}:{}", cfg.local.host, cfg.local.port);
    let listener = TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", listen_addr))?;
    info!("bridging tunnel device {} on {}", cfg.tunnel.device, listen_addr);

    let registry = Arc::new(SubscriberRegistry::new(true));
    tokio::spawn(caster::run_listener(
        listener,
        Arc::clone(&registry),
        ListenerOptions {
            greeting: None,
            replay: Vec::new(),
            upstream: Some(tunnel.sender()),
        },
        stop.clone(),
    ));

    // Optional second ingress: caster corrections straight down the tunnel.
    if args.with_caster {
        require_caster(&cfg)?;
        let caster_cfg = cfg.caster_config();
        let decoder = cfg.decoder();
        let corrections = Relay::new(Arc::new(RelayStats::new()));
        let tunnel_tx = tunnel.sender();
        let stop_corrections = stop.clone();
        tokio::spawn(async move {
            if let Err(e) = corrections
                .run(
                    Ingress::Ntrip(caster_cfg),
                    Egress::Tunnel(tunnel_tx),
                    decoder,
                    stop_corrections,
                )
                .await
            {
                warn!(error = %e, "corrections relay ended");
            }
        });
    }

    let stats = Arc::new(RelayStats::new());
    let relay = Relay::new(Arc::clone(&stats));
    spawn_stats_logger(Arc::clone(&stats), stop.clone());

    let ingress = TunnelEndpoint::new(&tunnel, inbound);
    let result = relay
        .run(
            Ingress::Attached(Box::new(ingress), Vec::new()),
            Egress::Registry(registry),
            cfg.decoder(),
            stop,
        )
        .await;

    if let Err(e) = tunnel.shutdown().await {
        warn!(error = %e, "tunnel shutdown");
    }
    result.context("bridge relay failed")
}

/// Open the telemetry link: `tcp:host:port`, or a serial device path.
async fn open_link(spec: &str, baud: u32) -> Result<Box<dyn Endpoint>> {
    if let Some(rest) = spec.strip_prefix("tcp:") {
        let (host, port) = rest
            .rsplit_once(':')
            .with_context(|| format!("bad tcp link spec '{}', expected tcp:host:port", spec))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("bad port in link spec '{}'", spec))?;
        let ep = TcpEndpoint::connect(host, port, Duration::from_secs(10))
            .await
            .with_context(|| format!("failed to connect telemetry link {}", spec))?;
        Ok(Box::new(ep))
    } else {
        let ep = SerialEndpoint::open(spec, baud)
            .with_context(|| format!("failed to open telemetry link {}", spec))?;
        Ok(Box::new(ep))
    }
}

fn require_caster(cfg: &FileConfig) -> Result<()> {
    if cfg.caster.host.is_empty() {
        bail!("no caster configured ([caster] host or --host)");
    }
    if cfg.caster.mountpoint.is_empty() {
        bail!("no mountpoint configured ([caster] mountpoint or --mountpoint)");
    }
    Ok(())
}

fn spawn_stats_logger(stats: Arc<RelayStats>, mut stop: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        interval.tick().await; // skip the immediate first tick
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = interval.tick() => {
                    let snap = stats.snapshot();
                    info!(
                        bytes_received = snap.bytes_received,
                        bytes_sent = snap.bytes_sent,
                        frames = snap.frames_decoded,
                        idle_secs = snap.idle.as_secs(),
                        "relay stats"
                    );
                }
            }
        }
    });
}
