use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, Level};

use rockmesh_presence::{
    LanConnectivity, LocalPresence, MemoryMedium, PeerId, PeerIdentity, PeerRegistry,
    PositioningMode, SessionHandle, TransportSession,
};
use rockmesh_sensor::{GeoSample, MockGeolocation, MockRanging};

mod config;

use config::NodeConfig;

#[derive(Parser)]
#[command(name = "rockmeshd")]
#[command(about = "Rockmesh node - share your pet rock with nearby friends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Rock name (defaults to hostname)
    #[arg(short, long)]
    name: Option<String>,

    /// TCP port for peer links, 0 picks a free one
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Positioning mode: geolocation or ranging
    #[arg(short, long)]
    mode: Option<PositioningMode>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short, long, default_value = "info")]
    log_level: Level,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the local network and share positions with nearby rocks
    Start,
    /// Run two rocks in-process and print what each one sees
    Demo {
        /// How long to run
        #[arg(short, long, default_value = "6")]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_target(false)
        .init();

    let config = NodeConfig::load(cli.config, cli.name, cli.port, cli.mode)?;

    match cli.command {
        Some(Commands::Start) | None => run_node(config).await?,
        Some(Commands::Demo { seconds }) => run_demo(config, Duration::from_secs(seconds)).await?,
    }

    Ok(())
}

fn build_session(
    config: &NodeConfig,
    session: TransportSession,
    origin: GeoSample,
) -> TransportSession {
    match config.presence.mode {
        PositioningMode::Geolocation => session.with_geolocation(Arc::new(MockGeolocation::new(
            format!("geo-{}", config.name),
            origin,
            config.sample_interval(),
        ))),
        PositioningMode::Ranging => session.with_ranging(Arc::new(MockRanging::new())),
    }
}

async fn run_node(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("🪨 Rockmesh node");
    info!("   Version: {}", env!("CARGO_PKG_VERSION"));

    let id = PeerId::random();
    info!("📍 Peer ID: {}", id);
    info!("   Name: {}", config.name);
    info!("   Mode: {:?}", config.presence.mode);

    let (link, events) = LanConnectivity::bind(id, config.port).await?;
    info!("   Port: {}", link.tcp_port());

    let local = LocalPresence::new(PeerIdentity::new(id, config.name.clone()));
    let session = TransportSession::new(config.presence.clone(), local, Arc::new(link), events);
    let session = build_session(&config, session, config.origin);
    let handle = session.handle();
    let task = tokio::spawn(session.run());

    info!("🚀 Rock is out. Start another node on this network to see it.");

    let registry = handle.registry().clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(15));
        loop {
            interval.tick().await;
            info!("📊 Status: {} nearby rocks", registry.connected_ids().len());
            for line in describe(&registry) {
                info!("   {}", line);
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutting down...");

    handle.shutdown()?;
    task.await??;
    info!("✅ Node stopped");

    Ok(())
}

async fn run_demo(config: NodeConfig, duration: Duration) -> Result<(), Box<dyn std::error::Error>> {
    let medium = MemoryMedium::new();
    let origins = [GeoSample::new(48.85, 2.35), GeoSample::new(-33.87, 151.21)];

    let mut rocks: Vec<(String, SessionHandle)> = Vec::new();
    for (name, origin) in ["Rocky", "Pebbles"].into_iter().zip(origins) {
        let id = PeerId::random();
        let (link, events) = medium.join(id);
        let local = LocalPresence::new(PeerIdentity::new(id, name));
        let session = TransportSession::new(config.presence.clone(), local, Arc::new(link), events);
        let session = build_session(&config, session, origin);

        rocks.push((name.to_string(), session.handle()));
        tokio::spawn(session.run());
    }

    let ticks = duration.as_secs().max(1);
    for tick in 1..=ticks {
        tokio::time::sleep(Duration::from_secs(1)).await;

        if tick == ticks / 2 + 1 {
            println!("-- Rocky is now called Boulder --");
            rocks[0].1.rename("Boulder")?;
        }
        for (name, handle) in &rocks {
            println!("[{}s] {} sees:", tick, name);
            for line in describe(handle.registry()) {
                println!("    {}", line);
            }
        }
    }

    for (_, handle) in &rocks {
        handle.shutdown()?;
    }
    Ok(())
}

fn describe(registry: &PeerRegistry) -> Vec<String> {
    registry
        .snapshot()
        .into_iter()
        .map(|peer| match peer.position {
            Some(point) => format!("{} ({}) {} at {}", peer.name(), peer.id(), peer.status, point),
            None => format!("{} ({}) {}", peer.name(), peer.id(), peer.status),
        })
        .collect()
}
