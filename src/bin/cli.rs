use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use rs_swarm::{
    HttpTracker, PieceStore, RandomPolicy, SwarmConfig, SwarmCoordinator, generate_peer_id,
    parse_torrent_file,
};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

/// Download a torrent and keep seeding it until interrupted
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The .torrent file.
    torrent: PathBuf,

    /// Where the downloaded file (or directory for multi-file torrents) goes.
    destination: PathBuf,

    #[arg(long, default_value_t = 6881)]
    port_min: u16,

    #[arg(long, default_value_t = 6889)]
    port_max: u16,

    /// Concurrent download sessions.
    #[arg(long, default_value_t = 3)]
    max_download: usize,

    /// Concurrent upload sessions.
    #[arg(long, default_value_t = 3)]
    max_upload: usize,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let meta = Arc::new(parse_torrent_file(&args.torrent)?);
    info!(
        name = %meta.name,
        pieces = meta.piece_count(),
        size = meta.total_length,
        "loaded {}",
        args.torrent.display()
    );

    let store = Arc::new(PieceStore::open(Arc::clone(&meta), &args.destination)?);
    let config = SwarmConfig {
        max_download_sessions: args.max_download,
        max_upload_sessions: args.max_upload,
        listen_ports: args.port_min..=args.port_max,
        ..Default::default()
    };
    config.validate()?;

    let listener = config.bind_listener().await?;
    let port = listener.local_addr()?.port();
    let peer_id = generate_peer_id();
    let tracker = Arc::new(HttpTracker::new(&meta, peer_id, port));
    let policy = Arc::new(RandomPolicy::new(config.unchoke_probability));

    let mut swarm = SwarmCoordinator::new(config, store, tracker, policy, peer_id, listener)?;
    swarm.start();

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    swarm.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(LevelFilter::from(args.log_level))
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}
