use chunkmaster::{Master, MasterConfig, MasterError, PeerCell};
use clap::{Arg, Command};
use model::CellTag;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), MasterError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new("chunkmaster")
        .version("0.1.0")
        .about("Chunk replication and placement master")
        .arg(
            Arg::new("config")
                .long("config")
                .help("Path to a JSON configuration file")
                .required(false),
        )
        .arg(
            Arg::new("bind")
                .long("bind")
                .help("Address the API listens on")
                .required(false),
        )
        .arg(
            Arg::new("cell-tag")
                .long("cell-tag")
                .help("Tag of the cell this master serves")
                .required(false),
        )
        .arg(
            Arg::new("primary")
                .long("primary")
                .help("Base URL of the primary cell's master")
                .required(false),
        )
        .arg(
            Arg::new("peers")
                .long("peers")
                .help("Comma-separated peer cells as TAG=URL")
                .required(false),
        )
        .arg(
            Arg::new("snapshot-path")
                .long("snapshot-path")
                .help("File the chunk store is persisted to")
                .required(false),
        )
        .get_matches();

    info!("Starting chunk master");

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => MasterConfig::load(&PathBuf::from(path)).await?,
        None => MasterConfig::default(),
    };

    if let Some(bind) = matches.get_one::<String>("bind") {
        config.bind_address = SocketAddr::from_str(bind)
            .map_err(|e| MasterError::InvalidConfig(format!("Invalid bind address: {}", e)))?;
    }
    if let Some(tag) = matches.get_one::<String>("cell-tag") {
        let tag = tag
            .parse::<u16>()
            .map_err(|e| MasterError::InvalidConfig(format!("Invalid cell tag: {}", e)))?;
        config.cell_tag = CellTag(tag);
    }
    if let Some(primary) = matches.get_one::<String>("primary") {
        config.primary_url = Some(primary.clone());
    }
    if let Some(peers) = matches.get_one::<String>("peers") {
        config.peer_cells = parse_peers(peers)?;
    }
    if let Some(path) = matches.get_one::<String>("snapshot-path") {
        config.snapshot_path = Some(PathBuf::from(path));
    }
    config.validate()?;

    info!("Master configuration: {:?}", config);

    let master = Master::new(config).await?;
    master.start().await?;

    Ok(())
}

fn parse_peers(peers: &str) -> Result<Vec<PeerCell>, MasterError> {
    peers
        .split(',')
        .filter(|peer| !peer.trim().is_empty())
        .map(|peer| {
            let (tag, url) = peer
                .trim()
                .split_once('=')
                .ok_or_else(|| MasterError::InvalidConfig(format!("Invalid peer {}: expected TAG=URL", peer)))?;
            let tag = tag
                .parse::<u16>()
                .map_err(|e| MasterError::InvalidConfig(format!("Invalid peer cell tag: {}", e)))?;
            Ok(PeerCell {
                cell_tag: CellTag(tag),
                url: url.to_string(),
            })
        })
        .collect()
}
