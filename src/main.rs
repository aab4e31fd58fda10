//! grit-bt command line client
//!
//! Downloads one torrent: reads the descriptor, announces, exchanges pieces
//! until the local copy is complete. Exits 0 on completion, 1 on any fatal
//! error.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use grit_bt::{ClientConfig, Metainfo, TorrentSession};

#[derive(Debug, Parser)]
#[command(name = "grit-bt", version, about = "BitTorrent v1 client")]
struct Args {
    /// Path to the .torrent descriptor
    torrent: PathBuf,

    /// Listening port for inbound peers
    #[arg(long, default_value_t = 6882)]
    port: u16,

    /// Directory to place the downloaded files in
    #[arg(long, default_value = "./downloads")]
    download_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let descriptor = match std::fs::read(&args.torrent) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(path = %args.torrent.display(), error = %e, "cannot read descriptor");
            return ExitCode::from(1);
        }
    };

    let metainfo = match Metainfo::parse(&descriptor) {
        Ok(metainfo) => metainfo,
        Err(e) => {
            error!(path = %args.torrent.display(), error = %e, "invalid descriptor");
            return ExitCode::from(1);
        }
    };
    info!(
        torrent = %metainfo.info.name,
        size = metainfo.info.total_length,
        "descriptor loaded"
    );

    let config = ClientConfig {
        download_dir: args.download_dir,
        listen_port: args.port,
        ..ClientConfig::default()
    };

    let session = TorrentSession::new(metainfo, config);
    tokio::select! {
        result = session.run() => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "session failed");
                ExitCode::from(1)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            ExitCode::SUCCESS
        }
    }
}
