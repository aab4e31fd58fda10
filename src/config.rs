//! Client configuration
//!
//! All tunables of the client in one serde-friendly struct. The defaults
//! reproduce the standard environment: TCP port 6882, `./downloads`, four
//! unchoke slots recalculated every ten seconds.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a torrent session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Directory the torrent's files are created under
    pub download_dir: PathBuf,

    /// TCP port the acceptor listens on
    pub listen_port: u16,

    /// Timeout for outbound peer connects, in seconds
    pub connect_timeout_secs: u64,

    /// Maximum outstanding block requests per peer
    pub pipeline_depth: usize,

    /// Number of peers unchoked on merit (the optimistic slot is extra)
    pub unchoke_slots: usize,

    /// Interval between choking recalculations, in seconds
    pub choke_interval_secs: u64,

    /// Hash failures tolerated from one peer before disconnecting it
    pub max_bad_hashes: u32,

    /// Rarest-first tie-break pool size. 1 selects deterministically by
    /// lowest index; larger values spread load across the rarest pieces.
    pub picker_variance: usize,

    /// Cap on simultaneously open file handles in the repository pool
    pub max_open_files: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            listen_port: 6882,
            connect_timeout_secs: 5,
            pipeline_depth: 5,
            unchoke_slots: 4,
            choke_interval_secs: 10,
            max_bad_hashes: 3,
            picker_variance: 1,
            max_open_files: 64,
        }
    }
}

impl ClientConfig {
    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Choking interval as a [`Duration`]
    pub fn choke_interval(&self) -> Duration {
        Duration::from_secs(self.choke_interval_secs)
    }
}
