//! # grit-bt
//!
//! A BitTorrent v1 client engine written in Rust.
//!
//! ## Features
//!
//! - **Full peer wire protocol**: handshake, framed messages, keep-alive
//! - **Rarest-first piece selection** with in-flight locking
//! - **Tit-for-tat choking**: four merit slots plus an optimistic unchoke
//! - **Multi-file layouts** behind a bounded pool of open file handles
//! - **SHA-1 verification** of every piece before it touches the bitfield
//! - **Async**: one Tokio task per peer, lock-free message passing between
//!   peers and their session
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use grit_bt::{ClientConfig, Metainfo, TorrentSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let descriptor = std::fs::read("example.torrent")?;
//!     let metainfo = Metainfo::parse(&descriptor)?;
//!
//!     let session = TorrentSession::new(metainfo, ClientConfig::default());
//!     session.run().await?;
//!
//!     Ok(())
//! }
//! ```

// Modules
pub mod bencode;
pub mod choking;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod metainfo;
pub mod peer;
pub mod picker;
pub mod session;
pub mod storage;
pub mod tracker;

// Re-exports for convenience
pub use bencode::BencodeValue;
pub use choking::{ChokeTransition, ChokingController, PeerSnapshot};
pub use config::ClientConfig;
pub use connection::{ConnectionEvent, PeerConnection, TransferRates};
pub use error::{ClientError, ProtocolErrorKind, Result, StorageErrorKind};
pub use message::{Message, BLOCK_SIZE};
pub use metainfo::{FileEntry, Info, Metainfo, Sha1Hash};
pub use peer::{Peer, PeerCommand, PeerEvent, PeerFlags};
pub use picker::PiecePicker;
pub use session::TorrentSession;
pub use storage::PieceRepository;
pub use tracker::{generate_peer_id, AnnounceRequest, AnnounceResponse, TrackerClient};
