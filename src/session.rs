//! Torrent session
//!
//! The session owns the repository, the picker, the choking controller and
//! the table of live peers. Each peer runs on its own task and talks back
//! over an event channel; the session talks forward over per-peer command
//! channels. Nothing here blocks: the run loop multiplexes inbound accepts,
//! peer lifecycle events and the rechoke timer.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info, warn};

use crate::choking::{ChokingController, PeerSnapshot};
use crate::config::ClientConfig;
use crate::connection::{PeerConnection, TransferRates};
use crate::error::Result;
use crate::metainfo::Metainfo;
use crate::peer::{Peer, PeerCommand, PeerEvent, PeerFlags};
use crate::picker::PiecePicker;
use crate::storage::PieceRepository;
use crate::tracker::{generate_peer_id, AnnounceRequest, TrackerClient};

/// Session-side handle to one peer task
struct PeerHandle {
    commands: UnboundedSender<PeerCommand>,
    rates: Arc<TransferRates>,
    flags: Arc<PeerFlags>,
}

/// One torrent: storage, strategy and the swarm
pub struct TorrentSession {
    metainfo: Metainfo,
    config: ClientConfig,
    peer_id: [u8; 20],
    repo: Arc<PieceRepository>,
    picker: Arc<PiecePicker>,
    choker: ChokingController,
    peers: HashMap<SocketAddr, PeerHandle>,
}

impl TorrentSession {
    /// Build a session for a parsed descriptor. Storage is not touched
    /// until [`run`](Self::run).
    pub fn new(metainfo: Metainfo, config: ClientConfig) -> Self {
        let repo = Arc::new(PieceRepository::new(
            &metainfo.info,
            &config.download_dir,
            config.max_open_files,
        ));
        let picker = Arc::new(PiecePicker::with_variance(
            metainfo.info.num_pieces(),
            config.picker_variance,
        ));
        let choker = ChokingController::with_slots(config.unchoke_slots);

        Self {
            metainfo,
            config,
            peer_id: generate_peer_id(),
            repo,
            picker,
            choker,
            peers: HashMap::new(),
        }
    }

    /// The repository backing this session
    pub fn repository(&self) -> &Arc<PieceRepository> {
        &self.repo
    }

    /// Number of live peer tasks
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Run the session to completion: prepare storage, announce, exchange
    /// pieces until the local copy is whole.
    pub async fn run(mut self) -> Result<()> {
        self.repo.initialize()?;
        info!(
            torrent = %self.metainfo.info.name,
            info_hash = %self.metainfo.info_hash_hex(),
            pieces = self.repo.num_pieces(),
            "session starting"
        );

        let listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.config.listen_port)).await?;
        info!(port = self.config.listen_port, "accepting inbound connections");

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        // Startup announce; a tracker failure here aborts the session
        let tracker = TrackerClient::new()?;
        let announce = AnnounceRequest {
            info_hash: self.metainfo.info_hash,
            peer_id: self.peer_id,
            port: self.config.listen_port,
            uploaded: 0,
            downloaded: 0,
            left: self.repo.total_length(),
        };
        let response = tracker.announce(&self.metainfo.announce, &announce).await?;

        for addr in response.peers {
            self.dial(addr, &events_tx);
        }
        info!(peers = self.peers.len(), "dialing swarm");

        let mut rechoke = tokio::time::interval(self.config.choke_interval());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.adopt_inbound(stream, addr, &events_tx),
                    Err(error) => warn!(%error, "accept failed"),
                },

                event = events_rx.recv() => match event {
                    Some(PeerEvent::Disconnected { addr }) => {
                        self.peers.remove(&addr);
                        info!(peer = %addr, active = self.peers.len(), "peer removed");
                    }
                    Some(PeerEvent::PieceVerified { index }) => {
                        info!(
                            piece = index,
                            have = self.repo.pieces_held(),
                            total = self.repo.num_pieces(),
                            "piece complete"
                        );
                        self.broadcast_have(index as u32);
                        if self.repo.is_complete() {
                            info!("download complete");
                            break;
                        }
                    }
                    Some(PeerEvent::StorageFailure { error }) => {
                        self.shutdown_peers();
                        return Err(error);
                    }
                    None => break,
                },

                _ = rechoke.tick() => self.rechoke(),
            }
        }

        self.shutdown_peers();
        Ok(())
    }

    /// Start an outbound peer task for a tracker-provided address.
    fn dial(&mut self, addr: SocketAddr, events: &UnboundedSender<PeerEvent>) {
        if self.peers.contains_key(&addr) {
            return;
        }
        let (cmd_rx, rates, flags) = self.register(addr);

        let repo = Arc::clone(&self.repo);
        let picker = Arc::clone(&self.picker);
        let events = events.clone();
        let info_hash = self.metainfo.info_hash;
        let peer_id = self.peer_id;
        let connect_timeout = self.config.connect_timeout();
        let pipeline_depth = self.config.pipeline_depth;
        let max_bad_hashes = self.config.max_bad_hashes;

        tokio::spawn(async move {
            match PeerConnection::connect(addr, info_hash, peer_id, rates, connect_timeout).await
            {
                Ok((conn, stream)) => {
                    let peer = Peer::new(
                        conn,
                        repo,
                        picker,
                        events,
                        flags,
                        pipeline_depth,
                        max_bad_hashes,
                    );
                    peer.run(stream, cmd_rx).await;
                }
                Err(error) => {
                    debug!(peer = %addr, %error, "outbound connect failed");
                    let _ = events.send(PeerEvent::Disconnected { addr });
                }
            }
        });
    }

    /// Wrap an accepted socket in a peer task running the inbound handshake.
    fn adopt_inbound(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        events: &UnboundedSender<PeerEvent>,
    ) {
        info!(peer = %addr, "inbound connection");
        if self.peers.contains_key(&addr) {
            debug!(peer = %addr, "already connected, dropping duplicate socket");
            return;
        }
        let (cmd_rx, rates, flags) = self.register(addr);

        let repo = Arc::clone(&self.repo);
        let picker = Arc::clone(&self.picker);
        let events = events.clone();
        let info_hash = self.metainfo.info_hash;
        let peer_id = self.peer_id;
        let pipeline_depth = self.config.pipeline_depth;
        let max_bad_hashes = self.config.max_bad_hashes;

        tokio::spawn(async move {
            match PeerConnection::accept(stream, addr, info_hash, peer_id, rates).await {
                Ok((conn, stream)) => {
                    let peer = Peer::new(
                        conn,
                        repo,
                        picker,
                        events,
                        flags,
                        pipeline_depth,
                        max_bad_hashes,
                    );
                    peer.run(stream, cmd_rx).await;
                }
                Err(error) => {
                    debug!(peer = %addr, %error, "inbound handshake failed");
                    let _ = events.send(PeerEvent::Disconnected { addr });
                }
            }
        });
    }

    /// Insert the bookkeeping for a new peer and hand back what its task
    /// needs.
    #[allow(clippy::type_complexity)]
    fn register(
        &mut self,
        addr: SocketAddr,
    ) -> (
        mpsc::UnboundedReceiver<PeerCommand>,
        Arc<TransferRates>,
        Arc<PeerFlags>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let rates = Arc::new(TransferRates::new());
        let flags = Arc::new(PeerFlags::default());
        self.peers.insert(
            addr,
            PeerHandle {
                commands: cmd_tx,
                rates: Arc::clone(&rates),
                flags: Arc::clone(&flags),
            },
        );
        (cmd_rx, rates, flags)
    }

    /// Snapshot the swarm and apply the controller's transitions.
    fn rechoke(&mut self) {
        if self.peers.is_empty() {
            return;
        }
        let snapshots: Vec<PeerSnapshot> = self
            .peers
            .iter()
            .map(|(addr, handle)| PeerSnapshot {
                addr: *addr,
                upload_to_us: handle.rates.download_rate(),
                am_choking: handle.flags.am_choking.load(Ordering::Relaxed),
            })
            .collect();

        for transition in self.choker.rechoke(&snapshots) {
            if let Some(handle) = self.peers.get(&transition.addr) {
                let _ = handle
                    .commands
                    .send(PeerCommand::SetChoking(transition.choke));
            }
        }
    }

    /// Tell every peer we now hold a piece.
    fn broadcast_have(&self, index: u32) {
        for handle in self.peers.values() {
            let _ = handle.commands.send(PeerCommand::AnnounceHave(index));
        }
    }

    fn shutdown_peers(&mut self) {
        for handle in self.peers.values() {
            let _ = handle.commands.send(PeerCommand::Shutdown);
        }
        self.peers.clear();
    }
}
