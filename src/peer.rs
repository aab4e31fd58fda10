//! Per-peer protocol logic
//!
//! One `Peer` drives one connection: it owns the remote bitfield, the four
//! choke/interest flags, the request pipeline and the buffers of pieces being
//! assembled. All of its state lives on its own task; the only shared objects
//! it touches are the repository and the picker, which serialize internally.
//!
//! The pipeline keeps up to K requests outstanding and rolls over to the next
//! piece as soon as every block of the current one has been requested, so
//! small pieces do not stall the pipe. At most K pieces can be in progress at
//! once, each with its own buffer and write cursor.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bitvec::prelude::*;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionEvent, EventStream, PeerConnection};
use crate::error::{ClientError, ProtocolErrorKind, Result};
use crate::message::{Message, BLOCK_SIZE};
use crate::picker::PiecePicker;
use crate::storage::PieceRepository;

/// Outstanding request cap per peer (the pipeline depth)
pub const PIPELINE_DEPTH: usize = 5;

/// Hash failures tolerated before the peer is disconnected
pub const MAX_BAD_HASHES: u32 = 3;

/// Largest REQUEST we will serve (128 KiB); bigger ones are ignored
const MAX_REQUEST_LEN: u32 = 131_072;

/// Lifecycle reports a peer sends its session
#[derive(Debug)]
pub enum PeerEvent {
    /// The connection ended; the peer has already released its picker state
    Disconnected { addr: SocketAddr },
    /// A piece was verified and written
    PieceVerified { index: usize },
    /// The repository failed to persist a piece; the session must stop
    StorageFailure { error: ClientError },
}

/// Commands a session sends a peer task
#[derive(Debug)]
pub enum PeerCommand {
    /// Apply a choking decision; a transition sends CHOKE or UNCHOKE
    SetChoking(bool),
    /// Tell the remote side we now hold a piece
    AnnounceHave(u32),
    /// Stop the peer task
    Shutdown,
}

/// Flags a peer shares with its session so the choking controller can see
/// the current state without crossing task boundaries.
#[derive(Debug)]
pub struct PeerFlags {
    /// Whether we are choking the remote peer (default true)
    pub am_choking: AtomicBool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            am_choking: AtomicBool::new(true),
        }
    }
}

/// A block request we have sent and not yet seen answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRequest {
    index: u32,
    begin: u32,
    length: u32,
}

/// A piece being assembled: its true-length buffer and the offset of the
/// next block to request
struct ActivePiece {
    index: usize,
    buf: Vec<u8>,
    next_offset: usize,
}

impl ActivePiece {
    fn fully_requested(&self) -> bool {
        self.next_offset >= self.buf.len()
    }
}

/// Protocol state machine for one remote peer
pub struct Peer {
    conn: PeerConnection,
    addr: SocketAddr,
    repo: Arc<PieceRepository>,
    picker: Arc<PiecePicker>,
    events: UnboundedSender<PeerEvent>,
    flags: Arc<PeerFlags>,
    pipeline_depth: usize,
    max_bad_hashes: u32,

    peer_bits: BitVec<u8, Msb0>,
    am_choking: bool,
    peer_choking: bool,
    am_interested: bool,
    peer_interested: bool,

    active: Vec<ActivePiece>,
    pipeline: VecDeque<PendingRequest>,
    failed_hashes: u32,
}

impl Peer {
    /// Wrap an already-handshaken connection.
    pub fn new(
        conn: PeerConnection,
        repo: Arc<PieceRepository>,
        picker: Arc<PiecePicker>,
        events: UnboundedSender<PeerEvent>,
        flags: Arc<PeerFlags>,
        pipeline_depth: usize,
        max_bad_hashes: u32,
    ) -> Self {
        let addr = conn.addr();
        let num_pieces = repo.num_pieces();
        Self {
            conn,
            addr,
            repo,
            picker,
            events,
            flags,
            pipeline_depth,
            max_bad_hashes,
            peer_bits: bitvec![u8, Msb0; 0; num_pieces],
            am_choking: true,
            peer_choking: true,
            am_interested: false,
            peer_interested: false,
            active: Vec::new(),
            pipeline: VecDeque::new(),
            failed_hashes: 0,
        }
    }

    /// Drive the peer until its connection ends or the session shuts it
    /// down. Consumes the peer; lifecycle reports flow through the event
    /// channel handed to [`new`](Self::new).
    pub async fn run(
        mut self,
        mut stream: EventStream,
        mut commands: UnboundedReceiver<PeerCommand>,
    ) {
        info!(peer = %self.addr, "handshake complete");

        // First post-handshake message is our bitfield
        let bitfield = self.repo.bitfield().as_raw_slice().to_vec();
        if self.conn.send(&Message::Bitfield { bitfield }).is_err() {
            self.teardown();
            return;
        }

        loop {
            tokio::select! {
                event = stream.recv() => match event {
                    Some(ConnectionEvent::Message(msg)) => {
                        if let Err(error) = self.on_message(msg) {
                            debug!(peer = %self.addr, %error, "closing connection");
                            break;
                        }
                    }
                    Some(ConnectionEvent::Closed(error)) => {
                        info!(peer = %self.addr, %error, "peer connection lost");
                        break;
                    }
                    None => break,
                },
                cmd = commands.recv() => match cmd {
                    Some(PeerCommand::SetChoking(choke)) => {
                        if self.set_am_choking(choke).is_err() {
                            break;
                        }
                    }
                    Some(PeerCommand::AnnounceHave(index)) => {
                        let held = self
                            .peer_bits
                            .get(index as usize)
                            .is_some_and(|b| *b);
                        if !held && self.conn.send(&Message::Have { index }).is_err() {
                            break;
                        }
                    }
                    Some(PeerCommand::Shutdown) | None => break,
                },
            }
        }

        self.teardown();
    }

    /// Update state from one message, then act on the new state.
    fn on_message(&mut self, msg: Message) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => self.on_choke(),
            Message::Unchoke => {
                info!(peer = %self.addr, "unchoked by peer");
                self.peer_choking = false;
            }
            Message::Interested => {
                self.peer_interested = true;
            }
            Message::NotInterested => {
                self.peer_interested = false;
            }
            Message::Have { index } => self.on_have(index),
            Message::Bitfield { bitfield } => self.on_bitfield(bitfield),
            Message::Request {
                index,
                begin,
                length,
            } => self.on_request(index, begin, length)?,
            Message::Piece {
                index,
                begin,
                block,
            } => self.on_piece(index, begin, block)?,
            Message::Unknown { id, .. } => {
                warn!(peer = %self.addr, id, "ignoring unhandled message id");
            }
        }

        self.evaluate_interest()?;
        self.fill_pipeline()
    }

    /// CHOKE drops every outstanding request. Bytes already received stay in
    /// their buffers; each in-progress piece rewinds its cursor by the
    /// requests it lost, so the blocks get re-requested after an UNCHOKE.
    fn on_choke(&mut self) {
        info!(peer = %self.addr, "choked by peer");
        self.peer_choking = true;

        if self.pipeline.is_empty() {
            return;
        }
        for piece in &mut self.active {
            let dropped = self
                .pipeline
                .iter()
                .filter(|r| r.index as usize == piece.index)
                .count();
            piece.next_offset = piece
                .next_offset
                .saturating_sub(dropped * BLOCK_SIZE as usize);
        }
        debug!(
            peer = %self.addr,
            dropped = self.pipeline.len(),
            "dropped in-flight requests"
        );
        self.pipeline.clear();
    }

    fn on_have(&mut self, index: u32) {
        let index = index as usize;
        if index >= self.repo.num_pieces() {
            warn!(peer = %self.addr, index, "HAVE for piece beyond the torrent");
            return;
        }
        if !self.peer_bits[index] {
            self.peer_bits.set(index, true);
            self.picker.record_have(index);
        }
    }

    /// Replace the remote bitfield. Tail bits past the torrent are ignored;
    /// a short bitfield zero-extends. Availability moves from the old bits
    /// to the new ones.
    fn on_bitfield(&mut self, bytes: Vec<u8>) {
        debug!(peer = %self.addr, bytes = bytes.len(), "received bitfield");
        let mut bits = BitVec::<u8, Msb0>::from_vec(bytes);
        bits.resize(self.repo.num_pieces(), false);

        if self.peer_bits.any() {
            self.picker.update_availability(&self.peer_bits, false);
        }
        self.peer_bits = bits;
        self.picker.update_availability(&self.peer_bits, true);
    }

    /// Serve a block if we are not choking the requester and the request is
    /// sane. A block we cannot read is logged and dropped, never fatal.
    fn on_request(&mut self, index: u32, begin: u32, length: u32) -> Result<()> {
        if self.am_choking {
            debug!(peer = %self.addr, index, "ignoring REQUEST while choking");
            return Ok(());
        }
        if length > MAX_REQUEST_LEN {
            warn!(peer = %self.addr, length, "ignoring oversized REQUEST");
            return Ok(());
        }

        match self.repo.read_block(index as usize, begin, length) {
            Ok(block) => self.conn.send(&Message::Piece {
                index,
                begin,
                block,
            }),
            Err(error) => {
                debug!(peer = %self.addr, index, begin, %error, "cannot serve REQUEST");
                Ok(())
            }
        }
    }

    /// Accept a block: it must match a pending request and land inside the
    /// buffer of a piece we are assembling. When the last block of a piece
    /// arrives, the piece completes.
    fn on_piece(&mut self, index: u32, begin: u32, block: Vec<u8>) -> Result<()> {
        let length = block.len() as u32;
        let Some(pos) = self
            .pipeline
            .iter()
            .position(|r| r.index == index && r.begin == begin && r.length == length)
        else {
            warn!(
                peer = %self.addr,
                index, begin, length,
                "PIECE matches no pending request, discarding"
            );
            return Ok(());
        };
        self.pipeline.remove(pos);

        let index = index as usize;
        match self.active.iter_mut().find(|p| p.index == index) {
            Some(piece) => {
                let begin = begin as usize;
                if begin + block.len() <= piece.buf.len() {
                    piece.buf[begin..begin + block.len()].copy_from_slice(&block);
                } else {
                    warn!(peer = %self.addr, index, begin, "block overflows piece buffer");
                    return Ok(());
                }
            }
            None => {
                warn!(peer = %self.addr, index, "block for piece no longer in progress");
                return Ok(());
            }
        }

        let finished = self
            .active
            .iter()
            .position(|p| p.index == index && p.fully_requested())
            .filter(|_| !self.pipeline.iter().any(|r| r.index as usize == index));
        if let Some(slot) = finished {
            self.complete_piece(slot)?;
        }
        Ok(())
    }

    /// Verify and persist an assembled piece, or take a strike.
    fn complete_piece(&mut self, slot: usize) -> Result<()> {
        let piece = self.active.remove(slot);

        if self.repo.verify_hash(piece.index, &piece.buf) {
            if let Err(error) = self.repo.save_piece(piece.index, &piece.buf) {
                // Disk trouble is fatal for the whole session, not just
                // this connection
                let _ = self.events.send(PeerEvent::StorageFailure { error });
                return Err(ClientError::Shutdown);
            }
            self.picker.piece_passed(piece.index);
            info!(peer = %self.addr, piece = piece.index, "piece verified and written");
            let _ = self.events.send(PeerEvent::PieceVerified { index: piece.index });
        } else {
            self.picker.piece_failed(piece.index);
            self.failed_hashes += 1;
            warn!(
                peer = %self.addr,
                piece = piece.index,
                strikes = self.failed_hashes,
                "piece failed hash check"
            );
            if self.failed_hashes >= self.max_bad_hashes {
                return Err(ClientError::protocol(
                    ProtocolErrorKind::PeerMisbehaved,
                    "too many hash failures",
                ));
            }
        }
        Ok(())
    }

    /// Become interested the first time the peer holds a piece we lack.
    fn evaluate_interest(&mut self) -> Result<()> {
        if self.am_interested {
            return Ok(());
        }
        let mine = self.repo.bitfield();
        let wanted = self.peer_bits.iter_ones().any(|i| !mine[i]);
        if wanted {
            debug!(peer = %self.addr, "sending INTERESTED");
            self.conn.send(&Message::Interested)?;
            self.am_interested = true;
        }
        Ok(())
    }

    /// Keep up to `pipeline_depth` requests outstanding. Blocks come from
    /// the oldest in-progress piece with anything left to request; once
    /// every piece is fully requested the picker assigns a new one, and the
    /// loop ends when it has nothing for us.
    fn fill_pipeline(&mut self) -> Result<()> {
        if !self.am_interested || self.peer_choking {
            return Ok(());
        }

        while self.pipeline.len() < self.pipeline_depth {
            if let Some(piece) = self.active.iter_mut().find(|p| !p.fully_requested()) {
                let block_len = (piece.buf.len() - piece.next_offset).min(BLOCK_SIZE as usize);
                let request = PendingRequest {
                    index: piece.index as u32,
                    begin: piece.next_offset as u32,
                    length: block_len as u32,
                };
                debug!(
                    peer = %self.addr,
                    piece = request.index,
                    begin = request.begin,
                    length = request.length,
                    "requesting block"
                );
                self.conn.send(&Message::Request {
                    index: request.index,
                    begin: request.begin,
                    length: request.length,
                })?;
                self.pipeline.push_back(request);
                piece.next_offset += block_len;
            } else {
                let mine = self.repo.bitfield();
                let Some(index) = self.picker.pick_piece(&self.peer_bits, &mine) else {
                    break;
                };
                let Some(size) = self.repo.piece_size(index) else {
                    self.picker.piece_failed(index);
                    break;
                };
                self.active.push(ActivePiece {
                    index,
                    buf: vec![0; size as usize],
                    next_offset: 0,
                });
            }
        }
        Ok(())
    }

    /// Apply a choking decision from the controller. Only transitions reach
    /// the wire.
    fn set_am_choking(&mut self, choke: bool) -> Result<()> {
        if choke == self.am_choking {
            return Ok(());
        }
        self.am_choking = choke;
        self.flags.am_choking.store(choke, Ordering::Relaxed);
        if choke {
            info!(peer = %self.addr, "choking peer");
            self.conn.send(&Message::Choke)
        } else {
            info!(peer = %self.addr, "unchoking peer");
            self.conn.send(&Message::Unchoke)
        }
    }

    /// Release everything this peer held and report the disconnect.
    fn teardown(mut self) {
        self.picker.update_availability(&self.peer_bits, false);
        for piece in &self.active {
            self.picker.piece_failed(piece.index);
        }
        self.conn.close();
        info!(peer = %self.addr, "disconnected");
        let _ = self.events.send(PeerEvent::Disconnected { addr: self.addr });
    }
}
