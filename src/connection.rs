//! Peer connection transport
//!
//! One TCP socket per peer. The connection performs the 68-byte handshake
//! inline (dial or accept), then splits into a reader task and a writer task:
//! the reader frames incoming bytes and delivers them in arrival order over a
//! channel, ending with exactly one terminal [`ConnectionEvent::Closed`]; the
//! writer drains a FIFO outbox so no two frames ever interleave. A keep-alive
//! timer enqueues a zero frame after 100 seconds of write silence, and a one
//! second sampler turns interval byte counters into public rates.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, warn};

use crate::error::{ClientError, ProtocolErrorKind, Result};
use crate::message::{Message, MAX_FRAME_LEN};
use crate::metainfo::Sha1Hash;

/// Length of the handshake on each side
pub const HANDSHAKE_LEN: usize = 68;

/// Protocol identifier carried in every handshake
const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// How often the keep-alive timer wakes up
const KEEPALIVE_CHECK: Duration = Duration::from_secs(60);

/// Write idleness that triggers a keep-alive frame
const KEEPALIVE_IDLE: Duration = Duration::from_secs(100);

/// Rate sampling period
const RATE_SAMPLE: Duration = Duration::from_secs(1);

/// What the reader task delivers to the owner of the connection
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A framed message, in arrival order
    Message(Message),
    /// The terminal event; delivered exactly once per connection
    Closed(ClientError),
}

/// Stream of events from one connection's reader task
pub type EventStream = UnboundedReceiver<ConnectionEvent>;

/// Rolling transfer statistics, shared between the connection's timer tasks
/// and whoever needs the rates (the choking controller, logging).
pub struct TransferRates {
    download_rate: AtomicU64,
    upload_rate: AtomicU64,
    downloaded_interval: AtomicU64,
    uploaded_interval: AtomicU64,
    last_write: Mutex<Instant>,
}

impl TransferRates {
    pub fn new() -> Self {
        Self {
            download_rate: AtomicU64::new(0),
            upload_rate: AtomicU64::new(0),
            downloaded_interval: AtomicU64::new(0),
            uploaded_interval: AtomicU64::new(0),
            last_write: Mutex::new(Instant::now()),
        }
    }

    /// Bytes per second we are receiving from the peer
    pub fn download_rate(&self) -> u64 {
        self.download_rate.load(Ordering::Relaxed)
    }

    /// Bytes per second we are sending to the peer
    pub fn upload_rate(&self) -> u64 {
        self.upload_rate.load(Ordering::Relaxed)
    }

    fn note_read(&self, bytes: u64) {
        self.downloaded_interval.fetch_add(bytes, Ordering::Relaxed);
    }

    fn note_write(&self, bytes: u64) {
        self.uploaded_interval.fetch_add(bytes, Ordering::Relaxed);
        *self.last_write.lock() = Instant::now();
    }

    /// Snapshot the interval counters into the public rates and reset them.
    fn sample(&self) {
        let down = self.downloaded_interval.swap(0, Ordering::Relaxed);
        let up = self.uploaded_interval.swap(0, Ordering::Relaxed);
        self.download_rate.store(down, Ordering::Relaxed);
        self.upload_rate.store(up, Ordering::Relaxed);
    }

    fn write_idle(&self) -> Duration {
        self.last_write.lock().elapsed()
    }
}

impl Default for TransferRates {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to one live peer socket
pub struct PeerConnection {
    addr: SocketAddr,
    remote_peer_id: [u8; 20],
    outbox: UnboundedSender<Vec<u8>>,
    rates: Arc<TransferRates>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerConnection {
    /// Dial a peer: connect under `connect_timeout`, send our handshake,
    /// read and validate theirs.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: Sha1Hash,
        our_peer_id: [u8; 20],
        rates: Arc<TransferRates>,
        connect_timeout: Duration,
    ) -> Result<(Self, EventStream)> {
        let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Io {
                message: format!("connect to {} timed out", addr),
            })??;

        stream
            .write_all(&encode_handshake(&info_hash, &our_peer_id))
            .await?;

        let mut reply = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut reply).await?;
        let remote_peer_id = validate_handshake(&reply, &info_hash)?;

        Ok(Self::start(stream, addr, remote_peer_id, rates))
    }

    /// Adopt an accepted socket: read and validate the remote handshake,
    /// then reply with ours.
    pub async fn accept(
        mut stream: TcpStream,
        addr: SocketAddr,
        info_hash: Sha1Hash,
        our_peer_id: [u8; 20],
        rates: Arc<TransferRates>,
    ) -> Result<(Self, EventStream)> {
        let mut greeting = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut greeting).await?;
        let remote_peer_id = validate_handshake(&greeting, &info_hash)?;

        stream
            .write_all(&encode_handshake(&info_hash, &our_peer_id))
            .await?;

        Ok(Self::start(stream, addr, remote_peer_id, rates))
    }

    /// Wire up the reader, writer, keep-alive and rate tasks around an
    /// already-handshaken stream.
    fn start(
        stream: TcpStream,
        addr: SocketAddr,
        remote_peer_id: [u8; 20],
        rates: Arc<TransferRates>,
    ) -> (Self, EventStream) {
        let (read_half, write_half) = stream.into_split();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            tokio::spawn(read_loop(read_half, event_tx, Arc::clone(&rates), addr)),
            tokio::spawn(write_loop(write_half, outbox_rx, Arc::clone(&rates))),
            tokio::spawn(keepalive_loop(outbox_tx.clone(), Arc::clone(&rates))),
            tokio::spawn(rate_loop(Arc::clone(&rates))),
        ];

        let connection = Self {
            addr,
            remote_peer_id,
            outbox: outbox_tx,
            rates,
            tasks,
        };
        (connection, event_rx)
    }

    /// Frame and enqueue a message. Writes happen in enqueue order on the
    /// writer task.
    pub fn send(&self, msg: &Message) -> Result<()> {
        self.outbox.send(msg.encode()).map_err(|_| ClientError::Io {
            message: format!("connection to {} is closed", self.addr),
        })
    }

    /// Remote address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Peer id the remote side presented in its handshake
    pub fn remote_peer_id(&self) -> &[u8; 20] {
        &self.remote_peer_id
    }

    /// Shared transfer rates for this connection
    pub fn rates(&self) -> &Arc<TransferRates> {
        &self.rates
    }

    /// Tear the connection down. Idempotent; dropping the handle does the
    /// same thing.
    pub fn close(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Build the 68-byte handshake: length-prefixed protocol string, eight
/// reserved zero bytes, info-hash, peer id.
pub fn encode_handshake(info_hash: &Sha1Hash, peer_id: &[u8; 20]) -> [u8; HANDSHAKE_LEN] {
    let mut buf = [0u8; HANDSHAKE_LEN];
    buf[0] = PROTOCOL_STRING.len() as u8;
    buf[1..20].copy_from_slice(PROTOCOL_STRING);
    // bytes 20..28 stay zero (reserved)
    buf[28..48].copy_from_slice(info_hash);
    buf[48..68].copy_from_slice(peer_id);
    buf
}

/// Check a received handshake and extract the remote peer id.
pub fn validate_handshake(buf: &[u8; HANDSHAKE_LEN], info_hash: &Sha1Hash) -> Result<[u8; 20]> {
    if buf[0] as usize != PROTOCOL_STRING.len() || &buf[1..20] != PROTOCOL_STRING {
        return Err(ClientError::protocol(
            ProtocolErrorKind::InvalidHandshake,
            "handshake protocol string mismatch",
        ));
    }
    if &buf[28..48] != info_hash {
        return Err(ClientError::protocol(
            ProtocolErrorKind::InfoHashMismatch,
            "handshake carries a different info-hash",
        ));
    }

    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(&buf[48..68]);
    Ok(peer_id)
}

/// Read loop: 4-byte length prefix, then the body. Zero length is a
/// keep-alive; oversize is fatal. Malformed payloads are dropped with a
/// warning; the frame was fully consumed, so the stream stays in sync.
async fn read_loop(
    mut reader: OwnedReadHalf,
    events: UnboundedSender<ConnectionEvent>,
    rates: Arc<TransferRates>,
    addr: SocketAddr,
) {
    let mut body = BytesMut::with_capacity(MAX_FRAME_LEN as usize);
    let error = loop {
        let mut prefix = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut prefix).await {
            break e.into();
        }
        let frame_len = u32::from_be_bytes(prefix);

        if frame_len == 0 {
            rates.note_read(4);
            if events.send(ConnectionEvent::Message(Message::KeepAlive)).is_err() {
                return;
            }
            continue;
        }
        if frame_len > MAX_FRAME_LEN {
            break ClientError::protocol(
                ProtocolErrorKind::OversizeFrame,
                format!("frame of {} bytes from {}", frame_len, addr),
            );
        }

        body.resize(frame_len as usize, 0);
        if let Err(e) = reader.read_exact(&mut body[..]).await {
            break e.into();
        }
        rates.note_read(4 + u64::from(frame_len));

        match Message::decode(&body) {
            Ok(msg) => {
                if events.send(ConnectionEvent::Message(msg)).is_err() {
                    return;
                }
            }
            Err(e) if e.is_malformed_payload() => {
                warn!(peer = %addr, error = %e, "dropping malformed message");
            }
            Err(e) => break e,
        }
    };

    debug!(peer = %addr, error = %error, "read loop ended");
    let _ = events.send(ConnectionEvent::Closed(error));
}

/// Write loop: pop the outbox head, write it whole, stamp the write clock.
/// A failed write shuts the socket down so the read loop surfaces the
/// terminal event.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbox: UnboundedReceiver<Vec<u8>>,
    rates: Arc<TransferRates>,
) {
    while let Some(frame) = outbox.recv().await {
        if writer.write_all(&frame).await.is_err() {
            break;
        }
        rates.note_write(frame.len() as u64);
    }
    let _ = writer.shutdown().await;
}

/// Enqueue a keep-alive frame whenever nothing has been written for
/// [`KEEPALIVE_IDLE`].
async fn keepalive_loop(outbox: UnboundedSender<Vec<u8>>, rates: Arc<TransferRates>) {
    let mut ticker = interval(KEEPALIVE_CHECK);
    ticker.tick().await; // the first tick is immediate
    loop {
        ticker.tick().await;
        if rates.write_idle() >= KEEPALIVE_IDLE
            && outbox.send(Message::KeepAlive.encode()).is_err()
        {
            return;
        }
    }
}

/// Snapshot the interval counters every second.
async fn rate_loop(rates: Arc<TransferRates>) {
    let mut ticker = interval(RATE_SAMPLE);
    loop {
        ticker.tick().await;
        rates.sample();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const INFO_HASH: Sha1Hash = [7u8; 20];
    const ID_A: [u8; 20] = *b"-GT0001-000000000001";
    const ID_B: [u8; 20] = *b"-GT0001-000000000002";

    #[test]
    fn test_handshake_layout() {
        let buf = encode_handshake(&INFO_HASH, &ID_A);
        assert_eq!(buf.len(), 68);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], b"BitTorrent protocol");
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(&buf[28..48], &INFO_HASH);
        assert_eq!(&buf[48..68], &ID_A);
    }

    #[test]
    fn test_handshake_validation() {
        let good = encode_handshake(&INFO_HASH, &ID_A);
        assert_eq!(validate_handshake(&good, &INFO_HASH).unwrap(), ID_A);

        let mut bad_protocol = good;
        bad_protocol[5] = b'X';
        assert!(validate_handshake(&bad_protocol, &INFO_HASH).is_err());

        let mut bad_len = good;
        bad_len[0] = 18;
        assert!(validate_handshake(&bad_len, &INFO_HASH).is_err());

        let wrong_hash = encode_handshake(&[9u8; 20], &ID_A);
        let err = validate_handshake(&wrong_hash, &INFO_HASH).unwrap_err();
        assert!(matches!(
            err,
            ClientError::Protocol {
                kind: ProtocolErrorKind::InfoHashMismatch,
                ..
            }
        ));
    }

    async fn connected_pair() -> (PeerConnection, EventStream, PeerConnection, EventStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound = listener.local_addr().unwrap();

        let accept_side = tokio::spawn(async move {
            let (stream, addr) = listener.accept().await.unwrap();
            PeerConnection::accept(stream, addr, INFO_HASH, ID_B, Arc::new(TransferRates::new()))
                .await
                .unwrap()
        });

        let (dialer, dialer_events) = PeerConnection::connect(
            bound,
            INFO_HASH,
            ID_A,
            Arc::new(TransferRates::new()),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let (acceptor, acceptor_events) = accept_side.await.unwrap();
        (dialer, dialer_events, acceptor, acceptor_events)
    }

    #[tokio::test]
    async fn test_handshake_and_message_exchange() {
        let (dialer, mut dialer_events, acceptor, mut acceptor_events) = connected_pair().await;
        assert_eq!(dialer.remote_peer_id(), &ID_B);
        assert_eq!(acceptor.remote_peer_id(), &ID_A);

        dialer.send(&Message::Interested).unwrap();
        dialer
            .send(&Message::Have { index: 3 })
            .unwrap();

        match acceptor_events.recv().await.unwrap() {
            ConnectionEvent::Message(Message::Interested) => {}
            other => panic!("expected INTERESTED, got {:?}", other),
        }
        match acceptor_events.recv().await.unwrap() {
            ConnectionEvent::Message(Message::Have { index }) => assert_eq!(index, 3),
            other => panic!("expected HAVE, got {:?}", other),
        }

        acceptor.send(&Message::Unchoke).unwrap();
        match dialer_events.recv().await.unwrap() {
            ConnectionEvent::Message(Message::Unchoke) => {}
            other => panic!("expected UNCHOKE, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_event_on_remote_close() {
        let (dialer, _dialer_events, _acceptor, mut acceptor_events) = connected_pair().await;

        drop(dialer); // aborts its tasks, closing the socket

        // The acceptor's reader must deliver exactly one Closed event
        loop {
            match acceptor_events.recv().await {
                Some(ConnectionEvent::Closed(_)) => break,
                Some(ConnectionEvent::Message(_)) => continue,
                None => panic!("stream ended without a terminal event"),
            }
        }
        assert!(acceptor_events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_wrong_info_hash_rejected_on_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bound = listener.local_addr().unwrap();

        let accept_side = tokio::spawn(async move {
            let (stream, addr) = listener.accept().await.unwrap();
            PeerConnection::accept(stream, addr, INFO_HASH, ID_B, Arc::new(TransferRates::new()))
                .await
        });

        let result = PeerConnection::connect(
            bound,
            [9u8; 20], // different torrent
            ID_A,
            Arc::new(TransferRates::new()),
            Duration::from_secs(5),
        )
        .await;

        assert!(accept_side.await.unwrap().is_err());
        // The dialer either fails validation too or sees the socket close
        drop(result);
    }

    #[tokio::test]
    async fn test_rates_accumulate() {
        let (dialer, _de, _acceptor, mut acceptor_events) = connected_pair().await;

        let block = vec![0xA5u8; 4096];
        dialer
            .send(&Message::Piece {
                index: 0,
                begin: 0,
                block,
            })
            .unwrap();

        match acceptor_events.recv().await.unwrap() {
            ConnectionEvent::Message(Message::Piece { block, .. }) => {
                assert_eq!(block.len(), 4096)
            }
            other => panic!("expected PIECE, got {:?}", other),
        }

        // Raw frame bytes land in the interval counter until the sampler
        // folds them into the public rate
        let rates = dialer.rates();
        let seen = rates.uploaded_interval.load(Ordering::Relaxed) + rates.upload_rate();
        assert!(seen >= 4096);
    }
}
