//! Piece repository
//!
//! Owns everything piece-shaped on the local side: the expected hashes, the
//! local bitfield, and the mapping from (piece, offset, length) to byte spans
//! across the torrent's files. Disk I/O goes through a bounded pool of
//! read-write handles kept in most-recently-used order.
//!
//! Reads and writes share one byte-range walk over the files table, so a
//! block landing across a file boundary splits into per-file chunks and the
//! operation fails if any byte has no file to live in. The bitfield and the
//! handle pool sit behind a single mutex; setting bit i is atomic with the
//! write of piece i's bytes as far as any reader can observe.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bitvec::prelude::*;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::error::{ClientError, ProtocolErrorKind, Result, StorageErrorKind};
use crate::metainfo::{Info, HASH_LEN};

/// Default cap on simultaneously open file handles
pub const MAX_OPEN_FILES: usize = 64;

/// One resolved target of the files table
#[derive(Debug, Clone)]
struct TargetFile {
    /// Absolute path under the download directory
    path: PathBuf,
    /// Declared length in bytes
    length: u64,
    /// Offset of this file in the concatenated byte stream
    global_offset: u64,
}

/// A chunk of a global byte range that falls inside one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileChunk {
    file_index: usize,
    local_offset: u64,
    length: u64,
}

/// Bounded pool of open file handles in MRU order.
///
/// The last entry is the most recently used. Opening past capacity closes
/// the least recently used handle first. Handles are opened read-write once
/// and reused for both directions.
struct FilePool {
    capacity: usize,
    entries: Vec<(PathBuf, File)>,
}

impl FilePool {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    /// Borrow the handle for `path`, opening it if absent and promoting it
    /// to most recently used.
    fn handle(&mut self, path: &Path) -> std::io::Result<&mut File> {
        if let Some(pos) = self.entries.iter().position(|(p, _)| p == path) {
            let entry = self.entries.remove(pos);
            self.entries.push(entry);
        } else {
            if self.entries.len() >= self.capacity {
                let (evicted, _) = self.entries.remove(0);
                debug!(path = %evicted.display(), "file pool evicted LRU handle");
            }
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            self.entries.push((path.to_path_buf(), file));
        }

        match self.entries.last_mut() {
            Some((_, file)) => Ok(file),
            None => Err(std::io::Error::other("file pool empty after insert")),
        }
    }

    fn open_count(&self) -> usize {
        self.entries.len()
    }
}

struct RepoState {
    /// Which pieces we hold, MSB-first, tail bits zero
    bitfield: BitVec<u8, Msb0>,
    pool: FilePool,
}

/// Verified piece storage over a single- or multi-file layout
pub struct PieceRepository {
    piece_length: u64,
    total_length: u64,
    num_pieces: usize,
    /// Contiguous 20·N buffer; piece i's hash is the subrange [20i, 20i+20)
    hashes: Vec<u8>,
    files: Vec<TargetFile>,
    state: Mutex<RepoState>,
}

impl PieceRepository {
    /// Build a repository for `info` rooted at `download_dir`.
    ///
    /// Single-file layouts live directly under the directory; multi-file
    /// layouts nest under the torrent name. No disk is touched until
    /// [`initialize`](Self::initialize).
    pub fn new(info: &Info, download_dir: &Path, max_open_files: usize) -> Self {
        let files = info
            .files
            .iter()
            .map(|entry| {
                let path = if info.is_single_file {
                    download_dir.join(&entry.path)
                } else {
                    download_dir.join(&info.name).join(&entry.path)
                };
                TargetFile {
                    path,
                    length: entry.length,
                    global_offset: entry.global_offset,
                }
            })
            .collect();

        let num_pieces = info.num_pieces();
        Self {
            piece_length: info.piece_length,
            total_length: info.total_length,
            num_pieces,
            hashes: info.pieces.clone(),
            files,
            state: Mutex::new(RepoState {
                bitfield: bitvec![u8, Msb0; 0; num_pieces],
                pool: FilePool::new(max_open_files),
            }),
        }
    }

    /// Prepare storage: create parent directories and pre-allocate every
    /// file to its declared length. Pre-existing targets are refused;
    /// overwriting is not supported.
    pub fn initialize(&self) -> Result<()> {
        for target in &self.files {
            if let Some(parent) = target.path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ClientError::storage(StorageErrorKind::Io, parent, e.to_string())
                })?;
            }

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&target.path)
                .map_err(|e| {
                    let kind = if e.kind() == std::io::ErrorKind::AlreadyExists {
                        StorageErrorKind::AlreadyExists
                    } else {
                        StorageErrorKind::Io
                    };
                    ClientError::storage(kind, &target.path, e.to_string())
                })?;

            file.set_len(target.length).map_err(|e| {
                ClientError::storage(StorageErrorKind::Io, &target.path, e.to_string())
            })?;
        }

        info!(
            pieces = self.num_pieces,
            total_bytes = self.total_length,
            files = self.files.len(),
            "repository initialized"
        );
        Ok(())
    }

    /// SHA-1 the candidate bytes and compare against the expected hash for
    /// the piece. A mismatch is an ordinary `false`, never an error.
    pub fn verify_hash(&self, index: usize, data: &[u8]) -> bool {
        let Some(expected) = self.hash_for(index) else {
            return false;
        };
        let digest: [u8; HASH_LEN] = Sha1::digest(data).into();
        constant_time_eq(&digest, expected)
    }

    /// Write a verified piece to its byte span and mark it held. Callers
    /// must have checked the hash first.
    pub fn save_piece(&self, index: usize, data: &[u8]) -> Result<()> {
        let expected = self.piece_size(index).ok_or_else(|| {
            ClientError::invalid_input("piece index", format!("{} out of range", index))
        })?;
        if data.len() as u64 != expected {
            return Err(ClientError::invalid_input(
                "piece data",
                format!("piece {}: got {} bytes, expected {}", index, data.len(), expected),
            ));
        }

        let start = index as u64 * self.piece_length;
        let chunks = self.walk_range(start, data.len() as u64)?;

        let mut state = self.state.lock();
        let mut consumed = 0usize;
        for chunk in chunks {
            let target = &self.files[chunk.file_index];
            let end = consumed + chunk.length as usize;
            let file = state.pool.handle(&target.path).map_err(|e| {
                ClientError::storage(StorageErrorKind::Io, &target.path, e.to_string())
            })?;
            file.seek(SeekFrom::Start(chunk.local_offset)).map_err(|e| {
                ClientError::storage(StorageErrorKind::Io, &target.path, e.to_string())
            })?;
            file.write_all(&data[consumed..end]).map_err(|e| {
                ClientError::storage(StorageErrorKind::Io, &target.path, e.to_string())
            })?;
            consumed = end;
        }

        state.bitfield.set(index, true);
        debug!(piece = index, bytes = data.len(), "piece written");
        Ok(())
    }

    /// Read exactly `length` bytes of a piece we hold.
    pub fn read_block(&self, index: usize, begin: u32, length: u32) -> Result<Vec<u8>> {
        let piece_size = self.piece_size(index).ok_or_else(|| {
            ClientError::protocol(
                ProtocolErrorKind::PeerMisbehaved,
                format!("request for piece {} beyond the torrent", index),
            )
        })?;
        if u64::from(begin) + u64::from(length) > piece_size {
            return Err(ClientError::protocol(
                ProtocolErrorKind::PeerMisbehaved,
                format!(
                    "block [{}, {}) outside piece {} of {} bytes",
                    begin,
                    u64::from(begin) + u64::from(length),
                    index,
                    piece_size
                ),
            ));
        }

        let start = index as u64 * self.piece_length + u64::from(begin);
        let chunks = self.walk_range(start, u64::from(length))?;

        let mut state = self.state.lock();
        if !state.bitfield[index] {
            return Err(ClientError::protocol(
                ProtocolErrorKind::PeerMisbehaved,
                format!("request for piece {} we do not have", index),
            ));
        }

        let mut buffer = vec![0u8; length as usize];
        let mut filled = 0usize;
        for chunk in chunks {
            let target = &self.files[chunk.file_index];
            let end = filled + chunk.length as usize;
            let file = state.pool.handle(&target.path).map_err(|e| {
                ClientError::storage(StorageErrorKind::Io, &target.path, e.to_string())
            })?;
            file.seek(SeekFrom::Start(chunk.local_offset)).map_err(|e| {
                ClientError::storage(StorageErrorKind::Io, &target.path, e.to_string())
            })?;
            file.read_exact(&mut buffer[filled..end]).map_err(|e| {
                ClientError::storage(StorageErrorKind::Io, &target.path, e.to_string())
            })?;
            filled = end;
        }

        Ok(buffer)
    }

    /// Whether we hold the piece
    pub fn have_piece(&self, index: usize) -> bool {
        let state = self.state.lock();
        state.bitfield.get(index).is_some_and(|b| *b)
    }

    /// Snapshot of the local bitfield
    pub fn bitfield(&self) -> BitVec<u8, Msb0> {
        self.state.lock().bitfield.clone()
    }

    /// True when every piece is held
    pub fn is_complete(&self) -> bool {
        let state = self.state.lock();
        state.bitfield.count_ones() == self.num_pieces
    }

    /// Count of pieces held
    pub fn pieces_held(&self) -> usize {
        self.state.lock().bitfield.count_ones()
    }

    /// Nominal piece length
    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    /// Total torrent length in bytes
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// Number of pieces
    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    /// True length of a piece; only the final piece may be short
    pub fn piece_size(&self, index: usize) -> Option<u64> {
        if index >= self.num_pieces {
            return None;
        }
        let start = index as u64 * self.piece_length;
        Some((self.total_length - start).min(self.piece_length))
    }

    fn hash_for(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(HASH_LEN)?;
        self.hashes.get(start..start + HASH_LEN)
    }

    /// Split the global byte range [start, start + length) into per-file
    /// chunks. Fails if any byte is left unmapped after the table ends.
    fn walk_range(&self, start: u64, length: u64) -> Result<Vec<FileChunk>> {
        let mut chunks = Vec::new();
        let mut cursor = start;
        let mut remaining = length;

        for (file_index, target) in self.files.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            let file_end = target.global_offset + target.length;
            if cursor >= file_end || cursor + remaining <= target.global_offset {
                continue;
            }

            let local_offset = cursor - target.global_offset;
            let chunk = remaining.min(target.length - local_offset);
            chunks.push(FileChunk {
                file_index,
                local_offset,
                length: chunk,
            });
            cursor += chunk;
            remaining -= chunk;
        }

        if remaining > 0 {
            return Err(ClientError::storage(
                StorageErrorKind::UnmappedRange,
                PathBuf::new(),
                format!(
                    "{} of {} bytes at offset {} map to no file",
                    remaining, length, start
                ),
            ));
        }
        Ok(chunks)
    }
}

/// Byte-wise comparison without a data-dependent early exit.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::FileEntry;
    use tempfile::TempDir;

    /// Info for a multi-file torrent: files of 10, 5 and 20 bytes under
    /// "demo", 7-byte pieces, hashes computed from `piece_bytes`.
    fn multi_file_info(piece_bytes: &dyn Fn(usize) -> Vec<u8>) -> Info {
        let files = vec![
            FileEntry {
                path: PathBuf::from("a.bin"),
                length: 10,
                global_offset: 0,
            },
            FileEntry {
                path: PathBuf::from("b.bin"),
                length: 5,
                global_offset: 10,
            },
            FileEntry {
                path: PathBuf::from("c.bin"),
                length: 20,
                global_offset: 15,
            },
        ];
        let num_pieces = 5; // ceil(35 / 7)
        let mut hashes = Vec::new();
        for i in 0..num_pieces {
            let digest: [u8; 20] = Sha1::digest(piece_bytes(i)).into();
            hashes.extend_from_slice(&digest);
        }
        Info {
            name: "demo".to_string(),
            piece_length: 7,
            pieces: hashes,
            files,
            total_length: 35,
            is_single_file: false,
        }
    }

    fn patterned_piece(index: usize) -> Vec<u8> {
        (0..7).map(|i| (index * 7 + i) as u8).collect()
    }

    fn single_file_info(total: u64, piece_length: u64, content: &[u8]) -> Info {
        let num_pieces = total.div_ceil(piece_length) as usize;
        let mut hashes = Vec::new();
        for i in 0..num_pieces {
            let start = i as u64 * piece_length;
            let end = (start + piece_length).min(total);
            let digest: [u8; 20] =
                Sha1::digest(&content[start as usize..end as usize]).into();
            hashes.extend_from_slice(&digest);
        }
        Info {
            name: "single.bin".to_string(),
            piece_length,
            pieces: hashes,
            files: vec![FileEntry {
                path: PathBuf::from("single.bin"),
                length: total,
                global_offset: 0,
            }],
            total_length: total,
            is_single_file: true,
        }
    }

    #[test]
    fn test_initialize_preallocates_files() {
        let dir = TempDir::new().unwrap();
        let info = multi_file_info(&patterned_piece);
        let repo = PieceRepository::new(&info, dir.path(), MAX_OPEN_FILES);
        repo.initialize().unwrap();

        let root = dir.path().join("demo");
        assert_eq!(std::fs::metadata(root.join("a.bin")).unwrap().len(), 10);
        assert_eq!(std::fs::metadata(root.join("b.bin")).unwrap().len(), 5);
        assert_eq!(std::fs::metadata(root.join("c.bin")).unwrap().len(), 20);
        assert_eq!(repo.pieces_held(), 0);
    }

    #[test]
    fn test_initialize_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let info = multi_file_info(&patterned_piece);
        std::fs::create_dir_all(dir.path().join("demo")).unwrap();
        std::fs::write(dir.path().join("demo").join("a.bin"), b"old").unwrap();

        let repo = PieceRepository::new(&info, dir.path(), MAX_OPEN_FILES);
        let err = repo.initialize().unwrap_err();
        assert!(matches!(
            err,
            ClientError::Storage {
                kind: StorageErrorKind::AlreadyExists,
                ..
            }
        ));
    }

    #[test]
    fn test_piece_spanning_file_boundary() {
        // Piece 2 covers global bytes 14..21: the last byte of b.bin plus
        // the first six bytes of c.bin.
        let dir = TempDir::new().unwrap();
        let info = multi_file_info(&patterned_piece);
        let repo = PieceRepository::new(&info, dir.path(), MAX_OPEN_FILES);
        repo.initialize().unwrap();

        let piece = patterned_piece(2);
        assert!(repo.verify_hash(2, &piece));
        repo.save_piece(2, &piece).unwrap();

        let block = repo.read_block(2, 0, 7).unwrap();
        assert_eq!(block, piece);

        let b = std::fs::read(dir.path().join("demo").join("b.bin")).unwrap();
        assert_eq!(b[4], piece[0]);
        let c = std::fs::read(dir.path().join("demo").join("c.bin")).unwrap();
        assert_eq!(&c[..6], &piece[1..7]);
    }

    #[test]
    fn test_save_and_read_every_piece() {
        let dir = TempDir::new().unwrap();
        let info = multi_file_info(&patterned_piece);
        let repo = PieceRepository::new(&info, dir.path(), MAX_OPEN_FILES);
        repo.initialize().unwrap();

        for index in 0..5 {
            let piece = patterned_piece(index);
            assert!(repo.verify_hash(index, &piece));
            repo.save_piece(index, &piece).unwrap();
            assert!(repo.have_piece(index));
        }
        assert!(repo.is_complete());

        for index in 0..5 {
            assert_eq!(repo.read_block(index, 0, 7).unwrap(), patterned_piece(index));
        }
        // Partial block inside a piece
        assert_eq!(repo.read_block(1, 2, 3).unwrap(), patterned_piece(1)[2..5]);
    }

    #[test]
    fn test_read_block_requires_piece() {
        let dir = TempDir::new().unwrap();
        let info = multi_file_info(&patterned_piece);
        let repo = PieceRepository::new(&info, dir.path(), MAX_OPEN_FILES);
        repo.initialize().unwrap();

        assert!(repo.read_block(0, 0, 7).is_err());
    }

    #[test]
    fn test_read_block_bounds() {
        let dir = TempDir::new().unwrap();
        let info = multi_file_info(&patterned_piece);
        let repo = PieceRepository::new(&info, dir.path(), MAX_OPEN_FILES);
        repo.initialize().unwrap();
        repo.save_piece(0, &patterned_piece(0)).unwrap();

        // Past the end of the piece
        assert!(repo.read_block(0, 4, 4).is_err());
        // Past the end of the torrent
        assert!(repo.read_block(9, 0, 1).is_err());
    }

    #[test]
    fn test_verify_hash_rejects_corruption() {
        let dir = TempDir::new().unwrap();
        let info = multi_file_info(&patterned_piece);
        let repo = PieceRepository::new(&info, dir.path(), MAX_OPEN_FILES);

        let mut piece = patterned_piece(3);
        assert!(repo.verify_hash(3, &piece));
        piece[0] ^= 0x01;
        assert!(!repo.verify_hash(3, &piece));
        // Out-of-range index is a mismatch, not a panic
        assert!(!repo.verify_hash(99, &piece));
    }

    #[test]
    fn test_bitfield_shape_and_tail_bits() {
        // 100 bytes in 10-byte pieces: N = 10, bitfield is two bytes with
        // six trailing zero bits. "Have all" must be 0xFF 0xC0.
        let content: Vec<u8> = (0..100u8).collect();
        let dir = TempDir::new().unwrap();
        let info = single_file_info(100, 10, &content);
        let repo = PieceRepository::new(&info, dir.path(), MAX_OPEN_FILES);
        repo.initialize().unwrap();

        assert_eq!(repo.bitfield().as_raw_slice(), &[0x00, 0x00]);

        for index in 0..10 {
            repo.save_piece(index, &content[index * 10..(index + 1) * 10])
                .unwrap();
        }
        assert_eq!(repo.bitfield().as_raw_slice(), &[0xFF, 0xC0]);
        assert!(repo.is_complete());
    }

    #[test]
    fn test_short_final_piece() {
        let content: Vec<u8> = (0..25u8).collect();
        let dir = TempDir::new().unwrap();
        let info = single_file_info(25, 10, &content);
        let repo = PieceRepository::new(&info, dir.path(), MAX_OPEN_FILES);
        repo.initialize().unwrap();

        assert_eq!(repo.piece_size(2), Some(5));
        repo.save_piece(2, &content[20..25]).unwrap();
        assert_eq!(repo.read_block(2, 0, 5).unwrap(), &content[20..25]);

        // A full-length buffer for the short piece is refused
        assert!(repo.save_piece(2, &[0u8; 10]).is_err());
    }

    #[test]
    fn test_file_pool_eviction_and_promotion() {
        let dir = TempDir::new().unwrap();
        let mut paths = Vec::new();
        for name in ["x", "y", "z"] {
            let path = dir.path().join(name);
            std::fs::write(&path, b"0123456789").unwrap();
            paths.push(path);
        }

        let mut pool = FilePool::new(2);
        pool.handle(&paths[0]).unwrap();
        pool.handle(&paths[1]).unwrap();
        assert_eq!(pool.open_count(), 2);

        // Touch x so y becomes the LRU, then open z: y must be evicted
        pool.handle(&paths[0]).unwrap();
        pool.handle(&paths[2]).unwrap();
        assert_eq!(pool.open_count(), 2);
        let open: Vec<_> = pool.entries.iter().map(|(p, _)| p.clone()).collect();
        assert!(open.contains(&paths[0]));
        assert!(open.contains(&paths[2]));
        assert!(!open.contains(&paths[1]));
    }

    #[test]
    fn test_pool_handles_survive_across_calls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, vec![0u8; 16]).unwrap();

        let mut pool = FilePool::new(2);
        {
            let file = pool.handle(&path).unwrap();
            file.seek(SeekFrom::Start(4)).unwrap();
            file.write_all(b"abcd").unwrap();
        }
        {
            let file = pool.handle(&path).unwrap();
            file.seek(SeekFrom::Start(4)).unwrap();
            let mut buf = [0u8; 4];
            file.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"abcd");
        }
        assert_eq!(pool.open_count(), 1);
    }

    #[test]
    fn test_walk_range_rejects_unmapped_bytes() {
        let dir = TempDir::new().unwrap();
        let info = multi_file_info(&patterned_piece);
        let repo = PieceRepository::new(&info, dir.path(), MAX_OPEN_FILES);

        // 35 bytes total; a range reaching past the table must fail
        assert!(repo.walk_range(30, 10).is_err());
        assert!(repo.walk_range(35, 1).is_err());
        assert!(repo.walk_range(0, 35).is_ok());
    }

    #[test]
    fn test_walk_range_chunks() {
        let dir = TempDir::new().unwrap();
        let info = multi_file_info(&patterned_piece);
        let repo = PieceRepository::new(&info, dir.path(), MAX_OPEN_FILES);

        // Bytes 8..18 touch all three files: a[8..10], b[0..5], c[0..3]
        let chunks = repo.walk_range(8, 10).unwrap();
        assert_eq!(
            chunks,
            vec![
                FileChunk {
                    file_index: 0,
                    local_offset: 8,
                    length: 2
                },
                FileChunk {
                    file_index: 1,
                    local_offset: 0,
                    length: 5
                },
                FileChunk {
                    file_index: 2,
                    local_offset: 0,
                    length: 3
                },
            ]
        );
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"sane"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }
}
