//! Torrent descriptor parsing
//!
//! Decodes a .torrent file (BEP 3 metainfo) into the geometry the rest of the
//! client works with: an info-hash, piece hashes, and an ordered files table
//! with running global offsets. Single-file and multi-file layouts normalize
//! into the same table so the repository's byte-range walk never cares which
//! it got.

use sha1::{Digest, Sha1};
use std::path::{Component, Path, PathBuf};

use crate::bencode::{find_info_dict_bytes, BencodeValue};
use crate::error::{ClientError, ProtocolErrorKind, Result};

/// SHA-1 digest length and hence the size of every piece hash
pub const HASH_LEN: usize = 20;

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; HASH_LEN];

/// Parsed torrent descriptor
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 of the exact encoded bytes of the info dictionary
    pub info_hash: Sha1Hash,
    /// Tracker announce URL
    pub announce: String,
    /// The parsed info dictionary
    pub info: Info,
}

/// The info dictionary
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested file name (single-file) or root directory name (multi-file)
    pub name: String,
    /// Bytes per piece; the final piece may be shorter
    pub piece_length: u64,
    /// Concatenated 20-byte SHA-1 piece hashes, one contiguous buffer
    pub pieces: Vec<u8>,
    /// Ordered files table; offsets are running sums of preceding lengths
    pub files: Vec<FileEntry>,
    /// Sum of all file lengths
    pub total_length: u64,
    /// Whether the descriptor used the single-file form
    pub is_single_file: bool,
}

/// One entry of the files table
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the download directory
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Byte offset of this file in the concatenated stream
    pub global_offset: u64,
}

fn descriptor_error(message: impl Into<String>) -> ClientError {
    ClientError::protocol(ProtocolErrorKind::InvalidDescriptor, message)
}

impl Metainfo {
    /// Parse a descriptor from its raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = BencodeValue::parse_exact(data)?;
        let dict = root
            .as_dict()
            .ok_or_else(|| descriptor_error("Root must be a dictionary"))?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| descriptor_error("Missing 'announce' URL"))?
            .to_string();

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or_else(|| descriptor_error("Missing 'info' dictionary"))?;
        let info = Info::parse(info_value)?;

        // Hash the info dictionary's source bytes, not a re-encoding
        let info_bytes = find_info_dict_bytes(data)?;
        let info_hash: Sha1Hash = Sha1::digest(info_bytes).into();

        Ok(Self {
            info_hash,
            announce,
            info,
        })
    }

    /// Info-hash as lowercase hex, for logging
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl Info {
    fn parse(value: &BencodeValue) -> Result<Self> {
        let dict = value
            .as_dict()
            .ok_or_else(|| descriptor_error("'info' must be a dictionary"))?;

        let name = dict
            .get(b"name".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| descriptor_error("Missing 'name' in info"))?
            .to_string();
        validate_relative_path(Path::new(&name))?;

        let piece_length = dict
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_uint())
            .ok_or_else(|| descriptor_error("Missing or invalid 'piece length'"))?;
        if piece_length == 0 {
            return Err(descriptor_error("'piece length' must be greater than zero"));
        }

        let pieces = dict
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| descriptor_error("Missing 'pieces'"))?;
        if pieces.len() % HASH_LEN != 0 {
            return Err(descriptor_error(format!(
                "'pieces' length {} is not a multiple of {}",
                pieces.len(),
                HASH_LEN
            )));
        }

        let (files, total_length, is_single_file) =
            if let Some(files_value) = dict.get(b"files".as_slice()) {
                let (files, total) = Self::parse_files(files_value)?;
                (files, total, false)
            } else {
                let length = dict
                    .get(b"length".as_slice())
                    .and_then(|v| v.as_uint())
                    .ok_or_else(|| {
                        descriptor_error("Missing 'length' for single-file descriptor")
                    })?;
                let entry = FileEntry {
                    path: PathBuf::from(&name),
                    length,
                    global_offset: 0,
                };
                (vec![entry], length, true)
            };

        // num_pieces is fixed twice over: by the hash buffer and by the
        // geometry. The two must agree.
        let expected = total_length.div_ceil(piece_length);
        let num_hashes = (pieces.len() / HASH_LEN) as u64;
        if num_hashes != expected {
            return Err(descriptor_error(format!(
                "Hash count {} does not match {} pieces of {} bytes over {} total",
                num_hashes, expected, piece_length, total_length
            )));
        }

        Ok(Self {
            name,
            piece_length,
            pieces: pieces.to_vec(),
            files,
            total_length,
            is_single_file,
        })
    }

    /// Parse the files list of a multi-file descriptor, assigning running
    /// global offsets in list order.
    fn parse_files(value: &BencodeValue) -> Result<(Vec<FileEntry>, u64)> {
        let list = value
            .as_list()
            .ok_or_else(|| descriptor_error("'files' must be a list"))?;
        if list.is_empty() {
            return Err(descriptor_error("'files' list is empty"));
        }

        let mut files = Vec::with_capacity(list.len());
        let mut offset = 0u64;

        for entry in list {
            let dict = entry
                .as_dict()
                .ok_or_else(|| descriptor_error("File entry must be a dictionary"))?;

            let length = dict
                .get(b"length".as_slice())
                .and_then(|v| v.as_uint())
                .ok_or_else(|| descriptor_error("File entry missing 'length'"))?;

            let segments = dict
                .get(b"path".as_slice())
                .and_then(|v| v.as_list())
                .ok_or_else(|| descriptor_error("File entry missing 'path' list"))?;
            if segments.is_empty() {
                return Err(descriptor_error("File 'path' list is empty"));
            }

            let mut path = PathBuf::new();
            for segment in segments {
                let part = segment
                    .as_str()
                    .ok_or_else(|| descriptor_error("Path segment must be a string"))?;
                path.push(part);
            }
            validate_relative_path(&path)?;

            files.push(FileEntry {
                path,
                length,
                global_offset: offset,
            });
            offset += length;
        }

        Ok((files, offset))
    }

    /// Number of pieces in the torrent
    pub fn num_pieces(&self) -> usize {
        self.pieces.len() / HASH_LEN
    }

    /// The 20-byte hash for a piece, as a subrange of the hash buffer
    pub fn piece_hash(&self, index: usize) -> Option<&[u8]> {
        let start = index.checked_mul(HASH_LEN)?;
        self.pieces.get(start..start + HASH_LEN)
    }

    /// True length of a piece; only the final piece may be short
    pub fn piece_size(&self, index: usize) -> Option<u64> {
        if index >= self.num_pieces() {
            return None;
        }
        let start = index as u64 * self.piece_length;
        Some((self.total_length - start).min(self.piece_length))
    }
}

/// Reject path components that would escape the download directory.
fn validate_relative_path(path: &Path) -> Result<()> {
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(descriptor_error(
                    "File path contains a parent directory reference",
                ))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(descriptor_error("File path is absolute"))
            }
            Component::Normal(_) | Component::CurDir => {}
        }
    }
    Ok(())
}
