//! Peer wire messages
//!
//! Every message after the handshake is a 4-byte big-endian length prefix
//! followed by `length` body bytes; a zero length is a keep-alive, otherwise
//! the first body byte is the message id. This module owns the codec for the
//! ids this client handles (0 through 7); anything else decodes to
//! [`Message::Unknown`] and is ignored upstream.

use crate::error::{ClientError, ProtocolErrorKind, Result};

/// Standard block size: the unit of REQUEST/PIECE (16 KiB)
pub const BLOCK_SIZE: u32 = 16_384;

/// Hard cap on a frame body: a full block plus the PIECE header and id,
/// with a little slack for the fixed-size messages
pub const MAX_FRAME_LEN: u32 = BLOCK_SIZE + 13;

/// A peer wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Zero-length frame; resets the peer's idle clock
    KeepAlive,
    /// We will not serve the receiver's requests
    Choke,
    /// We will serve the receiver's requests
    Unchoke,
    /// We want pieces the receiver has
    Interested,
    /// We no longer want the receiver's pieces
    NotInterested,
    /// Sender now has the given piece
    Have { index: u32 },
    /// Sender's complete piece bitmap
    Bitfield { bitfield: Vec<u8> },
    /// Ask for a block
    Request { index: u32, begin: u32, length: u32 },
    /// A block of piece data
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    /// Message id this client does not handle
    Unknown { id: u8, payload: Vec<u8> },
}

impl Message {
    /// Wire id of this message, `None` for keep-alive
    pub fn id(&self) -> Option<u8> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(0),
            Self::Unchoke => Some(1),
            Self::Interested => Some(2),
            Self::NotInterested => Some(3),
            Self::Have { .. } => Some(4),
            Self::Bitfield { .. } => Some(5),
            Self::Request { .. } => Some(6),
            Self::Piece { .. } => Some(7),
            Self::Unknown { id, .. } => Some(*id),
        }
    }

    /// Encode to a fully framed buffer, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::KeepAlive => vec![0, 0, 0, 0],
            Self::Choke => vec![0, 0, 0, 1, 0],
            Self::Unchoke => vec![0, 0, 0, 1, 1],
            Self::Interested => vec![0, 0, 0, 1, 2],
            Self::NotInterested => vec![0, 0, 0, 1, 3],

            Self::Have { index } => {
                let mut buf = vec![0, 0, 0, 5, 4];
                buf.extend_from_slice(&index.to_be_bytes());
                buf
            }

            Self::Bitfield { bitfield } => {
                let len = 1 + bitfield.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(5);
                buf.extend_from_slice(bitfield);
                buf
            }

            Self::Request {
                index,
                begin,
                length,
            } => {
                let mut buf = vec![0, 0, 0, 13, 6];
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(&length.to_be_bytes());
                buf
            }

            Self::Piece {
                index,
                begin,
                block,
            } => {
                let len = 9 + block.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(7);
                buf.extend_from_slice(&index.to_be_bytes());
                buf.extend_from_slice(&begin.to_be_bytes());
                buf.extend_from_slice(block);
                buf
            }

            Self::Unknown { id, payload } => {
                let len = 1 + payload.len() as u32;
                let mut buf = Vec::with_capacity(4 + len as usize);
                buf.extend_from_slice(&len.to_be_bytes());
                buf.push(*id);
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Decode a message body (id byte plus payload, length prefix already
    /// stripped). An empty body is a keep-alive.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Self::KeepAlive);
        }

        let id = body[0];
        let payload = &body[1..];

        match id {
            0 => Ok(Self::Choke),
            1 => Ok(Self::Unchoke),
            2 => Ok(Self::Interested),
            3 => Ok(Self::NotInterested),

            4 => {
                if payload.len() < 4 {
                    return Err(payload_error("HAVE", payload.len()));
                }
                Ok(Self::Have {
                    index: read_u32(payload, 0),
                })
            }

            5 => Ok(Self::Bitfield {
                bitfield: payload.to_vec(),
            }),

            6 => {
                if payload.len() < 12 {
                    return Err(payload_error("REQUEST", payload.len()));
                }
                Ok(Self::Request {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    length: read_u32(payload, 8),
                })
            }

            7 => {
                if payload.len() < 8 {
                    return Err(payload_error("PIECE", payload.len()));
                }
                Ok(Self::Piece {
                    index: read_u32(payload, 0),
                    begin: read_u32(payload, 4),
                    block: payload[8..].to_vec(),
                })
            }

            _ => Ok(Self::Unknown {
                id,
                payload: payload.to_vec(),
            }),
        }
    }
}

fn read_u32(payload: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([
        payload[at],
        payload[at + 1],
        payload[at + 2],
        payload[at + 3],
    ])
}

fn payload_error(name: &str, len: usize) -> ClientError {
    ClientError::protocol(
        ProtocolErrorKind::InvalidPayload,
        format!("{} payload too short: {} bytes", name, len),
    )
}
