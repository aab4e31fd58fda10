//! Tracker client
//!
//! One HTTP GET against the descriptor's announce URL, carrying the standard
//! query parameters with byte-wise percent-encoding, and a bencoded response
//! carrying the compact peer list. This client speaks the compact form only;
//! dictionary-model peer lists are not supported.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use rand::Rng;
use tracing::info;

use crate::bencode::BencodeValue;
use crate::error::{ClientError, Result};
use crate::metainfo::Sha1Hash;

/// Timeout for the announce request
const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(15);

/// Azureus-style client prefix of our peer ids
const PEER_ID_PREFIX: &[u8; 8] = b"-GT0001-";

/// Announce request parameters
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    /// Info-hash of the torrent
    pub info_hash: Sha1Hash,
    /// Our peer id
    pub peer_id: [u8; 20],
    /// Port we accept connections on
    pub port: u16,
    /// Bytes uploaded so far
    pub uploaded: u64,
    /// Bytes downloaded so far
    pub downloaded: u64,
    /// Bytes remaining
    pub left: u64,
}

/// Announce response from the tracker
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Seconds until the tracker wants to hear from us again
    pub interval: Option<u32>,
    /// Peer addresses from the compact list
    pub peers: Vec<SocketAddr>,
}

/// HTTP tracker client
pub struct TrackerClient {
    http: reqwest::Client,
}

impl TrackerClient {
    /// Build a client with the standard announce timeout.
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(ANNOUNCE_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }

    /// Announce the start of a download and collect the peer list.
    pub async fn announce(
        &self,
        announce_url: &str,
        request: &AnnounceRequest,
    ) -> Result<AnnounceResponse> {
        let url = build_announce_url(announce_url, request);
        info!(url = %announce_url, left = request.left, "announcing to tracker");

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Tracker(format!(
                "tracker returned HTTP {}",
                status
            )));
        }

        let body = response.bytes().await?;
        let parsed = parse_announce_response(&body)?;
        info!(
            peers = parsed.peers.len(),
            interval = ?parsed.interval,
            "tracker responded"
        );
        Ok(parsed)
    }
}

/// Assemble the GET URL.
///
/// Binary parameters are percent-encoded byte-wise; every byte outside
/// unreserved characters becomes `%HH` uppercase. A `?` already present in
/// the announce URL flips the first separator to `&`.
pub fn build_announce_url(announce_url: &str, request: &AnnounceRequest) -> String {
    let mut url = String::with_capacity(announce_url.len() + 160);
    url.push_str(announce_url);
    url.push(if announce_url.contains('?') { '&' } else { '?' });

    url.push_str("info_hash=");
    url.push_str(&percent_encode(&request.info_hash));
    url.push_str("&peer_id=");
    url.push_str(&percent_encode(&request.peer_id));
    url.push_str(&format!("&port={}", request.port));
    url.push_str(&format!("&uploaded={}", request.uploaded));
    url.push_str(&format!("&downloaded={}", request.downloaded));
    url.push_str(&format!("&left={}", request.left));
    url.push_str("&compact=1");
    url.push_str("&event=started");

    url
}

/// Percent-encode raw bytes: unreserved characters pass through, everything
/// else becomes `%HH` with uppercase hex digits.
pub fn percent_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for &byte in data {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Decode the bencoded announce response.
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse> {
    let value = BencodeValue::parse_exact(body)
        .map_err(|_| ClientError::Tracker("response is not valid bencode".into()))?;
    let dict = value
        .as_dict()
        .ok_or_else(|| ClientError::Tracker("response is not a dictionary".into()))?;

    if let Some(reason) = dict.get(b"failure reason".as_slice()) {
        let message = reason.as_str().unwrap_or("unreadable failure reason");
        return Err(ClientError::Tracker(message.to_string()));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(|v| v.as_uint())
        .map(|v| v as u32);

    let peers = match dict.get(b"peers".as_slice()) {
        Some(BencodeValue::Bytes(blob)) => parse_compact_peers(blob)?,
        Some(_) => {
            return Err(ClientError::Tracker(
                "non-compact peer list is not supported".into(),
            ))
        }
        None => Vec::new(),
    };

    Ok(AnnounceResponse { interval, peers })
}

/// Decode the compact peer blob: 6 bytes per record, 4 of IPv4 then 2 of
/// big-endian port.
fn parse_compact_peers(blob: &[u8]) -> Result<Vec<SocketAddr>> {
    if blob.len() % 6 != 0 {
        return Err(ClientError::Tracker(format!(
            "compact peer list of {} bytes is not a multiple of 6",
            blob.len()
        )));
    }

    Ok(blob
        .chunks_exact(6)
        .map(|record| {
            let ip = Ipv4Addr::new(record[0], record[1], record[2], record[3]);
            let port = u16::from_be_bytes([record[4], record[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}

/// Generate a fresh peer id: the client prefix followed by twelve random
/// decimal digits. Exactly 20 bytes, never persisted.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for slot in id[8..].iter_mut() {
        *slot = b'0' + rng.gen_range(0..10u8);
    }
    id
}
