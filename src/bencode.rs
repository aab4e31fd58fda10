//! Bencode decoding and encoding
//!
//! The client keeps its own bencode layer rather than a serde binding because
//! info-hash computation needs the exact bytes of the `info` dictionary as
//! they appear in the descriptor, and tracker responses carry binary peer
//! blobs that must stay untouched.
//!
//! Bencode grammar:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ClientError, ProtocolErrorKind, Result};

/// Longest byte string the decoder will accept (100 MiB). Stops a hostile
/// descriptor or tracker response from reserving unbounded memory.
const MAX_STRING_LEN: usize = 100 * 1024 * 1024;

/// A decoded bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer (may be negative)
    Integer(i64),
    /// Byte string, not necessarily UTF-8
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<BencodeValue>),
    /// Dictionary keyed by byte strings, in sorted key order
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({})", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 48 => write!(f, "Bytes({:?})", s),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let readable: BTreeMap<String, &BencodeValue> = d
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v))
                    .collect();
                f.debug_tuple("Dict").field(&readable).finish()
            }
        }
    }
}

fn parse_error(message: impl Into<String>) -> ClientError {
    ClientError::protocol(ProtocolErrorKind::BencodeParse, message)
}

/// Cursor over the input bytes. Every `parse_*` consumes exactly the bytes of
/// one value, so `pos` after a top-level parse marks the value's encoded end.
struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn bump(&mut self) -> Result<u8> {
        let byte = self
            .peek()
            .ok_or_else(|| parse_error("Unexpected end of input"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn parse_value(&mut self) -> Result<BencodeValue> {
        match self.peek() {
            Some(b'i') => self.parse_integer(),
            Some(b'l') => self.parse_list(),
            Some(b'd') => self.parse_dict(),
            Some(b'0'..=b'9') => self.parse_bytes().map(BencodeValue::Bytes),
            Some(c) => Err(parse_error(format!(
                "Invalid bencode type marker: {:?}",
                c as char
            ))),
            None => Err(parse_error("Empty input")),
        }
    }

    fn parse_integer(&mut self) -> Result<BencodeValue> {
        self.bump()?; // 'i'
        let start = self.pos;
        while self.peek().is_some_and(|c| c != b'e') {
            self.pos += 1;
        }
        if self.peek().is_none() {
            return Err(parse_error("Unterminated integer"));
        }

        let digits = &self.data[start..self.pos];
        self.pos += 1; // 'e'

        let text = std::str::from_utf8(digits)
            .map_err(|_| parse_error("Invalid integer encoding"))?;

        // Canonical form only: no leading zeros, no negative zero
        if text.len() > 1 && (text.starts_with('0') || text.starts_with("-0")) {
            return Err(parse_error(format!("Non-canonical integer: {}", text)));
        }
        if text == "-0" {
            return Err(parse_error("Negative zero"));
        }

        let value = text
            .parse::<i64>()
            .map_err(|_| parse_error(format!("Integer out of range: {}", text)))?;
        Ok(BencodeValue::Integer(value))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(parse_error("Expected string length"));
        }
        if self.bump()? != b':' {
            return Err(parse_error("Expected colon after string length"));
        }

        let len: usize = std::str::from_utf8(&self.data[start..self.pos - 1])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| parse_error("Invalid string length"))?;

        if len > MAX_STRING_LEN {
            return Err(parse_error(format!(
                "String of {} bytes exceeds the {} byte cap",
                len, MAX_STRING_LEN
            )));
        }
        if self.pos + len > self.data.len() {
            return Err(parse_error(format!(
                "String length {} exceeds remaining input {}",
                len,
                self.data.len() - self.pos
            )));
        }

        let bytes = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<BencodeValue> {
        self.bump()?; // 'l'
        let mut items = Vec::new();
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(BencodeValue::List(items));
                }
                Some(_) => items.push(self.parse_value()?),
                None => return Err(parse_error("Unterminated list")),
            }
        }
    }

    fn parse_dict(&mut self) -> Result<BencodeValue> {
        self.bump()?; // 'd'
        let mut entries = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.pos += 1;
                    return Ok(BencodeValue::Dict(entries));
                }
                Some(_) => {
                    let key = self.parse_bytes()?;
                    if last_key.as_ref().is_some_and(|prev| *prev >= key) {
                        return Err(parse_error("Dict keys not in sorted order"));
                    }
                    let value = self.parse_value()?;
                    last_key = Some(key.clone());
                    entries.insert(key, value);
                }
                None => return Err(parse_error("Unterminated dict")),
            }
        }
    }
}

impl BencodeValue {
    /// Decode one value from the front of `data`.
    ///
    /// Returns the value and the number of input bytes it consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        let mut decoder = Decoder::new(data);
        let value = decoder.parse_value()?;
        Ok((value, decoder.pos))
    }

    /// Decode a value that must span the entire input.
    pub fn parse_exact(data: &[u8]) -> Result<Self> {
        let (value, consumed) = Self::parse(data)?;
        if consumed != data.len() {
            return Err(parse_error(format!(
                "Trailing data: {} bytes",
                data.len() - consumed
            )));
        }
        Ok(value)
    }

    /// Encode to bencode bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => {
                buf.extend_from_slice(b.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(b);
            }
            Self::List(l) => {
                buf.push(b'l');
                for item in l {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(d) => {
                buf.push(b'd');
                for (k, v) in d {
                    buf.extend_from_slice(k.len().to_string().as_bytes());
                    buf.push(b':');
                    buf.extend_from_slice(k);
                    v.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    // Typed accessors

    /// Get as UTF-8 string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as non-negative integer
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as raw bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dict
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a dict entry by key
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

/// Locate the raw bytes of the `info` dictionary inside a descriptor.
///
/// The info-hash is the SHA-1 of exactly these bytes, so re-encoding the
/// parsed tree is not acceptable: a descriptor with non-canonical encoding
/// must still hash to what the swarm expects.
pub fn find_info_dict_bytes(data: &[u8]) -> Result<&[u8]> {
    // Validate the overall structure first
    let root = BencodeValue::parse_exact(data)?;
    let dict = root.as_dict().ok_or_else(|| {
        ClientError::protocol(ProtocolErrorKind::InvalidDescriptor, "Root is not a dict")
    })?;
    if !dict.contains_key(b"info".as_slice()) {
        return Err(ClientError::protocol(
            ProtocolErrorKind::InvalidDescriptor,
            "Missing 'info' key",
        ));
    }

    // Scan for the encoded key and measure the dictionary that follows it
    let needle = b"4:info";
    let mut pos = 0;
    while pos + needle.len() < data.len() {
        if data[pos..].starts_with(needle) {
            let start = pos + needle.len();
            if data[start] == b'd' {
                let (_, consumed) = BencodeValue::parse(&data[start..])?;
                return Ok(&data[start..start + consumed]);
            }
        }
        pos += 1;
    }

    Err(ClientError::protocol(
        ProtocolErrorKind::InvalidDescriptor,
        "Could not locate info dict bytes",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_integers() {
        let (v, n) = BencodeValue::parse(b"i42e").unwrap();
        assert_eq!(v, BencodeValue::Integer(42));
        assert_eq!(n, 4);

        let (v, _) = BencodeValue::parse(b"i-7e").unwrap();
        assert_eq!(v, BencodeValue::Integer(-7));

        let (v, _) = BencodeValue::parse(b"i0e").unwrap();
        assert_eq!(v, BencodeValue::Integer(0));

        assert!(BencodeValue::parse(b"i03e").is_err());
        assert!(BencodeValue::parse(b"i-0e").is_err());
        assert!(BencodeValue::parse(b"i12").is_err());
    }

    #[test]
    fn test_parse_strings() {
        let (v, _) = BencodeValue::parse(b"4:spam").unwrap();
        assert_eq!(v, BencodeValue::Bytes(b"spam".to_vec()));

        let (v, _) = BencodeValue::parse(b"0:").unwrap();
        assert_eq!(v, BencodeValue::Bytes(vec![]));

        // Binary content passes through untouched
        let (v, _) = BencodeValue::parse(b"3:\x00\xff\x7f").unwrap();
        assert_eq!(v, BencodeValue::Bytes(vec![0x00, 0xff, 0x7f]));

        // Declared length runs past the input
        assert!(BencodeValue::parse(b"9:abc").is_err());
    }

    #[test]
    fn test_parse_lists_and_dicts() {
        let (v, _) = BencodeValue::parse(b"l4:spami42ee").unwrap();
        let items = v.as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_str(), Some("spam"));
        assert_eq!(items[1].as_int(), Some(42));

        let (v, _) = BencodeValue::parse(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(v.get("cow").and_then(|v| v.as_str()), Some("moo"));
        assert_eq!(v.get("spam").and_then(|v| v.as_str()), Some("eggs"));

        assert!(BencodeValue::parse(b"le").is_ok());
        assert!(BencodeValue::parse(b"de").is_ok());
        assert!(BencodeValue::parse(b"l4:spam").is_err());
    }

    #[test]
    fn test_rejects_unsorted_dict_keys() {
        assert!(BencodeValue::parse(b"d4:spam4:eggs3:cow3:mooe").is_err());
        // Duplicate keys are also out of order by definition
        assert!(BencodeValue::parse(b"d3:cow3:moo3:cow3:bahe").is_err());
    }

    #[test]
    fn test_parse_exact_rejects_trailing_bytes() {
        assert!(BencodeValue::parse_exact(b"i42e").is_ok());
        assert!(BencodeValue::parse_exact(b"i42etrailing").is_err());
    }

    #[test]
    fn test_encode_roundtrip() {
        let original: &[u8] = b"d5:itemsli1ei2ei3ee4:name4:test5:valuei42ee";
        let value = BencodeValue::parse_exact(original).unwrap();
        assert_eq!(value.encode(), original);
    }

    #[test]
    fn test_find_info_dict_bytes() {
        let data = b"d8:announce9:http://tr4:infod6:lengthi100e4:name1:f12:piece lengthi16384eee";
        let info = find_info_dict_bytes(data).unwrap();
        assert!(info.starts_with(b"d6:length"));
        assert!(info.ends_with(b"e"));
        // The recovered slice is itself a complete dictionary
        assert!(BencodeValue::parse_exact(info).is_ok());
    }

    #[test]
    fn test_find_info_dict_requires_info_key() {
        let data = b"d8:announce9:http://tre";
        assert!(find_info_dict_bytes(data).is_err());
    }
}
