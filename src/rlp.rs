//! Canonical RLP (Recursive Length Prefix) encode/decode (C1).
//!
//! Encoding follows the Ethereum yellow paper: a single byte below `0x80`
//! encodes itself; a string up to 55 bytes is `0x80+len` followed by the
//! bytes; a longer string is `0xb7+len(len)`, the big-endian length, then
//! the bytes; lists mirror strings with `0xc0`/`0xf7`. Integers are encoded
//! as their minimal big-endian byte string (I1): zero encodes as the empty
//! string, and there is never a leading `0x00` byte.
//!
//! Decoding rejects non-canonical length prefixes (a short string encoded
//! with the long-string prefix, for instance) but tolerates a leading zero
//! byte on an integer being decoded, since real peer implementations are
//! occasionally loose about this on the wire.

use crate::error::{Result, WalletError};

/// A decoded RLP item: either a byte string or a list of items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RlpItem {
    String(Vec<u8>),
    List(Vec<RlpItem>),
}

impl RlpItem {
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            RlpItem::String(b) => Ok(b),
            RlpItem::List(_) => Err(WalletError::Protocol(
                crate::error::DisconnectReason::BadProtocol,
                "expected RLP string, found list".into(),
            )),
        }
    }

    pub fn as_list(&self) -> Result<&[RlpItem]> {
        match self {
            RlpItem::List(items) => Ok(items),
            RlpItem::String(_) => Err(WalletError::Protocol(
                crate::error::DisconnectReason::BadProtocol,
                "expected RLP list, found string".into(),
            )),
        }
    }
}

/// Anything that can be rendered as a canonical RLP string or list item.
pub trait Encodable {
    fn rlp_append(&self, out: &mut Vec<RlpItem>);
}

impl Encodable for &[u8] {
    fn rlp_append(&self, out: &mut Vec<RlpItem>) {
        out.push(RlpItem::String(self.to_vec()));
    }
}

impl Encodable for Vec<u8> {
    fn rlp_append(&self, out: &mut Vec<RlpItem>) {
        out.push(RlpItem::String(self.clone()));
    }
}

impl<const N: usize> Encodable for [u8; N] {
    fn rlp_append(&self, out: &mut Vec<RlpItem>) {
        out.push(RlpItem::String(self.to_vec()));
    }
}

impl Encodable for u64 {
    fn rlp_append(&self, out: &mut Vec<RlpItem>) {
        out.push(RlpItem::String(minimal_be_bytes(&self.to_be_bytes())));
    }
}

impl Encodable for u8 {
    fn rlp_append(&self, out: &mut Vec<RlpItem>) {
        out.push(RlpItem::String(minimal_be_bytes(&self.to_be_bytes())));
    }
}

impl Encodable for alloy_primitives::U256 {
    fn rlp_append(&self, out: &mut Vec<RlpItem>) {
        out.push(RlpItem::String(minimal_be_bytes(&self.to_be_bytes::<32>())));
    }
}

impl Encodable for alloy_primitives::Address {
    fn rlp_append(&self, out: &mut Vec<RlpItem>) {
        out.push(RlpItem::String(self.0.to_vec()));
    }
}

/// Strips leading zero bytes, leaving the empty slice for a value of zero
/// (I1).
fn minimal_be_bytes(bytes: &[u8]) -> Vec<u8> {
    let first_nonzero = bytes.iter().position(|&b| b != 0);
    match first_nonzero {
        Some(i) => bytes[i..].to_vec(),
        None => Vec::new(),
    }
}

/// Helper for building a list item field-by-field, mirroring the
/// `RlpStream::begin_list`/`append` idiom common to Ethereum transaction
/// encoders.
#[derive(Default)]
pub struct RlpList {
    items: Vec<RlpItem>,
}

impl RlpList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append<T: Encodable>(&mut self, value: &T) -> &mut Self {
        value.rlp_append(&mut self.items);
        self
    }

    pub fn append_raw_string(&mut self, bytes: Vec<u8>) -> &mut Self {
        self.items.push(RlpItem::String(bytes));
        self
    }

    pub fn append_list(&mut self, inner: RlpItem) -> &mut Self {
        self.items.push(inner);
        self
    }

    pub fn finish(self) -> RlpItem {
        RlpItem::List(self.items)
    }

    pub fn encode(self) -> Vec<u8> {
        encode(&self.finish())
    }
}

/// Encodes a full RLP item tree to its canonical byte representation.
pub fn encode(item: &RlpItem) -> Vec<u8> {
    match item {
        RlpItem::String(bytes) => encode_string(bytes),
        RlpItem::List(items) => {
            let body: Vec<u8> = items.iter().flat_map(encode).collect();
            encode_length_prefix(body.len(), 0xc0, 0xf7)
                .into_iter()
                .chain(body)
                .collect()
        }
    }
}

fn encode_string(bytes: &[u8]) -> Vec<u8> {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        return vec![bytes[0]];
    }
    encode_length_prefix(bytes.len(), 0x80, 0xb7)
        .into_iter()
        .chain(bytes.iter().copied())
        .collect()
}

fn encode_length_prefix(len: usize, short_base: u8, long_base: u8) -> Vec<u8> {
    if len <= 55 {
        vec![short_base + len as u8]
    } else {
        let len_bytes = minimal_be_bytes(&(len as u64).to_be_bytes());
        let mut out = Vec::with_capacity(1 + len_bytes.len());
        out.push(long_base + len_bytes.len() as u8);
        out.extend(len_bytes);
        out
    }
}

/// Decodes exactly one RLP item from the front of `input`, returning the
/// item and the number of bytes consumed (P1).
pub fn decode(input: &[u8]) -> Result<(RlpItem, usize)> {
    if input.is_empty() {
        return Err(bad_rlp("empty input"));
    }
    let prefix = input[0];
    match prefix {
        0x00..=0x7f => Ok((RlpItem::String(vec![prefix]), 1)),
        0x80..=0xb7 => {
            let len = (prefix - 0x80) as usize;
            let body = slice(input, 1, len)?;
            if len == 1 && body[0] < 0x80 {
                return Err(bad_rlp("non-canonical single-byte string encoding"));
            }
            Ok((RlpItem::String(body.to_vec()), 1 + len))
        }
        0xb8..=0xbf => {
            let len_of_len = (prefix - 0xb7) as usize;
            let len = decode_length(input, 1, len_of_len)?;
            if len <= 55 {
                return Err(bad_rlp("long string prefix used for short string"));
            }
            let body = slice(input, 1 + len_of_len, len)?;
            Ok((RlpItem::String(body.to_vec()), 1 + len_of_len + len))
        }
        0xc0..=0xf7 => {
            let len = (prefix - 0xc0) as usize;
            let body = slice(input, 1, len)?;
            Ok((RlpItem::List(decode_list_body(body)?), 1 + len))
        }
        0xf8..=0xff => {
            let len_of_len = (prefix - 0xf7) as usize;
            let len = decode_length(input, 1, len_of_len)?;
            if len <= 55 {
                return Err(bad_rlp("long list prefix used for short list"));
            }
            let body = slice(input, 1 + len_of_len, len)?;
            Ok((RlpItem::List(decode_list_body(body)?), 1 + len_of_len + len))
        }
    }
}

fn decode_list_body(mut body: &[u8]) -> Result<Vec<RlpItem>> {
    let mut items = Vec::new();
    while !body.is_empty() {
        let (item, consumed) = decode(body)?;
        items.push(item);
        body = &body[consumed..];
    }
    Ok(items)
}

fn decode_length(input: &[u8], offset: usize, len_of_len: usize) -> Result<usize> {
    let bytes = slice(input, offset, len_of_len)?;
    if len_of_len > 0 && bytes[0] == 0 {
        return Err(bad_rlp("non-canonical length prefix (leading zero)"));
    }
    let mut len: usize = 0;
    for &b in bytes {
        len = len
            .checked_shl(8)
            .and_then(|l| l.checked_add(b as usize))
            .ok_or_else(|| bad_rlp("length overflow"))?;
    }
    Ok(len)
}

fn slice(input: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    input
        .get(offset..offset + len)
        .ok_or_else(|| bad_rlp("truncated input"))
}

fn bad_rlp(msg: &str) -> WalletError {
    WalletError::Protocol(crate::error::DisconnectReason::BadProtocol, format!("RLP: {msg}"))
}

/// Decodes a single RLP-encoded byte string, tolerating a leading zero on
/// the decode side per the component note (peers are occasionally loose
/// here even though we never emit one).
pub fn decode_u64(item: &RlpItem) -> Result<u64> {
    let bytes = item.as_bytes()?;
    if bytes.len() > 8 {
        return Err(bad_rlp("integer too large for u64"));
    }
    let mut buf = [0u8; 8];
    buf[8 - bytes.len()..].copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}

pub fn decode_u256(item: &RlpItem) -> Result<alloy_primitives::U256> {
    let bytes = item.as_bytes()?;
    if bytes.len() > 32 {
        return Err(bad_rlp("integer too large for U256"));
    }
    Ok(alloy_primitives::U256::from_be_slice(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;

    #[test]
    fn round_trips_bytes() {
        for input in [&b""[..], b"\x01", b"dog", &[0u8; 1024]] {
            let encoded = encode(&RlpItem::String(input.to_vec()));
            let (decoded, consumed) = decode(&encoded).unwrap();
            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded.as_bytes().unwrap(), input);
        }
    }

    #[test]
    fn round_trips_integers() {
        for n in [0u64, 1, 127, 128, 255, 1024, u64::MAX] {
            let mut list = RlpList::new();
            list.append(&n);
            let encoded = list.encode();
            let (item, _) = decode(&encoded).unwrap();
            let decoded = decode_u64(item.as_list().unwrap().first().unwrap()).unwrap();
            assert_eq!(decoded, n);
        }
    }

    #[test]
    fn zero_encodes_as_empty_string() {
        let mut list = RlpList::new();
        list.append(&0u64);
        assert_eq!(list.encode(), vec![0x80]);
    }

    #[test]
    fn minimal_encoding_has_no_leading_zero() {
        let encoded = encode(&RlpItem::String(minimal_be_bytes(&300u64.to_be_bytes())));
        // 300 = 0x012c -> minimal is 0x01 0x2c (2 bytes, no leading zero)
        assert_eq!(encoded, vec![0x82, 0x01, 0x2c]);
    }

    #[test]
    fn round_trips_nested_lists() {
        let mut inner = RlpList::new();
        inner.append(&1u64).append(&2u64);
        let mut outer = RlpList::new();
        outer.append(&3u64).append_list(inner.finish());
        let encoded = outer.encode();
        let (decoded, _) = decode(&encoded).unwrap();
        let items = decoded.as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(decode_u64(&items[0]).unwrap(), 3);
        assert_eq!(items[1].as_list().unwrap().len(), 2);
    }

    #[test]
    fn rejects_non_canonical_short_string() {
        // 0x81 0x01 encodes the single byte 0x01 with the long form; canonical
        // RLP must use the single byte 0x01 directly.
        let bad = vec![0x81, 0x01];
        assert!(decode(&bad).is_err());
    }

    #[test]
    fn round_trips_u256() {
        let value = U256::from(123456789u64);
        let mut list = RlpList::new();
        list.append(&value);
        let encoded = list.encode();
        let (item, _) = decode(&encoded).unwrap();
        let decoded = decode_u256(item.as_list().unwrap().first().unwrap()).unwrap();
        assert_eq!(decoded, value);
    }
}
