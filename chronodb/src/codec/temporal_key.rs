//! The order-preserving temporal key encoding.
//!
//! A temporal key maps the triple `(keyspace, key, t)` onto a single byte
//! string:
//!
//! - Keyspace as raw bytes.
//! - A 0x00 separator.
//! - Key as raw bytes.
//! - A 0x00 separator.
//! - The timestamp as exactly 8 bytes, big-endian, unsigned.
//!
//! Lexicographic comparison of two encoded keys equals the tuple order
//! `(keyspace, key, t)`: the separator sorts below every byte allowed in
//! keyspaces and keys, and the fixed-width big-endian timestamp sorts
//! numerically. An ordered scan over `[encode(ks, k, 0), encode(ks, k, T)]`
//! therefore yields exactly the versions of `k` up to `T` in ascending order,
//! and an ordered-predecessor lookup on `encode(ks, k, T)` lands on the live
//! version at `T`. Comparisons run on the raw bytes; nothing is decoded.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

use crate::error::{CResult, Error};
use crate::{Timestamp, TIMESTAMP_MAX};

/// The separator between the keyspace, key, and timestamp sections.
const SEPARATOR: u8 = 0x00;

/// The encoded timestamp width in bytes.
pub const TIMESTAMP_WIDTH: usize = 8;

/// A decoded temporal key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemporalKey {
    pub keyspace: String,
    pub key: String,
    pub t: Timestamp,
}

/// Encodes `(keyspace, key, t)` into its order-preserving byte form.
///
/// Keyspaces and keys must not contain NUL bytes (they would break the
/// ordering guarantee), and the timestamp must not exceed the 63-bit range.
pub fn encode(keyspace: &str, key: &str, t: Timestamp) -> CResult<Vec<u8>> {
    validate_component(keyspace, "keyspace")?;
    validate_component(key, "key")?;
    if t > TIMESTAMP_MAX {
        return Err(Error::InvalidArgument(format!(
            "timestamp {} exceeds the 63-bit range",
            t
        )));
    }

    let mut buf =
        BytesMut::with_capacity(keyspace.len() + key.len() + 2 + TIMESTAMP_WIDTH);
    buf.put(keyspace.as_bytes());
    buf.put_u8(SEPARATOR);
    buf.put(key.as_bytes());
    buf.put_u8(SEPARATOR);
    buf.put_u64(t);
    Ok(buf.to_vec())
}

/// Decodes a temporal key, recovering the exact `(keyspace, key, t)` triple.
pub fn decode(bytes: &[u8]) -> CResult<TemporalKey> {
    if bytes.len() < 2 + TIMESTAMP_WIDTH {
        return Err(Error::InvalidEncoding(format!(
            "temporal key is {} bytes, shorter than the minimal frame",
            bytes.len()
        )));
    }
    let (body, ts_bytes) = bytes.split_at(bytes.len() - TIMESTAMP_WIDTH);

    // The body must be keyspace ‖ 0x00 ‖ key ‖ 0x00 with exactly two
    // separators, the second of them trailing.
    let mut separators = body.iter().enumerate().filter(|(_, b)| **b == SEPARATOR);
    let first = separators.next().map(|(i, _)| i);
    let second = separators.next().map(|(i, _)| i);
    let extra = separators.next();
    match (first, second, extra) {
        (Some(ks_end), Some(key_end), None) if key_end == body.len() - 1 => {
            let keyspace = String::from_utf8(body[..ks_end].to_vec())?;
            let key = String::from_utf8(body[ks_end + 1..key_end].to_vec())?;
            let mut cursor = Cursor::new(ts_bytes);
            let t = cursor
                .read_u64::<BigEndian>()
                .map_err(|err| Error::InvalidEncoding(err.to_string()))?;
            if t > TIMESTAMP_MAX {
                return Err(Error::InvalidEncoding(format!(
                    "decoded timestamp {} exceeds the 63-bit range",
                    t
                )));
            }
            Ok(TemporalKey { keyspace, key, t })
        }
        _ => Err(Error::InvalidEncoding(format!(
            "expected 2 separators framing the key, found a different shape in {} body bytes",
            body.len()
        ))),
    }
}

/// Returns the byte prefix shared by every version of `(keyspace, key)`,
/// i.e. the encoded key up to and including the second separator.
pub fn key_prefix(keyspace: &str, key: &str) -> CResult<Vec<u8>> {
    validate_component(keyspace, "keyspace")?;
    validate_component(key, "key")?;
    let mut buf = BytesMut::with_capacity(keyspace.len() + key.len() + 2);
    buf.put(keyspace.as_bytes());
    buf.put_u8(SEPARATOR);
    buf.put(key.as_bytes());
    buf.put_u8(SEPARATOR);
    Ok(buf.to_vec())
}

/// Returns the inclusive encoded bounds covering the versions of
/// `(keyspace, key)` within `[lo, hi]`.
pub fn version_bounds(
    keyspace: &str,
    key: &str,
    lo: Timestamp,
    hi: Timestamp,
) -> CResult<(Vec<u8>, Vec<u8>)> {
    Ok((encode(keyspace, key, lo)?, encode(keyspace, key, hi)?))
}

fn validate_component(component: &str, what: &str) -> CResult<()> {
    if component.as_bytes().contains(&SEPARATOR) {
        return Err(Error::InvalidArgument(format!(
            "{} must not contain NUL bytes",
            what
        )));
    }
    Ok(())
}
