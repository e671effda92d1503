//! Row value framing.
//!
//! Stored row values carry a single leading tag byte so that scans can
//! distinguish live values from tombstones without deserializing anything:
//!
//! - `0x01` followed by the raw value bytes for a put.
//! - `0x00` alone for a tombstone.
//!
//! Commit metadata payloads are bincode-encoded `Option<Vec<u8>>` so that an
//! absent payload survives the round trip distinct from an empty one.

use serde_derive::{Deserialize, Serialize};

use crate::error::{CResult, Error};

const TAG_TOMBSTONE: u8 = 0x00;
const TAG_VALUE: u8 = 0x01;

/// Encodes a row value, `None` being the tombstone.
pub fn encode_row(value: Option<&[u8]>) -> Vec<u8> {
    match value {
        Some(value) => {
            let mut buf = Vec::with_capacity(1 + value.len());
            buf.push(TAG_VALUE);
            buf.extend_from_slice(value);
            buf
        }
        None => vec![TAG_TOMBSTONE],
    }
}

/// Decodes a row value into an owned payload, `None` for tombstones.
pub fn decode_row(bytes: &[u8]) -> CResult<Option<Vec<u8>>> {
    Ok(row_payload(bytes)?.map(|payload| payload.to_vec()))
}

/// Borrowing view of a row value's payload, `None` for tombstones.
pub fn row_payload(bytes: &[u8]) -> CResult<Option<&[u8]>> {
    match bytes.split_first() {
        Some((&TAG_VALUE, payload)) => Ok(Some(payload)),
        Some((&TAG_TOMBSTONE, [])) => Ok(None),
        Some((tag, _)) => Err(Error::InvalidEncoding(format!(
            "unknown row value tag 0x{:02x}",
            tag
        ))),
        None => Err(Error::InvalidEncoding("empty row value".to_string())),
    }
}

/// Returns whether a row value is a tombstone without copying the payload.
pub fn is_tombstone(bytes: &[u8]) -> CResult<bool> {
    Ok(row_payload(bytes)?.is_none())
}

/// A commit metadata record: the opaque payload the caller attached, if any.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitPayload {
    #[serde(with = "serde_bytes")]
    payload: Option<Vec<u8>>,
}

/// Encodes a commit metadata payload.
pub fn encode_commit_payload(payload: Option<&[u8]>) -> CResult<Vec<u8>> {
    let record = CommitPayload { payload: payload.map(|p| p.to_vec()) };
    Ok(bincode::serialize(&record)?)
}

/// Decodes a commit metadata payload.
pub fn decode_commit_payload(bytes: &[u8]) -> CResult<Option<Vec<u8>>> {
    let record: CommitPayload = bincode::deserialize(bytes)?;
    Ok(record.payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_round_trip() -> CResult<()> {
        assert_eq!(decode_row(&encode_row(Some(b"hello")))?, Some(b"hello".to_vec()));
        assert_eq!(decode_row(&encode_row(Some(b"")))?, Some(vec![]));
        assert_eq!(decode_row(&encode_row(None))?, None);
        Ok(())
    }

    #[test]
    fn tombstone_check_is_tag_only() -> CResult<()> {
        assert!(is_tombstone(&encode_row(None))?);
        assert!(!is_tombstone(&encode_row(Some(&[0x00, 0x01])))?);
        Ok(())
    }

    #[test]
    fn malformed_rows_are_rejected() {
        assert!(matches!(decode_row(&[]), Err(Error::InvalidEncoding(_))));
        assert!(matches!(decode_row(&[0x02, 0x01]), Err(Error::InvalidEncoding(_))));
        // A tombstone tag followed by payload bytes is malformed.
        assert!(matches!(decode_row(&[0x00, 0x01]), Err(Error::InvalidEncoding(_))));
    }

    #[test]
    fn commit_payload_round_trip() -> CResult<()> {
        assert_eq!(
            decode_commit_payload(&encode_commit_payload(Some(b"meta"))?)?,
            Some(b"meta".to_vec())
        );
        assert_eq!(decode_commit_payload(&encode_commit_payload(None)?)?, None);
        // Absent and empty payloads are distinct.
        assert_eq!(
            decode_commit_payload(&encode_commit_payload(Some(b""))?)?,
            Some(vec![])
        );
        Ok(())
    }
}
