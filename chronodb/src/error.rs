use serde_derive::{Deserialize, Serialize};

/// A ChronoDB result returning the crate-wide Error type.
pub type CResult<T> = std::result::Result<T, Error>;

/// ChronoDB errors. Errors are divided into caller mistakes (rejected at the
/// API boundary), addressing errors, refused operations, and invariant
/// violations that indicate a bug in the store itself.
///
/// An absent value is `None`, never an error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// A malformed caller argument: empty or reserved names, NUL bytes,
    /// out-of-range timestamps.
    InvalidArgument(String),

    /// The named branch does not exist.
    BranchUnknown(String),

    /// The named secondary index does not exist.
    IndexUnknown(String),

    /// The index has writes not reflected in its documents; it must be
    /// rebuilt before it can be queried.
    IndexDirty(String),

    /// No chunk on the branch covers the requested timestamp.
    ChunkMissing(String),

    /// A write was attempted against a sealed chunk.
    ChunkSealed(String),

    /// A write carried a timestamp at or below data already committed to the
    /// head chunk.
    TimestampPrecedesHead(String),

    /// ensure_closed() was called while transactions on the handle are still
    /// live; the caller sequenced its shutdown wrong.
    HandleBusy(String),

    /// The branch cannot allocate a further commit timestamp.
    BranchStalled(String),

    /// Base data was committed durably but the index writer failed; the
    /// affected indices are marked dirty and must be rebuilt.
    IndexWriteFailed(String),

    /// A temporal key failed to decode: wrong separator count or a truncated
    /// timestamp.
    InvalidEncoding(String),

    /// An I/O or storage-backend failure, wrapped.
    Storage(String),

    /// A serialization or deserialization failure.
    Serialization(String),

    /// An internal invariant was violated. These are bugs.
    Internal(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(s) => write!(f, "invalid argument: {}", s),
            Error::BranchUnknown(s) => write!(f, "unknown branch: {}", s),
            Error::IndexUnknown(s) => write!(f, "unknown index: {}", s),
            Error::IndexDirty(s) => write!(f, "index is dirty and must be rebuilt: {}", s),
            Error::ChunkMissing(s) => write!(f, "no chunk covers the timestamp: {}", s),
            Error::ChunkSealed(s) => write!(f, "chunk is sealed: {}", s),
            Error::TimestampPrecedesHead(s) => {
                write!(f, "timestamp precedes the head chunk: {}", s)
            }
            Error::HandleBusy(s) => write!(f, "handle has live transactions: {}", s),
            Error::BranchStalled(s) => write!(f, "branch is stalled: {}", s),
            Error::IndexWriteFailed(s) => write!(f, "index write failed: {}", s),
            Error::InvalidEncoding(s) => write!(f, "invalid temporal key encoding: {}", s),
            Error::Storage(s) => write!(f, "storage error: {}", s),
            Error::Serialization(s) => write!(f, "serialization error: {}", s),
            Error::Internal(s) => write!(f, "internal error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::InvalidEncoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_wrap_as_storage() {
        let err: Error =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert_eq!(err, Error::Storage("denied".to_string()));
    }

    #[test]
    fn display_names_the_kind() {
        let err = Error::BranchUnknown("feature-x".to_string());
        assert_eq!(err.to_string(), "unknown branch: feature-x");
    }
}
