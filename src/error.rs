//! Typed error taxonomy (spec §7). Each component raises its own variant set;
//! [`Error`] unifies them for call sites that cross component boundaries.

use thiserror::Error;

/// TCP connect/bind/accept failure. Retried at a higher level; never fatal to the process
/// except for an unrecoverable bind failure on the listening socket.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect to {addr} timed out after {timeout_secs}s")]
    Timeout { addr: String, timeout_secs: u64 },
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error while connecting to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Length/id disagreement, short read, or unknown message id. Tears down the offending
/// session only; other sessions are unaffected.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("message {expected:?} exceeds its declared field width ({len} bytes)")]
    EncodeError { expected: &'static str, len: usize },
    #[error("expected message kind {expected}, got id {actual}")]
    WrongMessageKind { expected: &'static str, actual: u8 },
    #[error("frame length {declared} is inconsistent with {reason}")]
    InvalidFrame { declared: u32, reason: &'static str },
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
    #[error("connection closed mid-frame")]
    Eof,
    #[error("io error while framing: {0}")]
    Io(#[from] std::io::Error),
}

/// Handshake mismatch, or an unexpected PIECE index/offset. Same blast radius as
/// [`FrameError`]: the offending session is torn down, nothing else is affected.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("handshake info_hash mismatch")]
    InfoHashMismatch,
    #[error("handshake protocol string mismatch")]
    BadProtocolString,
    #[error("peer replied with a bad response: {0}")]
    BadPeerResponse(String),
    #[error("info_hash {0} is not being served by this peer")]
    UnknownUpload(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A piece's SHA-1 did not match its expected hash. The piece is reset to all-EMPTY and the
/// supplying peer is excluded for that piece's retry.
#[derive(Debug, Error)]
#[error("piece {piece_index} failed integrity check")]
pub struct IntegrityError {
    pub piece_index: usize,
}

/// Missing info_hash, or I/O on the JSON shard. Surfaced to the RPC caller as `ERROR: ...`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("torrent {0} not found in the tracker")]
    NotFound(String),
    #[error("tracker shard io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("tracker shard is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// RPC to a Chord neighbour timed out or failed. Swallowed by the caller; the next
/// stabilise tick will retry.
#[derive(Debug, Error)]
pub enum RingError {
    #[error("rpc to chord neighbour {addr} failed: {source}")]
    Rpc {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("rpc to {addr} returned a malformed response: {0}")]
    MalformedResponse(String, #[source] serde_json::Error),
}

/// Bad operator input. Printed to the operator; the calling loop continues.
#[derive(Debug, Error)]
#[error("usage error: {0}")]
pub struct UsageError(pub String);

/// Crate-wide error, for call sites that need to cross component boundaries.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("metainfo error: {0}")]
    Metainfo(String),
}

pub type Result<T> = std::result::Result<T, Error>;
