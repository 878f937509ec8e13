use std::io;

use thiserror::Error;

/// Failures while translating between a `Message` and its wire form
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too small for DNS header ({0} bytes)")]
    ShortHeader(usize),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("too many compression pointers while reading name at offset {0}")]
    PointerLoop(usize),

    #[error("reserved label type in length byte {0:#04x}")]
    ReservedLabelType(u8),

    #[error("malformed domain name: {0}")]
    InvalidName(String),

    #[error("label too long: {0}")]
    LabelTooLong(String),

    #[error("unsupported opcode {0}")]
    UnknownOpcode(u8),

    #[error("unsupported response code {0}")]
    UnknownResponseCode(u8),

    #[error("section has {0} entries, more than a u16 count can hold")]
    TooManyEntries(usize),
}

/// Failures of a single upstream round-trip
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("failed to bind upstream socket: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to send to upstream: {0}")]
    Send(#[source] io::Error),

    #[error("failed to receive from upstream: {0}")]
    Recv(#[source] io::Error),

    #[error("no reply from upstream within {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed snapshot: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),
}
