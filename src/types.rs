//! Core types, protocol constants and errors for peershare

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol id carried by chat streams
pub const CHAT_PROTOCOL: &str = "/peershare/chat/1.0.0";

/// Protocol id carried by file-share streams
pub const FILE_SHARE_PROTOCOL: &str = "/peershare/file-share/1.0.0";

/// Default number of raw payload bytes moved per read/write
pub const CHUNK_SIZE: usize = 4096;

/// Acknowledgement token sent by the receiver once the full payload is on disk
pub const ACK_TOKEN: &str = "ACK";

/// Fixed reply to every chat message
pub const CHAT_REPLY: &str = "CODE:400";

/// Prefix of a best-effort fault report written back to the peer
pub const ERROR_PREFIX: &str = "Error: ";

/// Line delimiter for every framed message
pub const LINE_DELIMITER: u8 = b'\n';

/// Longest framed line accepted before the reader gives up
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// Handshake header describing the file that follows on a file-share stream.
///
/// `size` is the exact number of raw bytes that follow the header line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub name: String,
    pub size: u64,
}

/// Identifies which application protocol a stream carries
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(String);

impl ProtocolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn chat() -> Self {
        Self::new(CHAT_PROTOCOL)
    }

    pub fn file_share() -> Self {
        Self::new(FILE_SHARE_PROTOCOL)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProtocolId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Opaque dialable address of a remote peer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddress {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

impl From<String> for PeerAddress {
    fn from(addr: String) -> Self {
        Self(addr)
    }
}

/// Connection notifications published by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Connected(PeerAddress),
    Disconnected(PeerAddress),
}

/// Error types for peershare operations
#[derive(Debug, Error)]
pub enum ShareError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("cannot connect to {peer}: {source}")]
    Connect {
        peer: PeerAddress,
        #[source]
        source: io::Error,
    },

    #[error("error opening {protocol} stream after {attempts} attempts: {source}")]
    StreamOpen {
        protocol: ProtocolId,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("error closing stream: {0}")]
    StreamClose(#[source] io::Error),

    #[error("protocol error: {0}")]
    ProtocolFraming(String),

    #[error("truncated transfer: expected {expected} bytes, got {received}")]
    TruncatedTransfer { expected: u64, received: u64 },

    #[error("peer reported: {0}")]
    Remote(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
