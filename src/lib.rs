//! # peershare
//!
//! Exchange chat lines or a single file with one peer over a direct,
//! multiplexed connection.
//!
//! The crate implements the application protocols; moving bytes between
//! peers is the job of a [`PeerTransport`](transport::PeerTransport), which
//! only has to open a reliable, ordered, bidirectional stream for a given
//! protocol id and dispatch inbound streams to registered handlers.
//!
//! ## Quick Start
//!
//! ```no_run
//! use peershare::transfer::{FileReceiver, FileSender};
//! use peershare::transport::{stream_handler, MemoryNetwork, PeerTransport};
//! use peershare::{ProtocolId, StreamOpener};
//! use tokio::io::DuplexStream;
//!
//! # async fn demo() -> Result<(), peershare::ShareError> {
//! let net = MemoryNetwork::new();
//! let alice = net.transport("alice");
//! let bob = net.transport("bob");
//!
//! bob.set_stream_handler(
//!     ProtocolId::file_share(),
//!     stream_handler(|mut stream: DuplexStream, _peer| async move {
//!         let _ = FileReceiver::new("./received_files").receive(&mut stream).await;
//!     }),
//! );
//!
//! let mut stream = StreamOpener::default()
//!     .open(&alice, &"bob".into(), &ProtocolId::file_share())
//!     .await?;
//! FileSender::new()
//!     .send_file(&mut stream, "notes.txt".as_ref())
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Wire Format
//!
//! | Stream     | Direction           | Content                                   |
//! |------------|---------------------|-------------------------------------------|
//! | file-share | sender → receiver   | `{"name": <string>, "size": <int>}\n`     |
//! | file-share | sender → receiver   | exactly `size` raw bytes                  |
//! | file-share | receiver → sender   | `ACK\n` (or `Error: <message>\n`)         |
//! | chat       | both                | one UTF-8 line per message                |
//!
//! Lines are `\n`-terminated and flushed as soon as they are written.

pub mod chat;
pub mod codec;
pub mod frame;
pub mod net;
pub mod progress;
pub mod session;
pub mod stream;
pub mod transfer;
pub mod transport;
pub mod types;

// Re-export main types for convenience
pub use types::{
    PeerAddress, PeerEvent, ProtocolId, ShareError, TransferMetadata, ACK_TOKEN, CHAT_PROTOCOL,
    CHAT_REPLY, CHUNK_SIZE, FILE_SHARE_PROTOCOL,
};

pub use codec::LineCodec;
pub use frame::{read_line, write_line};
pub use session::{ReceiverSession, SenderShell, SessionConfig};
pub use stream::{close_stream, RetryPolicy, StreamOpener};
pub use transfer::{FileReceiver, FileSender, ProgressObserver, TransferProgress, TransferReport};
pub use transport::{PeerTransport, TcpTransport};
