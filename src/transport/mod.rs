//! Peer transport: the networking layer the protocols run on.
//!
//! The core only needs "open a reliable ordered byte stream to peer P for
//! protocol X" and "call me when a stream for protocol X arrives". Two
//! implementations ship with the crate:
//!
//! - [`tcp::TcpTransport`]: one TCP connection per logical stream
//! - [`memory::MemoryTransport`]: in-process peers over `tokio::io::duplex`

pub mod memory;
pub mod tcp;

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, PoisonError, RwLock};

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;

use crate::types::{PeerAddress, PeerEvent, ProtocolId};

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::TcpTransport;

/// Handler invoked once per accepted stream, with the remote peer's address
pub type StreamHandler<S> = Arc<dyn Fn(S, PeerAddress) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async function as a [`StreamHandler`].
pub fn stream_handler<S, F, Fut>(f: F) -> StreamHandler<S>
where
    F: Fn(S, PeerAddress) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |stream, peer| Box::pin(f(stream, peer)))
}

/// Peer-addressed, stream-multiplexing transport.
pub trait PeerTransport: Send + Sync + 'static {
    /// Bidirectional byte stream bound to one protocol and one peer
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Addresses other peers can dial to reach this one.
    fn addresses(&self) -> Vec<PeerAddress>;

    /// Establish a connection to `peer`; on success both sides observe
    /// [`PeerEvent::Connected`].
    fn connect(&self, peer: &PeerAddress) -> impl Future<Output = io::Result<()>> + Send;

    /// Open a new logical stream to `peer` for `protocol`.
    fn open_stream(
        &self,
        peer: &PeerAddress,
        protocol: &ProtocolId,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;

    /// Register the handler for inbound streams of `protocol`, replacing any
    /// previous one.
    fn set_stream_handler(&self, protocol: ProtocolId, handler: StreamHandler<Self::Stream>);

    /// Subscribe to connect/disconnect notifications.
    fn subscribe(&self) -> broadcast::Receiver<PeerEvent>;

    /// Stop accepting streams and drop peer connections. Idempotent.
    fn close(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Protocol id → handler table shared between a transport and its accept loop
pub struct HandlerRegistry<S> {
    handlers: RwLock<HashMap<ProtocolId, StreamHandler<S>>>,
}

impl<S> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, protocol: ProtocolId, handler: StreamHandler<S>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol, handler);
    }

    pub fn get(&self, protocol: &ProtocolId) -> Option<StreamHandler<S>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(protocol)
            .cloned()
    }
}

impl<S> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Capacity of each transport's event channel
pub(crate) const EVENT_CAPACITY: usize = 16;
