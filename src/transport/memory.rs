//! In-process transport: peers on a shared [`MemoryNetwork`] exchange
//! `tokio::io::duplex` streams instead of sockets.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::DuplexStream;
use tokio::sync::broadcast;
use tracing::debug;

use super::{HandlerRegistry, PeerTransport, StreamHandler, EVENT_CAPACITY};
use crate::types::{PeerAddress, PeerEvent, ProtocolId};

const DEFAULT_BUFFER: usize = 64 * 1024;

struct PeerState {
    addr: PeerAddress,
    handlers: HandlerRegistry<DuplexStream>,
    events: broadcast::Sender<PeerEvent>,
    connections: Mutex<HashSet<PeerAddress>>,
    closed: AtomicBool,
    failing_opens: AtomicU32,
}

/// Shared medium connecting [`MemoryTransport`]s by address
pub struct MemoryNetwork {
    peers: Mutex<HashMap<PeerAddress, Arc<PeerState>>>,
    buffer_size: usize,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Self::with_buffer_size(DEFAULT_BUFFER)
    }

    /// Streams created on this network buffer at most `buffer_size` bytes
    /// per direction before writers wait.
    pub fn with_buffer_size(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            peers: Mutex::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
        })
    }

    /// Attach a new peer reachable at `addr`.
    pub fn transport(self: &Arc<Self>, addr: impl Into<PeerAddress>) -> MemoryTransport {
        let addr = addr.into();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = Arc::new(PeerState {
            addr: addr.clone(),
            handlers: HandlerRegistry::new(),
            events,
            connections: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            failing_opens: AtomicU32::new(0),
        });
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr, state.clone());
        MemoryTransport {
            state,
            network: self.clone(),
        }
    }

    fn lookup(&self, addr: &PeerAddress) -> io::Result<Arc<PeerState>> {
        let peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        match peers.get(addr) {
            Some(state) if !state.closed.load(Ordering::SeqCst) => Ok(state.clone()),
            _ => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no peer at {}", addr),
            )),
        }
    }
}

/// One peer on a [`MemoryNetwork`]
pub struct MemoryTransport {
    state: Arc<PeerState>,
    network: Arc<MemoryNetwork>,
}

impl MemoryTransport {
    /// Make the next `n` calls to `open_stream` fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.state.failing_opens.store(n, Ordering::SeqCst);
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        Ok(())
    }
}

impl PeerTransport for MemoryTransport {
    type Stream = DuplexStream;

    fn addresses(&self) -> Vec<PeerAddress> {
        vec![self.state.addr.clone()]
    }

    async fn connect(&self, peer: &PeerAddress) -> io::Result<()> {
        self.ensure_open()?;
        let remote = self.network.lookup(peer)?;
        self.state
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.clone());
        remote
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.state.addr.clone());

        let _ = self.state.events.send(PeerEvent::Connected(peer.clone()));
        let _ = remote.events.send(PeerEvent::Connected(self.state.addr.clone()));
        debug!(local = %self.state.addr, remote = %peer, "memory peers connected");
        Ok(())
    }

    async fn open_stream(
        &self,
        peer: &PeerAddress,
        protocol: &ProtocolId,
    ) -> io::Result<DuplexStream> {
        self.ensure_open()?;
        let injected = self
            .state
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "injected open failure"));
        }

        let remote = self.network.lookup(peer)?;
        let handler = remote.handlers.get(protocol).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} does not speak {}", peer, protocol),
            )
        })?;

        let (local, remote_end) = tokio::io::duplex(self.network.buffer_size);
        tokio::spawn(handler(remote_end, self.state.addr.clone()));
        debug!(local = %self.state.addr, remote = %peer, %protocol, "opened memory stream");
        Ok(local)
    }

    fn set_stream_handler(&self, protocol: ProtocolId, handler: StreamHandler<DuplexStream>) {
        self.state.handlers.insert(protocol, handler);
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.state.events.subscribe()
    }

    async fn close(&self) -> io::Result<()> {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let peers: Vec<PeerAddress> = self
            .state
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();

        for peer in peers {
            let remote = self
                .network
                .peers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&peer)
                .cloned();
            if let Some(remote) = remote {
                remote
                    .connections
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&self.state.addr);
                let _ = remote.events.send(PeerEvent::Disconnected(self.state.addr.clone()));
            }
            let _ = self.state.events.send(PeerEvent::Disconnected(peer));
        }
        debug!(local = %self.state.addr, "memory transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_line, write_line};
    use crate::transport::stream_handler;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn dispatches_to_remote_handler() {
        let net = MemoryNetwork::new();
        let a = net.transport("a");
        let b = net.transport("b");

        b.set_stream_handler(
            ProtocolId::chat(),
            stream_handler(|stream: DuplexStream, peer: PeerAddress| async move {
                let mut io = BufReader::new(stream);
                let line = read_line(&mut io).await.unwrap();
                write_line(&mut io, &format!("{} from {}", line, peer)).await.unwrap();
            }),
        );

        let stream = a.open_stream(&"b".into(), &ProtocolId::chat()).await.unwrap();
        let mut io = BufReader::new(stream);
        write_line(&mut io, "hi").await.unwrap();
        assert_eq!(read_line(&mut io).await.unwrap(), "hi from a");
    }

    #[tokio::test]
    async fn unknown_protocol_or_peer_is_refused() {
        let net = MemoryNetwork::new();
        let a = net.transport("a");
        let _b = net.transport("b");

        let err = a.open_stream(&"b".into(), &ProtocolId::chat()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        let err = a.open_stream(&"zz".into(), &ProtocolId::chat()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn connect_and_close_notify_both_sides() {
        let net = MemoryNetwork::new();
        let a = net.transport("a");
        let b = net.transport("b");
        let mut a_events = a.subscribe();
        let mut b_events = b.subscribe();

        a.connect(&"b".into()).await.unwrap();
        assert_eq!(a_events.recv().await.unwrap(), PeerEvent::Connected("b".into()));
        assert_eq!(b_events.recv().await.unwrap(), PeerEvent::Connected("a".into()));

        a.close().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(b_events.recv().await.unwrap(), PeerEvent::Disconnected("a".into()));
        assert!(b.open_stream(&"a".into(), &ProtocolId::chat()).await.is_err());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let net = MemoryNetwork::new();
        let a = net.transport("a");
        let b = net.transport("b");
        b.set_stream_handler(ProtocolId::chat(), stream_handler(|_, _| async {}));

        a.fail_next_opens(2);
        for _ in 0..2 {
            let err = a.open_stream(&"b".into(), &ProtocolId::chat()).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        }
        assert!(a.open_stream(&"b".into(), &ProtocolId::chat()).await.is_ok());
    }
}
