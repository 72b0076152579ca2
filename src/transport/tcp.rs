//! TCP implementation of [`PeerTransport`].
//!
//! Every logical stream is its own TCP connection. The dialer opens with the
//! protocol id as one line; the listener echoes it back if a handler is
//! registered, or answers `na` and hangs up. After that the connection is a
//! raw byte stream owned by the handler.
//!
//! `connect` additionally opens a long-lived control connection carrying the
//! dialer's own listen address. It is how a listening peer learns where to
//! dial back, and its end is the disconnect notification for both sides.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{HandlerRegistry, PeerTransport, StreamHandler, EVENT_CAPACITY};
use crate::codec::LineCodec;
use crate::types::{PeerAddress, PeerEvent, ProtocolId, LINE_DELIMITER};

/// Protocol id of the connection-tracking control channel
pub const CONTROL_PROTOCOL: &str = "/peershare/control/1.0.0";

/// Negotiation answer for an unsupported protocol
const NOT_AVAILABLE: &str = "na";

const MAX_NEGOTIATION_LEN: usize = 1024;

struct Inner {
    local_addr: SocketAddr,
    advertised: PeerAddress,
    handlers: HandlerRegistry<TcpStream>,
    events: broadcast::Sender<PeerEvent>,
    shutdown: CancellationToken,
}

/// Peer transport over plain TCP
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

impl TcpTransport {
    /// Bind to `addr` and start accepting inbound streams.
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let advertised = advertised_addr(local_addr, Ipv4Addr::LOCALHOST.into());
        info!("peershare transport bound to {}", local_addr);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            local_addr,
            advertised: PeerAddress::new(advertised.to_string()),
            handlers: HandlerRegistry::new(),
            events,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::accept_loop(listener, inner.clone()));
        Ok(Self { inner })
    }

    /// Get the local address this transport is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    async fn accept_loop(listener: TcpListener, inner: Arc<Inner>) {
        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, remote)) => {
                        debug!("new connection from {}", remote);
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_inbound(inner, socket, remote).await {
                                warn!("inbound connection from {} failed: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                },
            }
        }
        debug!("accept loop on {} stopped", inner.local_addr);
    }

    async fn handle_inbound(
        inner: Arc<Inner>,
        mut socket: TcpStream,
        remote: SocketAddr,
    ) -> io::Result<()> {
        socket.set_nodelay(true)?;
        let protocol = read_negotiation(&mut socket).await?;

        if protocol == CONTROL_PROTOCOL {
            write_negotiation(&mut socket, CONTROL_PROTOCOL).await?;
            let mut framed = Framed::new(socket, LineCodec::new());
            let peer = match framed.next().await {
                Some(Ok(addr)) => PeerAddress::new(addr),
                Some(Err(e)) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
                }
                None => return Ok(()),
            };
            info!("connected to: {}", peer);
            let _ = inner.events.send(PeerEvent::Connected(peer.clone()));
            watch_control(framed, peer, inner.events.clone(), inner.shutdown.clone()).await;
            return Ok(());
        }

        let protocol = ProtocolId::new(protocol);
        match inner.handlers.get(&protocol) {
            Some(handler) => {
                write_negotiation(&mut socket, protocol.as_str()).await?;
                debug!(%protocol, "accepted stream from {}", remote);
                handler(socket, PeerAddress::new(remote.to_string())).await;
            }
            None => {
                debug!(%protocol, "refusing stream from {}: no handler", remote);
                write_negotiation(&mut socket, NOT_AVAILABLE).await?;
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> io::Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        Ok(())
    }

    async fn dial(&self, peer: &PeerAddress, protocol: &str) -> io::Result<TcpStream> {
        self.ensure_open()?;
        let mut socket = TcpStream::connect(peer.as_str()).await?;
        socket.set_nodelay(true)?;
        write_negotiation(&mut socket, protocol).await?;
        let reply = read_negotiation(&mut socket).await?;
        if reply != protocol {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("{} does not speak {}", peer, protocol),
            ));
        }
        Ok(socket)
    }
}

impl PeerTransport for TcpTransport {
    type Stream = TcpStream;

    fn addresses(&self) -> Vec<PeerAddress> {
        vec![self.inner.advertised.clone()]
    }

    async fn connect(&self, peer: &PeerAddress) -> io::Result<()> {
        let socket = self.dial(peer, CONTROL_PROTOCOL).await?;
        // The interface that reaches the peer is the one it can dial back.
        let dial_back = advertised_addr(self.inner.local_addr, socket.local_addr()?.ip());
        let mut framed = Framed::new(socket, LineCodec::new());
        framed
            .send(dial_back.to_string())
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;

        info!("connected to: {}", peer);
        let _ = self.inner.events.send(PeerEvent::Connected(peer.clone()));
        tokio::spawn(watch_control(
            framed,
            peer.clone(),
            self.inner.events.clone(),
            self.inner.shutdown.clone(),
        ));
        Ok(())
    }

    async fn open_stream(
        &self,
        peer: &PeerAddress,
        protocol: &ProtocolId,
    ) -> io::Result<TcpStream> {
        let socket = self.dial(peer, protocol.as_str()).await?;
        debug!(%protocol, "opened stream to {}", peer);
        Ok(socket)
    }

    fn set_stream_handler(&self, protocol: ProtocolId, handler: StreamHandler<TcpStream>) {
        self.inner.handlers.insert(protocol, handler);
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    async fn close(&self) -> io::Result<()> {
        if !self.inner.shutdown.is_cancelled() {
            info!("closing transport on {}", self.inner.local_addr);
            self.inner.shutdown.cancel();
        }
        Ok(())
    }
}

/// Address a peer should dial: `listen` itself, or `route_ip` with the
/// listen port when bound to a wildcard address.
fn advertised_addr(listen: SocketAddr, route_ip: IpAddr) -> SocketAddr {
    if listen.ip().is_unspecified() {
        SocketAddr::new(route_ip, listen.port())
    } else {
        listen
    }
}

/// Hold a control connection until either side goes away.
async fn watch_control(
    mut framed: Framed<TcpStream, LineCodec>,
    peer: PeerAddress,
    events: broadcast::Sender<PeerEvent>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = framed.next() => match next {
                Some(Ok(line)) => debug!("control message from {}: {}", peer, line),
                Some(Err(e)) => {
                    warn!("control connection to {} failed: {}", peer, e);
                    break;
                }
                None => break,
            },
        }
    }
    info!("disconnected from: {}", peer);
    let _ = events.send(PeerEvent::Disconnected(peer));
}

/// Read one negotiation line byte by byte so no stream payload is buffered.
async fn read_negotiation<S>(socket: &mut S) -> io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = socket.read_u8().await?;
        if byte == LINE_DELIMITER {
            break;
        }
        if line.len() >= MAX_NEGOTIATION_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "negotiation line too long"));
        }
        line.push(byte);
    }
    String::from_utf8(line).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidData, "negotiation line is not UTF-8")
    })
}

async fn write_negotiation<S>(socket: &mut S, line: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(LINE_DELIMITER);
    socket.write_all(&buf).await?;
    socket.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_line, write_line};
    use crate::transport::stream_handler;
    use std::time::Duration;
    use tokio::io::BufReader;
    use tokio::time::timeout;

    #[tokio::test]
    async fn negotiation_reads_exactly_one_line() {
        let data: &[u8] = b"/peershare/chat/1.0.0\npayload";
        let mut reader = data;
        assert_eq!(read_negotiation(&mut reader).await.unwrap(), "/peershare/chat/1.0.0");
        assert_eq!(reader, b"payload");
    }

    #[tokio::test]
    async fn streams_reach_registered_handler() {
        let server = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let client = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        server.set_stream_handler(
            ProtocolId::chat(),
            stream_handler(|stream: TcpStream, _peer| async move {
                let mut io = BufReader::new(stream);
                let line = read_line(&mut io).await.unwrap();
                write_line(&mut io, &line.to_uppercase()).await.unwrap();
            }),
        );

        let addr = server.addresses().remove(0);
        let stream = client.open_stream(&addr, &ProtocolId::chat()).await.unwrap();
        let mut io = BufReader::new(stream);
        write_line(&mut io, "ping").await.unwrap();
        assert_eq!(read_line(&mut io).await.unwrap(), "PING");

        let err = client
            .open_stream(&addr, &ProtocolId::file_share())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn control_channel_reports_connect_and_disconnect() {
        let listener = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let dialer = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let mut events = listener.subscribe();

        dialer.connect(&listener.addresses()[0]).await.unwrap();
        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(event, PeerEvent::Connected(dialer.addresses()[0].clone()));

        dialer.close().await.unwrap();
        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert_eq!(event, PeerEvent::Disconnected(dialer.addresses()[0].clone()));
    }

    #[tokio::test]
    async fn closed_transport_refuses_to_dial() {
        let a = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let b = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        a.close().await.unwrap();
        a.close().await.unwrap();
        let err = a
            .open_stream(&b.addresses()[0], &ProtocolId::chat())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[test]
    fn wildcard_bind_advertises_route_ip() {
        let route: IpAddr = "10.1.2.3".parse().unwrap();
        let wildcard: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(advertised_addr(wildcard, route), "10.1.2.3:4000".parse().unwrap());

        let bound: SocketAddr = "192.168.1.5:4000".parse().unwrap();
        assert_eq!(advertised_addr(bound, route), bound);
    }

    #[tokio::test]
    async fn wildcard_dialer_sends_reachable_address() {
        let listener = TcpTransport::bind("127.0.0.1:0").await.unwrap();
        let dialer = TcpTransport::bind("0.0.0.0:0").await.unwrap();
        let mut events = listener.subscribe();

        dialer.connect(&listener.addresses()[0]).await.unwrap();
        let event = timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        let expected = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), dialer.local_addr().port());
        assert_eq!(event, PeerEvent::Connected(PeerAddress::new(expected.to_string())));
        dialer.close().await.unwrap();
    }
}
