//! Receiving side: connects to the sender, serves chat and file-share
//! streams concurrently, and shuts down on a signal or when the sender goes
//! away.

use std::future::Future;
use std::io;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{error, info};

use super::{wait_for_disconnect, SessionConfig};
use crate::chat::serve_chat;
use crate::stream::close_stream;
use crate::transfer::FileReceiver;
use crate::transport::{stream_handler, PeerTransport};
use crate::types::{PeerAddress, PeerEvent, ProtocolId, ShareError};

/// Receiving-side session
pub struct ReceiverSession<T: PeerTransport> {
    transport: Arc<T>,
    config: Arc<SessionConfig>,
    events: broadcast::Receiver<PeerEvent>,
}

impl<T: PeerTransport> ReceiverSession<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let events = transport.subscribe();
        Self {
            transport: Arc::new(transport),
            config: Arc::new(config),
            events,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Register handlers, then connect to the sender.
    pub async fn start(&self, sender: &PeerAddress) -> Result<(), ShareError> {
        self.register_handlers();
        self.connect(sender).await
    }

    pub async fn connect(&self, sender: &PeerAddress) -> Result<(), ShareError> {
        self.transport
            .connect(sender)
            .await
            .map_err(|source| ShareError::Connect {
                peer: sender.clone(),
                source,
            })
    }

    /// Install the chat and file-share stream handlers.
    pub fn register_handlers(&self) {
        self.transport.set_stream_handler(
            ProtocolId::chat(),
            stream_handler(|mut stream: T::Stream, peer: PeerAddress| async move {
                info!("new chat stream with {}", peer);
                if let Err(e) = serve_chat(&mut stream, &peer).await {
                    error!("chat stream with {} failed: {}", peer, e);
                }
                if let Err(e) = close_stream(&mut stream).await {
                    error!("chat stream with {}: {}", peer, e);
                }
                info!("closed chat stream with {}", peer);
            }),
        );

        let config = self.config.clone();
        self.transport.set_stream_handler(
            ProtocolId::file_share(),
            stream_handler(move |mut stream: T::Stream, peer: PeerAddress| {
                let config = config.clone();
                async move {
                    info!("new file share stream with {}", peer);
                    let receiver = FileReceiver::new(&config.download_dir)
                        .with_chunk_size(config.chunk_size)
                        .with_observer(config.receiving_observer());
                    match receiver.receive(&mut stream).await {
                        Ok(report) => info!(
                            "stored {} ({} bytes) from {} in {:?}",
                            report.metadata.name, report.metadata.size, peer, report.elapsed
                        ),
                        Err(e) => error!("file share with {} failed: {}", peer, e),
                    }
                    if let Err(e) = close_stream(&mut stream).await {
                        error!("file share stream with {}: {}", peer, e);
                    }
                    info!("closed file share stream with {}", peer);
                }
            }),
        );
    }

    /// Serve until `shutdown` resolves or a peer disconnects, then close the
    /// transport. In-flight handlers observe the closure through their own
    /// I/O errors.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<(), ShareError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = shutdown => info!("received shutdown signal, closing..."),
            peer = wait_for_disconnect(&mut self.events) => match peer {
                Some(peer) => info!("disconnected from {}, closing...", peer),
                None => info!("transport events ended, closing..."),
            },
        }
        self.transport.close().await?;
        Ok(())
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
pub async fn shutdown_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryNetwork;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn connect_failure_is_connect_error() {
        let net = MemoryNetwork::new();
        let session = ReceiverSession::new(net.transport("receiver"), SessionConfig::default());
        let err = session.start(&"missing".into()).await.unwrap_err();
        assert!(matches!(err, ShareError::Connect { .. }));
    }

    #[tokio::test]
    async fn sender_disconnect_ends_session() {
        let net = MemoryNetwork::new();
        let sender = net.transport("sender");
        let mut session = ReceiverSession::new(net.transport("receiver"), SessionConfig::default());
        session.start(&"sender".into()).await.unwrap();

        sender.close().await.unwrap();
        timeout(Duration::from_secs(5), session.run_until(std::future::pending()))
            .await
            .unwrap()
            .unwrap();
        assert!(session
            .transport()
            .open_stream(&"sender".into(), &ProtocolId::chat())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn shutdown_future_ends_session() {
        let net = MemoryNetwork::new();
        let _sender = net.transport("sender");
        let mut session = ReceiverSession::new(net.transport("receiver"), SessionConfig::default());
        session.start(&"sender".into()).await.unwrap();
        session.run_until(async {}).await.unwrap();
    }
}
