//! Session shells driving the protocols: an interactive sender and a
//! long-running receiver.

pub mod receiver;
pub mod sender;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use indicatif::MultiProgress;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::progress::ProgressBarObserver;
use crate::stream::RetryPolicy;
use crate::transfer::{NoProgress, ProgressObserver};
use crate::types::{PeerAddress, PeerEvent, ShareError, CHUNK_SIZE};

pub use receiver::{shutdown_signal, ReceiverSession};
pub use sender::SenderShell;

/// Directory received files land in unless configured otherwise
pub const DEFAULT_DOWNLOAD_DIR: &str = "./received_files";

/// Configuration shared by both session kinds
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Address the local transport listens on
    pub listen_addr: String,
    /// Where the receiver writes incoming files
    pub download_dir: PathBuf,
    /// Raw payload bytes per read/write
    pub chunk_size: usize,
    /// Stream acquisition policy
    pub retry: RetryPolicy,
    /// Draw progress bars during transfers
    pub show_progress: bool,
    /// Draw target shared by every bar of the session
    pub progress: MultiProgress,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".to_string(),
            download_dir: PathBuf::from(DEFAULT_DOWNLOAD_DIR),
            chunk_size: CHUNK_SIZE,
            retry: RetryPolicy::default(),
            show_progress: false,
            progress: MultiProgress::new(),
        }
    }
}

impl SessionConfig {
    pub(crate) fn sending_observer(&self) -> Arc<dyn ProgressObserver> {
        if self.show_progress {
            Arc::new(ProgressBarObserver::sending(&self.progress))
        } else {
            Arc::new(NoProgress)
        }
    }

    pub(crate) fn receiving_observer(&self) -> Arc<dyn ProgressObserver> {
        if self.show_progress {
            Arc::new(ProgressBarObserver::receiving(&self.progress))
        } else {
            Arc::new(NoProgress)
        }
    }
}

/// Validate a required peer address given at startup.
pub fn required_peer_address(value: Option<String>, what: &str) -> Result<PeerAddress, ShareError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(PeerAddress::new(v)),
        _ => Err(ShareError::Config(format!("no {} provided", what))),
    }
}

/// Resolve with the address of the next peer that connects.
pub async fn wait_for_peer(
    events: &mut broadcast::Receiver<PeerEvent>,
) -> Result<PeerAddress, ShareError> {
    loop {
        match events.recv().await {
            Ok(PeerEvent::Connected(peer)) => return Ok(peer),
            Ok(PeerEvent::Disconnected(peer)) => debug!("ignoring disconnect from {}", peer),
            Err(RecvError::Lagged(skipped)) => debug!("missed {} peer events", skipped),
            Err(RecvError::Closed) => {
                return Err(ShareError::Io(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "transport closed before a peer connected",
                )))
            }
        }
    }
}

/// Resolve once any peer disconnects, or the event source goes away.
pub async fn wait_for_disconnect(
    events: &mut broadcast::Receiver<PeerEvent>,
) -> Option<PeerAddress> {
    loop {
        match events.recv().await {
            Ok(PeerEvent::Disconnected(peer)) => return Some(peer),
            Ok(PeerEvent::Connected(_)) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_address_is_config_error() {
        assert!(matches!(
            required_peer_address(None, "sender address"),
            Err(ShareError::Config(_))
        ));
        assert!(matches!(
            required_peer_address(Some("  ".to_string()), "sender address"),
            Err(ShareError::Config(_))
        ));
        assert_eq!(
            required_peer_address(Some("10.0.0.2:4000".to_string()), "sender address").unwrap(),
            PeerAddress::from("10.0.0.2:4000")
        );
    }

    #[tokio::test]
    async fn wait_for_peer_skips_disconnects() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(PeerEvent::Disconnected("old".into())).unwrap();
        tx.send(PeerEvent::Connected("new".into())).unwrap();
        assert_eq!(wait_for_peer(&mut rx).await.unwrap(), PeerAddress::from("new"));
    }

    #[tokio::test]
    async fn wait_for_peer_fails_when_source_closes() {
        let (tx, mut rx) = broadcast::channel::<PeerEvent>(8);
        drop(tx);
        assert!(wait_for_peer(&mut rx).await.is_err());
        assert_eq!(wait_for_disconnect(&mut rx).await, None);
    }
}
