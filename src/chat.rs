//! Chat exchange protocol: request/response text lines on their own
//! protocol id. The serving side answers every message with [`CHAT_REPLY`],
//! whatever it says.

use std::io;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::LineCodec;
use crate::types::{PeerAddress, ShareError, CHAT_REPLY, ERROR_PREFIX};

/// Serve one chat stream until the peer hangs up or an I/O error occurs.
///
/// A clean end of stream returns `Ok`. On a read or framing fault the peer is
/// sent a best-effort `Error: ...` line before the error is returned.
pub async fn serve_chat<S>(stream: S, peer: &PeerAddress) -> Result<(), ShareError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, LineCodec::new());
    let mut served = 0u64;

    loop {
        let message = match framed.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                if let Err(report) = framed.send(format!("{}{}", ERROR_PREFIX, e)).await {
                    warn!("could not report fault to {}: {}", peer, report);
                }
                return Err(e);
            }
            None => break,
        };
        info!("received message from {}: {}", peer, message);
        framed.send(CHAT_REPLY).await?;
        served += 1;
    }

    debug!("chat with {} ended after {} messages", peer, served);
    Ok(())
}

/// Requesting side of a chat stream
pub struct ChatClient<S> {
    framed: Framed<S, LineCodec>,
}

impl<S> ChatClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, LineCodec::new()),
        }
    }

    /// Send one message and wait for the reply line.
    pub async fn exchange(&mut self, message: &str) -> Result<String, ShareError> {
        self.framed.send(message).await?;
        match self.framed.next().await {
            Some(reply) => reply,
            None => Err(ShareError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed chat stream",
            ))),
        }
    }

    /// Give back the underlying stream, e.g. to close it.
    pub fn into_inner(self) -> S {
        self.framed.into_inner()
    }
}
