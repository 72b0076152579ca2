//! Stream acquisition with bounded retry, and stream teardown.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::transport::PeerTransport;
use crate::types::{PeerAddress, ProtocolId, ShareError};

/// Pause between failed attempts
pub type DelayFn = Arc<dyn Fn(Duration) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fixed-count, fixed-delay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves like one.
    pub attempts: u32,
    /// Wait between consecutive attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Opens streams against a transport, retrying per a [`RetryPolicy`].
#[derive(Clone)]
pub struct StreamOpener {
    policy: RetryPolicy,
    delay: DelayFn,
}

impl StreamOpener {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_delay(policy, Arc::new(|d| tokio::time::sleep(d).boxed()))
    }

    /// Use a custom delay function, e.g. one that returns immediately in tests.
    pub fn with_delay(policy: RetryPolicy, delay: DelayFn) -> Self {
        Self { policy, delay }
    }

    /// Open a `protocol` stream to `peer`.
    pub async fn open<T>(
        &self,
        transport: &T,
        peer: &PeerAddress,
        protocol: &ProtocolId,
    ) -> Result<T::Stream, ShareError>
    where
        T: PeerTransport,
    {
        self.open_with(protocol, || transport.open_stream(peer, protocol))
            .await
    }

    /// Retry `attempt` until it succeeds or the policy is exhausted.
    pub async fn open_with<S, F, Fut>(
        &self,
        protocol: &ProtocolId,
        mut attempt: F,
    ) -> Result<S, ShareError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<S>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut tried = 0;
        loop {
            tried += 1;
            match attempt().await {
                Ok(stream) => {
                    debug!(%protocol, attempt = tried, "stream opened");
                    return Ok(stream);
                }
                Err(e) if tried < attempts => {
                    warn!(
                        %protocol,
                        "error opening stream: {}, retrying in {:?} ({}/{})",
                        e,
                        self.policy.delay,
                        tried,
                        attempts
                    );
                    (self.delay)(self.policy.delay).await;
                }
                Err(e) => {
                    return Err(ShareError::StreamOpen {
                        protocol: protocol.clone(),
                        attempts: tried,
                        source: e,
                    });
                }
            }
        }
    }
}

impl Default for StreamOpener {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

/// Close the write side of `stream`. A failure is returned, never swallowed.
pub async fn close_stream<S>(stream: &mut S) -> Result<(), ShareError>
where
    S: AsyncWrite + Unpin,
{
    stream.shutdown().await.map_err(ShareError::StreamClose)
}
