//! Chunked single-file transfer over one stream.
//!
//! Wire layout, in order, on a file-share stream:
//!
//! 1. sender → receiver: one framed JSON line `{"name": ..., "size": ...}`
//! 2. sender → receiver: exactly `size` raw bytes, no framing
//! 3. receiver → sender: one framed line `ACK` (or `Error: ...` on failure)
//!
//! Chunk boundaries carry no meaning; the receiver only counts bytes.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::frame::{decode_metadata, encode_metadata, read_line, write_error_line, write_line};
use crate::types::{ShareError, TransferMetadata, ACK_TOKEN, CHUNK_SIZE, ERROR_PREFIX};

/// Observer notified after every chunk with cumulative progress.
///
/// Purely informational: nothing it does can influence the transfer.
pub trait ProgressObserver: Send + Sync {
    fn on_start(&self, _metadata: &TransferMetadata) {}

    fn on_progress(&self, transferred: u64, total: u64);

    fn on_finish(&self, _metadata: &TransferMetadata) {}
}

/// Observer that ignores every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&self, _transferred: u64, _total: u64) {}
}

/// Byte accounting for one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    total: u64,
    remaining: u64,
    transferred: u64,
}

impl TransferProgress {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            remaining: total,
            transferred: 0,
        }
    }

    /// Record `n` more bytes moved. Saturates at the declared total.
    pub fn advance(&mut self, n: usize) {
        let n = n as u64;
        self.remaining = self.remaining.saturating_sub(n);
        self.transferred = self.transferred.saturating_add(n);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Outcome of a completed transfer
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub metadata: TransferMetadata,
    /// Destination path (receiving side only)
    pub path: Option<PathBuf>,
    pub elapsed: Duration,
}

/// Sending half of the file-share protocol
pub struct FileSender {
    chunk_size: usize,
    observer: Arc<dyn ProgressObserver>,
}

impl FileSender {
    pub fn new() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            observer: Arc::new(NoProgress),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Stat and open the file at `path`, then send it over `stream`.
    pub async fn send_file<S>(
        &self,
        stream: &mut S,
        path: &Path,
    ) -> Result<TransferReport, ShareError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let file = File::open(path).await?;
        let metadata = file_metadata(path, &file).await?;
        self.send(stream, metadata, file).await
    }

    /// Send `metadata`, then exactly `metadata.size` bytes from `source`, then
    /// wait for the receiver's acknowledgement.
    pub async fn send<S, R>(
        &self,
        stream: &mut S,
        metadata: TransferMetadata,
        source: R,
    ) -> Result<TransferReport, ShareError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
        R: AsyncRead + Unpin,
    {
        let start = Instant::now();
        let mut io = BufReader::new(stream);

        let header = encode_metadata(&metadata)?;
        write_line(&mut io, &header).await?;
        info!(name = %metadata.name, size = metadata.size, "sending file");
        self.observer.on_start(&metadata);

        let mut source = source.take(metadata.size);
        let mut progress = TransferProgress::new(metadata.size);
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if let Err(e) = write_chunk(&mut io, &buf[..n]).await {
                warn!(name = %metadata.name, "payload write failed: {}", e);
                return Err(remote_fault(&mut io).await.unwrap_or(ShareError::Io(e)));
            }
            progress.advance(n);
            self.observer.on_progress(progress.transferred(), progress.total());
        }

        if !progress.is_complete() {
            return Err(ShareError::TruncatedTransfer {
                expected: metadata.size,
                received: progress.transferred(),
            });
        }
        self.observer.on_finish(&metadata);
        debug!(name = %metadata.name, "payload sent, waiting for acknowledgement");

        let reply = read_line(&mut io).await?;
        check_ack(&reply)?;
        info!(name = %metadata.name, "file received by peer");

        Ok(TransferReport {
            metadata,
            path: None,
            elapsed: start.elapsed(),
        })
    }
}

impl Default for FileSender {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of the file-share protocol
pub struct FileReceiver {
    dest_dir: PathBuf,
    chunk_size: usize,
    observer: Arc<dyn ProgressObserver>,
}

impl FileReceiver {
    pub fn new(dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            dest_dir: dest_dir.into(),
            chunk_size: CHUNK_SIZE,
            observer: Arc::new(NoProgress),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Receive one file from `stream` into the destination directory.
    ///
    /// On failure the peer gets a best-effort `Error: ...` line instead of
    /// `ACK`; a partially written file is left in place.
    pub async fn receive<S>(&self, stream: &mut S) -> Result<TransferReport, ShareError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut io = BufReader::new(stream);
        match self.receive_inner(&mut io).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!("file receive failed: {}", e);
                write_error_line(&mut io, &e).await;
                Err(e)
            }
        }
    }

    async fn receive_inner<S>(
        &self,
        io: &mut BufReader<&mut S>,
    ) -> Result<TransferReport, ShareError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let start = Instant::now();
        let header = read_line(io).await?;
        let metadata = decode_metadata(&header)?;
        let name = sanitize_file_name(&metadata.name)?;
        info!(name = %metadata.name, size = metadata.size, "receiving file");

        tokio::fs::create_dir_all(&self.dest_dir).await?;
        let path = self.dest_dir.join(name);
        let mut file = File::create(&path).await?;
        self.observer.on_start(&metadata);

        let mut progress = TransferProgress::new(metadata.size);
        let mut buf = vec![0u8; self.chunk_size];
        while !progress.is_complete() {
            let want = progress.remaining().min(buf.len() as u64) as usize;
            let n = io.read(&mut buf[..want]).await?;
            if n == 0 {
                file.flush().await?;
                return Err(ShareError::TruncatedTransfer {
                    expected: metadata.size,
                    received: progress.transferred(),
                });
            }
            file.write_all(&buf[..n]).await?;
            progress.advance(n);
            self.observer.on_progress(progress.transferred(), progress.total());
        }
        file.flush().await?;
        drop(file);
        self.observer.on_finish(&metadata);

        let elapsed = start.elapsed();
        info!(
            name = %metadata.name,
            path = %path.display(),
            "file received in {:?}",
            elapsed
        );

        write_line(io, ACK_TOKEN).await?;

        Ok(TransferReport {
            metadata,
            path: Some(path),
            elapsed,
        })
    }
}

/// Build the handshake header for an opened file.
pub async fn file_metadata(path: &Path, file: &File) -> Result<TransferMetadata, ShareError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} has no file name", path.display()),
            )
        })?;
    let stat = file.metadata().await?;
    if !stat.is_file() {
        return Err(ShareError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        )));
    }
    Ok(TransferMetadata {
        name,
        size: stat.len(),
    })
}

/// Accept a sender-supplied name only if it names a single plain file.
pub fn sanitize_file_name(name: &str) -> Result<&str, ShareError> {
    let reject = |why: &str| {
        Err(ShareError::ProtocolFraming(format!(
            "rejected file name {:?}: {}",
            name, why
        )))
    };

    if name.is_empty() {
        return reject("empty");
    }
    if name.contains(['/', '\\', '\0']) {
        return reject("contains a path separator");
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => reject("not a plain file name"),
    }
}

async fn write_chunk<W>(io: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    io.write_all(chunk).await?;
    io.flush().await
}

/// A receiver that gives up mid-transfer reports why before hanging up.
async fn remote_fault<R>(io: &mut R) -> Option<ShareError>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(io).await.ok()?;
    line.strip_prefix(ERROR_PREFIX)
        .map(|msg| ShareError::Remote(msg.to_string()))
}

fn check_ack(reply: &str) -> Result<(), ShareError> {
    if reply == ACK_TOKEN {
        return Ok(());
    }
    match reply.strip_prefix(ERROR_PREFIX) {
        Some(msg) => Err(ShareError::Remote(msg.to_string())),
        None => Err(ShareError::ProtocolFraming(format!(
            "expected {} but peer sent {:?}",
            ACK_TOKEN, reply
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::duplex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u64, u64)>>,
    }

    impl ProgressObserver for Recorder {
        fn on_progress(&self, transferred: u64, total: u64) {
            self.seen.lock().unwrap().push((transferred, total));
        }
    }

    fn meta(name: &str, size: u64) -> TransferMetadata {
        TransferMetadata {
            name: name.to_string(),
            size,
        }
    }

    #[test]
    fn progress_counts_down_to_zero() {
        let mut p = TransferProgress::new(10);
        p.advance(4);
        assert_eq!((p.remaining(), p.transferred()), (6, 4));
        assert!(!p.is_complete());
        p.advance(6);
        assert!(p.is_complete());
        assert!(TransferProgress::new(0).is_complete());
    }

    #[test]
    fn sanitizer_rejects_traversal() {
        assert!(sanitize_file_name("report.pdf").is_ok());
        assert!(sanitize_file_name(".hidden").is_ok());
        for bad in ["", ".", "..", "../etc/passwd", "a/b", "a\\b", "/abs", "nul\0"] {
            assert!(
                matches!(sanitize_file_name(bad), Err(ShareError::ProtocolFraming(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn ack_check_distinguishes_remote_errors() {
        assert!(check_ack("ACK").is_ok());
        assert!(matches!(check_ack("ack"), Err(ShareError::ProtocolFraming(_))));
        assert!(matches!(
            check_ack("Error: disk full"),
            Err(ShareError::Remote(m)) if m == "disk full"
        ));
    }

    #[tokio::test]
    async fn round_trip_small_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (mut a, mut b) = duplex(1024);

        let recorder = Arc::new(Recorder::default());
        let sender = FileSender::new()
            .with_chunk_size(333)
            .with_observer(recorder.clone());
        let receiver = FileReceiver::new(dir.path()).with_chunk_size(512);

        let send = sender.send(&mut a, meta("data.bin", payload.len() as u64), &payload[..]);
        let recv = receiver.receive(&mut b);
        let (sent, received) = tokio::join!(send, recv);
        sent.unwrap();
        let report = received.unwrap();

        let written = std::fs::read(report.path.unwrap()).unwrap();
        assert_eq!(written, payload);

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&(10_000, 10_000)));
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[tokio::test]
    async fn empty_file_still_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let (mut a, mut b) = duplex(64);
        let recorder = Arc::new(Recorder::default());

        let sender = FileSender::new().with_observer(recorder.clone());
        let receiver = FileReceiver::new(dir.path());
        let (sent, received) = tokio::join!(
            sender.send(&mut a, meta("empty.txt", 0), &b""[..]),
            receiver.receive(&mut b)
        );
        sent.unwrap();
        let path = received.unwrap().path.unwrap();
        assert_eq!(std::fs::metadata(path).unwrap().len(), 0);
        assert!(recorder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn wrong_ack_is_failure() {
        let (mut a, b) = duplex(4096);
        let peer = tokio::spawn(async move {
            let mut io = BufReader::new(b);
            let header = read_line(&mut io).await.unwrap();
            let metadata = decode_metadata(&header).unwrap();
            let mut payload = vec![0u8; metadata.size as usize];
            io.read_exact(&mut payload).await.unwrap();
            write_line(&mut io, "NOPE").await.unwrap();
            payload
        });

        let result = FileSender::new()
            .send(&mut a, meta("x.txt", 5), &b"hello"[..])
            .await;
        assert!(matches!(result, Err(ShareError::ProtocolFraming(_))));
        assert_eq!(peer.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn truncated_stream_gets_no_ack() {
        let dir = tempfile::tempdir().unwrap();
        let (a, mut b) = duplex(4096);
        let peer = tokio::spawn(async move {
            let mut a = a;
            write_line(&mut a, r#"{"name":"cut.bin","size":100}"#).await.unwrap();
            a.write_all(&[7u8; 40]).await.unwrap();
            a.shutdown().await.unwrap();
            let mut rest = String::new();
            a.read_to_string(&mut rest).await.unwrap();
            rest
        });

        let result = FileReceiver::new(dir.path()).receive(&mut b).await;
        match result {
            Err(ShareError::TruncatedTransfer { expected, received }) => {
                assert_eq!((expected, received), (100, 40));
            }
            other => panic!("expected truncation, got {:?}", other),
        }
        drop(b);
        let reply = peer.await.unwrap();
        assert!(!reply.lines().any(|l| l == ACK_TOKEN));
        assert!(reply.starts_with(ERROR_PREFIX));
        assert_eq!(std::fs::read(dir.path().join("cut.bin")).unwrap().len(), 40);
    }

    #[tokio::test]
    async fn bad_header_creates_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("incoming");
        let (mut a, mut b) = duplex(4096);
        write_line(&mut a, "{not json").await.unwrap();

        let result = FileReceiver::new(&dest).receive(&mut b).await;
        assert!(matches!(result, Err(ShareError::ProtocolFraming(_))));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn traversal_name_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("incoming");
        let (mut a, mut b) = duplex(4096);
        write_line(&mut a, r#"{"name":"../escape.txt","size":0}"#).await.unwrap();

        let result = FileReceiver::new(&dest).receive(&mut b).await;
        assert!(matches!(result, Err(ShareError::ProtocolFraming(_))));
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn shrinking_source_is_truncation_on_sender() {
        let (mut a, _b) = duplex(4096);
        let result = FileSender::new()
            .send(&mut a, meta("short.bin", 10), &b"abc"[..])
            .await;
        assert!(matches!(
            result,
            Err(ShareError::TruncatedTransfer { expected: 10, received: 3 })
        ));
    }

    #[tokio::test]
    async fn send_file_reads_name_and_size_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("source.txt");
        std::fs::write(&src, b"file contents").unwrap();
        let out = dir.path().join("out");

        let (mut a, mut b) = duplex(256);
        let sender = FileSender::new();
        let receiver = FileReceiver::new(&out);
        let (sent, received) = tokio::join!(
            sender.send_file(&mut a, &src),
            receiver.receive(&mut b)
        );
        let sent = sent.unwrap();
        assert_eq!(sent.metadata, meta("source.txt", 13));
        assert_eq!(received.unwrap().path.unwrap(), out.join("source.txt"));
        assert_eq!(std::fs::read(out.join("source.txt")).unwrap(), b"file contents");
    }

    #[tokio::test]
    async fn rejected_large_transfer_surfaces_receiver_reason() {
        let dir = tempfile::tempdir().unwrap();
        let (mut a, b) = duplex(64 * 1024);
        let receiver = FileReceiver::new(dir.path());
        let peer = tokio::spawn(async move {
            let mut b = b;
            let result = receiver.receive(&mut b).await;
            assert!(result.is_err());
        });

        let payload = vec![3u8; 1024 * 1024];
        let result = FileSender::new()
            .send(&mut a, meta("../x", payload.len() as u64), &payload[..])
            .await;
        match result {
            Err(ShareError::Remote(msg)) => {
                assert!(msg.contains("rejected file name"), "{}", msg)
            }
            other => panic!("expected remote fault, got {:?}", other),
        }
        peer.await.unwrap();
    }
}
