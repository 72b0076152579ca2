//! Interactive sending side: waits for the receiver to connect, then offers a
//! menu of protocols, opening a fresh stream for each selection.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{wait_for_peer, SessionConfig};
use crate::chat::ChatClient;
use crate::stream::{close_stream, StreamOpener};
use crate::transfer::{file_metadata, FileSender, TransferReport};
use crate::transport::PeerTransport;
use crate::types::{PeerAddress, PeerEvent, ProtocolId, ShareError};

const MENU: &str = "Enter:\n1 for chat stream\n2 for file share stream\n3 to exit\n> ";
const FILE_PROMPT: &str = "Enter the name of the file to send: ";
const MESSAGE_PROMPT: &str = "Enter a message to send to the server: ";

/// Sending-side session shell
pub struct SenderShell<T: PeerTransport> {
    transport: T,
    config: SessionConfig,
    opener: StreamOpener,
    events: broadcast::Receiver<PeerEvent>,
}

impl<T: PeerTransport> SenderShell<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        let events = transport.subscribe();
        let opener = StreamOpener::new(config.retry);
        Self {
            transport,
            config,
            opener,
            events,
        }
    }

    /// Replace the stream opener, e.g. to inject a retry delay.
    pub fn with_opener(mut self, opener: StreamOpener) -> Self {
        self.opener = opener;
        self
    }

    /// Wait until a receiver connects and return its dialable address.
    pub async fn wait_for_peer(&mut self) -> Result<PeerAddress, ShareError> {
        info!("waiting for connection...");
        let peer = wait_for_peer(&mut self.events).await?;
        info!("peer connected: {}", peer);
        Ok(peer)
    }

    /// Run the menu loop against `peer` until the user exits, input ends,
    /// or an invalid choice is entered.
    pub async fn run<I, O>(
        &self,
        peer: &PeerAddress,
        input: &mut I,
        output: &mut O,
    ) -> Result<(), ShareError>
    where
        I: AsyncBufRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        loop {
            let choice = match prompt(input, output, MENU).await? {
                Some(choice) => choice,
                None => return Ok(()),
            };

            let outcome = match choice.trim() {
                "1" => self.chat(peer, input, output).await,
                "2" => {
                    let path = match prompt(input, output, FILE_PROMPT).await? {
                        Some(path) => path,
                        None => return Ok(()),
                    };
                    match self.share_file(peer, Path::new(path.trim())).await {
                        Ok(report) => {
                            say(
                                output,
                                &format!(
                                    "File {} ({} bytes) received successfully\n",
                                    report.metadata.name, report.metadata.size
                                ),
                            )
                            .await?;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                }
                "3" => {
                    say(output, "Exiting...\n").await?;
                    return Ok(());
                }
                _ => {
                    say(output, "Invalid choice\n").await?;
                    return Ok(());
                }
            };

            if let Err(e) = outcome {
                warn!("operation failed: {}", e);
                say(output, &format!("Error: {}\n", e)).await?;
            }
        }
    }

    /// Open a chat stream and exchange messages until the user stops.
    pub async fn chat<I, O>(
        &self,
        peer: &PeerAddress,
        input: &mut I,
        output: &mut O,
    ) -> Result<(), ShareError>
    where
        I: AsyncBufRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let stream = self.opener.open(&self.transport, peer, &ProtocolId::chat()).await?;
        let mut client = ChatClient::new(stream);

        let outcome = chat_loop(&mut client, input, output).await;
        let mut stream = client.into_inner();
        let closed = close_stream(&mut stream).await;
        outcome?;
        closed
    }

    /// Send the file at `path` on a fresh file-share stream.
    ///
    /// The file is opened before any stream so local faults never reach the
    /// wire.
    pub async fn share_file(
        &self,
        peer: &PeerAddress,
        path: &Path,
    ) -> Result<TransferReport, ShareError> {
        let file = File::open(path).await?;
        let metadata = file_metadata(path, &file).await?;

        let mut stream = self
            .opener
            .open(&self.transport, peer, &ProtocolId::file_share())
            .await?;
        let sender = FileSender::new()
            .with_chunk_size(self.config.chunk_size)
            .with_observer(self.config.sending_observer());

        let outcome = sender.send(&mut stream, metadata, file).await;
        let closed = close_stream(&mut stream).await;
        let report = outcome?;
        closed?;
        info!(
            "sent {} ({} bytes) in {:?}",
            report.metadata.name, report.metadata.size, report.elapsed
        );
        Ok(report)
    }

    /// Shut the transport down.
    pub async fn close(&self) -> Result<(), ShareError> {
        self.transport.close().await?;
        Ok(())
    }
}

async fn chat_loop<S, I, O>(
    client: &mut ChatClient<S>,
    input: &mut I,
    output: &mut O,
) -> Result<(), ShareError>
where
    S: tokio::io::AsyncRead + AsyncWrite + Unpin,
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    loop {
        let message = match prompt(input, output, MESSAGE_PROMPT).await? {
            Some(message) => message,
            None => return Ok(()),
        };
        let reply = client.exchange(&message).await?;
        info!("received response from server: {}", reply);
        say(output, &format!("Received response from server: {}\n", reply)).await?;

        match prompt(input, output, "Do you want to continue (yes/no)? ").await? {
            Some(answer) if answer.trim() == "yes" => continue,
            _ => return Ok(()),
        }
    }
}

/// Print `text` and read one line of user input. `None` at end of input.
async fn prompt<I, O>(
    input: &mut I,
    output: &mut O,
    text: &str,
) -> Result<Option<String>, ShareError>
where
    I: AsyncBufRead + Unpin,
    O: AsyncWrite + Unpin,
{
    say(output, text).await?;
    let mut line = String::new();
    if input.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

async fn say<O>(output: &mut O, text: &str) -> Result<(), ShareError>
where
    O: AsyncWrite + Unpin,
{
    output.write_all(text.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}
