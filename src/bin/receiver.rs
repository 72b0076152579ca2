use std::error::Error;
use std::path::PathBuf;

use clap::Parser;
use peershare::session::{self, required_peer_address, ReceiverSession, SessionConfig};
use peershare::{net, PeerTransport, TcpTransport, CHUNK_SIZE};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Connect to a sender and serve its chat and file-share streams.
#[derive(Parser, Debug)]
#[command(name = "peershare-receiver", version)]
struct Args {
    /// Dialable address printed by the sender
    #[arg(long = "sender-address", short = 's', env = "PEERSHARE_SENDER_ADDRESS")]
    sender_address: Option<String>,

    /// Address to listen on [default: <outbound-ip>:0]
    #[arg(long, short = 'l', env = "PEERSHARE_LISTEN")]
    listen: Option<String>,

    /// Directory received files are written to
    #[arg(long, short = 'd', default_value = session::DEFAULT_DOWNLOAD_DIR)]
    download_dir: PathBuf,

    /// Raw payload bytes per chunk
    #[arg(long, default_value_t = CHUNK_SIZE)]
    chunk_size: usize,

    /// Do not draw progress bars
    #[arg(long)]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let sender = required_peer_address(args.sender_address, "sender address")?;

    let listen_addr = match args.listen {
        Some(addr) => addr,
        None => net::default_listen_addr().await,
    };
    let config = SessionConfig {
        listen_addr,
        download_dir: args.download_dir,
        chunk_size: args.chunk_size.max(1),
        show_progress: !args.no_progress,
        ..Default::default()
    };

    let transport = TcpTransport::bind(&config.listen_addr).await?;
    for addr in transport.addresses() {
        info!("receiver is listening on {}", addr);
    }

    let mut receiver = ReceiverSession::new(transport, config);
    receiver.start(&sender).await?;

    receiver
        .run_until(async {
            if let Err(e) = session::shutdown_signal().await {
                error!("error waiting for shutdown signal: {}", e);
            }
        })
        .await?;
    Ok(())
}
