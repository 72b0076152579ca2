use std::error::Error;

use arboard::Clipboard;
use clap::Parser;
use peershare::session::{SenderShell, SessionConfig};
use peershare::{net, PeerTransport, ShareError, TcpTransport, CHUNK_SIZE};
use tokio::io::BufReader;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Wait for a receiver to connect, then chat with it or send it a file.
#[derive(Parser, Debug)]
#[command(name = "peershare-sender", version)]
struct Args {
    /// Address to listen on [default: <outbound-ip>:0]
    #[arg(long, short = 'l', env = "PEERSHARE_LISTEN")]
    listen: Option<String>,

    /// Raw payload bytes per chunk
    #[arg(long, default_value_t = CHUNK_SIZE)]
    chunk_size: usize,

    /// Do not draw progress bars
    #[arg(long)]
    no_progress: bool,

    /// Do not copy the listen address to the clipboard
    #[arg(long)]
    no_clipboard: bool,
}

/// Copy text to the system clipboard.
///
/// On X11 the selection is served by its owner, so the returned handle must
/// stay alive for as long as the text should be pasteable.
fn copy_to_clipboard(text: &str) -> Result<Clipboard, arboard::Error> {
    let mut clipboard = Clipboard::new()?;
    clipboard.set_text(text)?;
    Ok(clipboard)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let listen_addr = match args.listen {
        Some(addr) => addr,
        None => net::default_listen_addr().await,
    };
    let config = SessionConfig {
        listen_addr,
        chunk_size: args.chunk_size.max(1),
        show_progress: !args.no_progress,
        ..Default::default()
    };

    let transport = TcpTransport::bind(&config.listen_addr).await?;
    let address = transport
        .addresses()
        .into_iter()
        .next()
        .ok_or_else(|| ShareError::Config("transport has no dialable address".to_string()))?;
    info!("sender is listening on {}", address);
    println!(
        "Start the receiver with: peershare-receiver --sender-address {}",
        address
    );
    let _clipboard = if args.no_clipboard {
        None
    } else {
        match copy_to_clipboard(address.as_str()) {
            Ok(clipboard) => {
                info!("sender address copied to clipboard");
                Some(clipboard)
            }
            Err(e) => {
                warn!("could not copy sender address to clipboard: {}", e);
                None
            }
        }
    };

    let mut shell = SenderShell::new(transport, config);
    let peer = shell.wait_for_peer().await?;

    let mut input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();
    let outcome = shell.run(&peer, &mut input, &mut output).await;
    shell.close().await?;
    outcome?;
    Ok(())
}
