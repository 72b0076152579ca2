//! Local network helpers.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;
use tracing::debug;

/// IP address of the interface used for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick a route.
pub async fn outbound_ip() -> io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(("8.8.8.8", 80)).await?;
    Ok(socket.local_addr()?.ip())
}

/// `<outbound-ip>:0`, falling back to loopback when there is no route.
pub async fn default_listen_addr() -> String {
    let ip = match outbound_ip().await {
        Ok(ip) => ip,
        Err(e) => {
            debug!("no outbound route ({}), listening on loopback", e);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    };
    SocketAddr::new(ip, 0).to_string()
}
