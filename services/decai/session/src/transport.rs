//! TCP transport for peer sessions.
//!
//! Sessions run over any reliable ordered byte stream; TCP is the one this
//! crate can open on its own.

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// A reliable, ordered, bidirectional byte stream a session can own
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    debug!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> tokio::io::Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    // Frames are flushed one at a time; don't let Nagle hold small replies back
    stream.set_nodelay(true)?;
    Ok(stream)
}
