//! Framed message I/O over TCP.
//!
//! One frame carries one message (see `courier_core::wire`). Every connect,
//! read, and write runs under a deadline; running out of time is reported
//! as `TransportError::Timeout` and the caller drops the connection.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use courier_core::config::SocketSettings;
use courier_core::wire::{self, FramePrelude, WireError, PRELUDE_SIZE};
use courier_core::Message;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const LISTEN_BACKLOG: i32 = 1024;

/// Open a keep-alive connection to `settings.host:settings.port`.
pub async fn connect(settings: &SocketSettings) -> Result<TcpStream, TransportError> {
    let target = (settings.host.as_str(), settings.port);
    let stream = timeout(settings.timeout, TcpStream::connect(target))
        .await
        .map_err(|_| TransportError::Timeout(settings.timeout))?
        .map_err(TransportError::Io)?;

    SockRef::from(&stream)
        .set_keepalive(true)
        .map_err(TransportError::Io)?;
    stream.set_nodelay(true).map_err(TransportError::Io)?;

    tracing::trace!(endpoint = %settings.endpoint(), "connected");
    Ok(stream)
}

/// Bind a listening socket. Port 0 asks the OS for a free port.
pub fn listen(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Read exactly one frame. Declared sizes above `max_frame_bytes` are
/// refused before the body is allocated.
pub async fn read_message<R>(
    reader: &mut R,
    deadline: Duration,
    max_frame_bytes: usize,
) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin,
{
    timeout(deadline, read_frame(reader, max_frame_bytes))
        .await
        .map_err(|_| TransportError::Timeout(deadline))?
}

async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut prelude_buf = [0u8; PRELUDE_SIZE];
    reader.read_exact(&mut prelude_buf).await.map_err(eof_is_closed)?;
    let prelude = FramePrelude::parse(&prelude_buf)?;
    prelude.check_limit(max_frame_bytes)?;

    let mut header = vec![0u8; prelude.header_len()];
    reader.read_exact(&mut header).await.map_err(eof_is_closed)?;

    let mut body = BytesMut::zeroed(prelude.body_len());
    reader.read_exact(&mut body).await.map_err(eof_is_closed)?;

    tracing::trace!(header = header.len(), body = body.len(), "frame read");
    Ok(wire::decode(&prelude, &header, body.freeze())?)
}

/// Write one message as a frame and flush it.
pub async fn write_message<W>(writer: &mut W, msg: &Message, deadline: Duration) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = wire::encode(msg)?;
    timeout(deadline, async {
        writer.write_all(&frame).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| TransportError::Timeout(deadline))?
    .map_err(TransportError::Io)?;

    tracing::trace!(bytes = frame.len(), kind = ?msg.kind, "frame written");
    Ok(())
}

fn eof_is_closed(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed by peer")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(#[from] WireError),
    #[error("i/o error: {0}")]
    Io(std::io::Error),
}
