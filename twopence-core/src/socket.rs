//! The non-blocking transport-socket abstraction: a duplex byte stream with
//! a posted recv buffer and a queued transmit side, matching the original
//! library's `twopence_sock_t` contract (`twopence_sock_doio`,
//! `twopence_sock_xmit_queue_allowed`, `twopence_sock_shutdown_write`).

use crate::backpressure;
use crate::buffer::ByteBuffer;
use crate::poison::PoisonGuard;
use bytes::{Bytes, BytesMut};
use compio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

/// A transport address, parsed from the `<transport>:<spec>` half of a
/// target spec string (§6). Kept deliberately small — the façade crate owns
/// the full `<plugin>:<spec>` grammar; this only covers the address forms a
/// built-in plugin's own spec string can take.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportAddr {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
    /// An in-process peer, named by the `local` plugin's connection id.
    InProcess(String),
}

impl FromStr for TransportAddr {
    type Err = TransportAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(addr) = s.strip_prefix("tcp://") {
            let socket_addr = addr
                .parse::<SocketAddr>()
                .map_err(|_| TransportAddrError::InvalidTcpAddress(addr.to_string()))?;
            Ok(Self::Tcp(socket_addr))
        } else if let Some(path) = s.strip_prefix("unix://") {
            #[cfg(unix)]
            {
                Ok(Self::Unix(PathBuf::from(path)))
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                Err(TransportAddrError::UnixNotSupported)
            }
        } else if let Some(name) = s.strip_prefix("local://") {
            if name.is_empty() {
                Err(TransportAddrError::InvalidLocalName)
            } else {
                Ok(Self::InProcess(name.to_string()))
            }
        } else {
            Err(TransportAddrError::InvalidScheme(s.to_string()))
        }
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::InProcess(name) => write!(f, "local://{name}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportAddrError {
    #[error("invalid transport scheme in address: {0}")]
    InvalidScheme(String),
    #[error("invalid TCP address: {0}")]
    InvalidTcpAddress(String),
    #[error("in-process address name cannot be empty")]
    InvalidLocalName,
    #[error("unix-domain-socket transport not supported on this platform")]
    UnixNotSupported,
}

/// Wraps a duplex async stream with a posted recv buffer and an outgoing
/// byte queue, giving the protocol layer a non-blocking `doio` to drive.
pub struct AsyncEndpoint<S> {
    stream: Option<S>,
    recv: ByteBuffer,
    recv_read_size: usize,
    xmit_queue: VecDeque<Bytes>,
    xmit_queued_bytes: usize,
    write_eof_sent: bool,
    dead: bool,
    /// Set by [`PoisonGuard`] if `flush_xmit`'s write loop is ever dropped
    /// mid-flight (e.g. by `run_once`'s deadline-bounded `doio` timing out
    /// between two `write_all` calls) — a half-written xmit queue leaves the
    /// peer's framing unrecoverable, so the connection is dead from then on
    /// even though the underlying stream itself never returned an error.
    poisoned: bool,
}

impl<S> AsyncEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(stream: S, read_buf_size: usize) -> Self {
        Self {
            stream: Some(stream),
            recv: ByteBuffer::new(read_buf_size),
            recv_read_size: read_buf_size,
            xmit_queue: VecDeque::new(),
            xmit_queued_bytes: 0,
            write_eof_sent: false,
            dead: false,
            poisoned: false,
        }
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.dead || self.poisoned || self.stream.is_none()
    }

    pub fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Bytes currently queued for transmission but not yet written.
    #[must_use]
    pub fn xmit_queued_bytes(&self) -> usize {
        self.xmit_queued_bytes
    }

    /// Whether source channels should still be polled for more data given
    /// `watermark`, per the connection's backpressure policy (§4.2/§4.7).
    #[must_use]
    pub fn xmit_queue_allowed(&self, watermark: usize) -> bool {
        backpressure::xmit_queue_allowed(self.xmit_queued_bytes, watermark)
    }

    /// Enqueue `bytes` for transmission; actual writes happen in `doio`.
    pub fn queue_write(&mut self, bytes: Bytes) {
        self.xmit_queued_bytes += bytes.len();
        self.xmit_queue.push_back(bytes);
    }

    /// Take whatever has accumulated in the recv buffer since the last call,
    /// leaving the buffer ready to receive more.
    pub fn take_recv_bytes(&mut self) -> Option<Bytes> {
        let n = self.recv.count();
        if n == 0 {
            return None;
        }
        let out = self.recv.pull(n);
        self.recv.compact();
        out
    }

    /// Direct access to the recv buffer, for a codec that decodes frames
    /// in place rather than through [`AsyncEndpoint::take_recv_bytes`].
    pub fn recv_buffer_mut(&mut self) -> &mut ByteBuffer {
        &mut self.recv
    }

    /// Drive one iteration of I/O: flush as much of the xmit queue as the
    /// stream will currently accept, then read whatever is available into
    /// the recv buffer. Returns `(bytes_read, bytes_written)`.
    pub async fn doio(&mut self) -> io::Result<(usize, usize)> {
        let written = self.flush_xmit().await?;
        let read = self.fill_recv().await?;
        Ok((read, written))
    }

    async fn flush_xmit(&mut self) -> io::Result<usize> {
        if self.poisoned {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "transport socket poisoned by a previously cancelled write",
            ));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };
        let guard = PoisonGuard::new(&mut self.poisoned);
        let mut total = 0usize;
        while let Some(chunk) = self.xmit_queue.pop_front() {
            let len = chunk.len();
            let result = stream.write_all(chunk).await;
            if let Err(e) = result.0 {
                self.dead = true;
                return Err(e);
            }
            self.xmit_queued_bytes -= len;
            total += len;
        }
        guard.disarm();
        Ok(total)
    }

    async fn fill_recv(&mut self) -> io::Result<usize> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(0);
        };
        let buf = BytesMut::zeroed(self.recv_read_size);
        let result = stream.read(buf).await;
        match result.0 {
            Ok(0) => {
                self.stream = None;
                Ok(0)
            }
            Ok(n) => {
                let buf: BytesMut = result.1;
                self.recv.append(&buf[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => {
                self.dead = true;
                Err(e)
            }
        }
    }

    /// Shut down the write half, signalling EOF to the peer without closing
    /// the read half (`twopence_sock_shutdown_write`).
    pub async fn shutdown_write(&mut self) -> io::Result<()> {
        if self.write_eof_sent {
            return Ok(());
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.shutdown().await?;
        }
        self.write_eof_sent = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_address() {
        let addr: TransportAddr = "tcp://127.0.0.1:9999".parse().unwrap();
        assert!(matches!(addr, TransportAddr::Tcp(_)));
        assert_eq!(addr.to_string(), "tcp://127.0.0.1:9999");
    }

    #[test]
    fn parses_local_address() {
        let addr: TransportAddr = "local://conn-7".parse().unwrap();
        assert_eq!(addr, TransportAddr::InProcess("conn-7".to_string()));
    }

    #[test]
    fn rejects_unknown_scheme() {
        let res = TransportAddr::from_str("ssh://host");
        assert!(matches!(res, Err(TransportAddrError::InvalidScheme(_))));
    }

    #[test]
    fn rejects_empty_local_name() {
        let res = TransportAddr::from_str("local://");
        assert!(matches!(res, Err(TransportAddrError::InvalidLocalName)));
    }
}
