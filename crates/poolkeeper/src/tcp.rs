//! Plain TCP transport shared by the MySQL and Redis backends.
//!
//! [`connect`] opens a stream with bounded connect/read/write timeouts so a
//! dead host cannot stall a pool build. [`TcpBackend`] is a protocol-unaware
//! [`ConnectionBackend`] over that stream.

use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use poolkeeper_core::{PoolError, PoolResult};

use crate::pool::ConnectionBackend;

/// Used in place of a zero timeout, which the socket API rejects.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(1);

fn bounded(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        FALLBACK_TIMEOUT
    } else {
        timeout
    }
}

/// Open a TCP connection, trying every resolved address in order.
///
/// Every failure (resolution, refusal, timeout) is `BackendUnreachable`.
pub fn connect(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
) -> PoolResult<TcpStream> {
    let addr_str = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = addr_str
        .to_socket_addrs()
        .map_err(|e| PoolError::unreachable(format!("dns resolution failed for {addr_str}: {e}")))?
        .collect();

    let mut last_err = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, bounded(connect_timeout)) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(bounded(read_timeout)))
                    .map_err(|e| PoolError::unreachable(format!("set read timeout: {e}")))?;
                stream
                    .set_write_timeout(Some(bounded(write_timeout)))
                    .map_err(|e| PoolError::unreachable(format!("set write timeout: {e}")))?;
                // Request/response protocols; don't batch small writes.
                let _ = stream.set_nodelay(true);

                tracing::debug!(host, port, %addr, "established tcp connection");
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(host, port, %addr, error = %e, "tcp connect attempt failed");
                last_err = Some(e);
            }
        }
    }

    Err(match last_err {
        Some(e) => PoolError::unreachable(format!("tcp connect to {addr_str}: {e}")),
        None => PoolError::unreachable(format!("no address found for {addr_str}")),
    })
}

/// A [`ConnectionBackend`] passing raw bytes over a TCP stream.
pub struct TcpBackend {
    stream: TcpStream,
}

impl std::fmt::Debug for TcpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpBackend")
            .field("peer", &self.stream.peer_addr().ok())
            .finish()
    }
}

impl TcpBackend {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }
}

impl ConnectionBackend for TcpBackend {
    fn send(&mut self, data: &[u8]) -> PoolResult<usize> {
        self.stream
            .write_all(data)
            .map_err(|e| PoolError::Transport(format!("tcp send: {e}")))?;
        Ok(data.len())
    }

    fn recv(&mut self, max_bytes: usize) -> PoolResult<Vec<u8>> {
        let mut buf = vec![0u8; max_bytes];
        let n = self
            .stream
            .read(&mut buf)
            .map_err(|e| PoolError::Transport(format!("tcp recv: {e}")))?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Non-blocking peek: EOF means the peer closed; no data means alive.
    fn ping(&mut self) -> bool {
        if self.stream.set_nonblocking(true).is_err() {
            return false;
        }
        let mut peek_buf = [0u8; 1];
        let alive = match self.stream.peek(&mut peek_buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => e.kind() == std::io::ErrorKind::WouldBlock,
        };
        let restored = self.stream.set_nonblocking(false).is_ok();
        alive && restored
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}
