//! Single-socket UDP transport with send-and-await retry.

use crate::error::{Error, Result};
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

/// Maximum datagram payload; a request or response larger than this is a
/// local programming error, not a network condition.
pub const MAX_DATAGRAM: usize = 65507;
/// Read/write data chunk size.
pub const RW_CHUNK: usize = 32768;

pub const RETRY_LIMIT: u32 = 9;
pub const AGAIN_LIMIT: u32 = 3;
/// Each poll cycle's timeout while awaiting a reply.
const POLL_TIMEOUT: Duration = Duration::from_millis(200);

/// Wraps one bound UDP socket used for both sending requests and awaiting
/// their replies.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> Result<UdpTransport> {
        let socket = UdpSocket::bind(addr)?;
        Ok(UdpTransport { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<()> {
        self.socket.send_to(buf, target)?;
        Ok(())
    }

    /// Block for up to one receiver-loop timeout, returning the datagram
    /// and its sender if one arrived.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<(Vec<u8>, SocketAddr)>> {
        self.socket.set_read_timeout(Some(timeout))?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match self.socket.recv_from(&mut buf) {
            Ok((n, peer)) => {
                buf.truncate(n);
                Ok(Some((buf, peer)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send `request` to `target` up to `RETRY_LIMIT` times, polling up to
    /// `AGAIN_LIMIT` cycles after each send for a reply accepted by
    /// `accept`. Returns [`Error::WouldRetry`] once both limits are spent.
    pub fn send_and_await(
        &self,
        request: &[u8],
        target: SocketAddr,
        mut accept: impl FnMut(&[u8], SocketAddr) -> bool,
    ) -> Result<Vec<u8>> {
        for _ in 0..RETRY_LIMIT {
            self.send_to(request, target)?;
            for _ in 0..AGAIN_LIMIT {
                if let Some((buf, peer)) = self.recv_timeout(POLL_TIMEOUT)? {
                    if accept(&buf, peer) {
                        return Ok(buf);
                    }
                }
            }
        }
        Err(Error::WouldRetry)
    }
}
