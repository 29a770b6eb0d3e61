//! UDP socket wrapper for SNP
//!
//! The drivers run a background receive thread that blocks on this socket.
//! Receives use a short read timeout so the thread can notice a shutdown
//! request; [`NetSocket::shutdown`] additionally shuts the descriptor down to
//! unblock a receive already in flight.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Read timeout for the blocking receive loop
pub const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,
}

/// Blocking UDP socket used by the driver receive threads.
pub struct NetSocket {
    inner: Socket,
}

impl NetSocket {
    /// Create a socket bound to the given address, configured for the
    /// blocking receive loop (read timeout set to [`RECV_TIMEOUT`]).
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        Ok(NetSocket { inner: socket })
    }

    /// Get the local address this socket is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or(SocketError::InvalidAddress)
    }

    /// Send one datagram to the given address.
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, &target.into())?)
    }

    /// Receive one datagram, blocking up to the read timeout.
    ///
    /// Returns `Ok(None)` when the timeout elapses with no data; the receive
    /// loop uses that as its shutdown-check point.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        let uninit_buf = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
        };

        match self.inner.recv_from(uninit_buf) {
            Ok((n, addr)) => Ok(Some((
                n,
                addr.as_socket().ok_or(SocketError::InvalidAddress)?,
            ))),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(None)
            }
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    /// Unblock a receive in flight. Best-effort: some platforms report an
    /// error shutting down an unconnected UDP socket, which is fine because
    /// the read timeout bounds the wait anyway.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown(std::net::Shutdown::Both);
    }

    /// Clone the descriptor so one thread can receive while another sends.
    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(NetSocket {
            inner: self.inner.try_clone()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_creation() {
        let socket = NetSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[test]
    fn test_socket_send_recv() {
        let sender = NetSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let receiver = NetSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let receiver_addr = receiver.local_addr().unwrap();

        let data = b"Hello, SNP!";
        sender.send_to(data, receiver_addr).unwrap();

        let mut buf = [0u8; 1024];
        for _ in 0..10 {
            if let Some((n, _addr)) = receiver.recv_from(&mut buf).unwrap() {
                assert_eq!(&buf[..n], data);
                return;
            }
        }
        panic!("Failed to receive data");
    }

    #[test]
    fn test_recv_timeout_returns_none() {
        let socket = NetSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut buf = [0u8; 64];
        assert!(socket.recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_socket_ipv6() {
        // May fail on systems without IPv6
        if let Ok(socket) = NetSocket::bind("[::1]:0".parse().unwrap()) {
            let addr = socket.local_addr().unwrap();
            assert!(addr.is_ipv6());
        }
    }
}
