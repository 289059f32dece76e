//! Minimal UDP socket wrapper for RTP-MIDI sessions.

use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::Error;

/// Error type for socket operations.
#[derive(Debug)]
pub enum SocketError {
    /// Address already bound by another socket
    AddrInUse(SocketAddr),
    /// Underlying I/O error
    Io(io::Error),
}

impl SocketError {
    /// Check whether this is a read timeout rather than a failure
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Io(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }
}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddrInUse(addr) => write!(f, "address {addr} already in use"),
            Self::Io(err) => write!(f, "socket I/O error: {err}"),
        }
    }
}

impl std::error::Error for SocketError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::AddrInUse(_) => None,
            Self::Io(err) => Some(err),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<SocketError> for Error {
    fn from(err: SocketError) -> Self {
        match err {
            SocketError::AddrInUse(addr) => Self::PortInUse { port: addr.port() },
            SocketError::Io(err) => Self::Io(err),
        }
    }
}

/// Binding for a UDP socket.
#[derive(Debug, Clone)]
pub struct SocketBinding {
    socket: Arc<UdpSocket>,
}

impl SocketBinding {
    /// Bind to the provided address.
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let socket = UdpSocket::bind(addr).map_err(|err| match err.kind() {
            io::ErrorKind::AddrInUse => SocketError::AddrInUse(addr),
            _ => SocketError::Io(err),
        })?;
        socket.set_nonblocking(false)?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Set socket read timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Send bytes to a remote address.
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.socket.send_to(buf, addr)?)
    }

    /// Receive bytes into the provided buffer.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        Ok(self.socket.recv_from(buf)?)
    }

    /// Access the local address for this binding.
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.socket.local_addr()?)
    }
}
