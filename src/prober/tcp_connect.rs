use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::SocketAddrV4;

use super::ProbeError;

/// Opens the single connection a probe polls.
pub trait Connect: Send + Sync {
    /// Starts connecting and returns without waiting for the handshake.
    fn initiate(&self, addr: SocketAddrV4) -> Result<Box<dyn PendingConnection>, ProbeError>;
}

/// A connection attempt in flight. Dropping it closes the socket.
pub trait PendingConnection: Send {
    /// Non-blocking readiness check. `Err` once the attempt has definitely failed.
    fn is_connected(&mut self) -> Result<bool, ProbeError>;
}

pub struct NonBlockingConnector;

impl Connect for NonBlockingConnector {
    fn initiate(&self, addr: SocketAddrV4) -> Result<Box<dyn PendingConnection>, ProbeError> {
        let fail = |source: io::Error| ProbeError::ConnectionError { addr, source };

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(fail)?;
        socket.set_nonblocking(true).map_err(fail)?;

        match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(fail(e)),
        }

        tracing::debug!(%addr, "tcp connect initiated");
        Ok(Box::new(SocketConnection { socket, addr }))
    }
}

struct SocketConnection {
    socket: Socket,
    addr: SocketAddrV4,
}

impl PendingConnection for SocketConnection {
    fn is_connected(&mut self) -> Result<bool, ProbeError> {
        let addr = self.addr;
        let fail = |source: io::Error| ProbeError::ConnectionError { addr, source };

        // SO_ERROR is set once an in-flight connect is refused or times out
        if let Some(err) = self.socket.take_error().map_err(fail)? {
            return Err(fail(err));
        }

        match self.socket.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(false),
            Err(e) => Err(fail(e)),
        }
    }
}
