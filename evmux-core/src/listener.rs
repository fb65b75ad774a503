//! Non-blocking listener.
//!
//! The listening socket is built with `socket2` so the backlog and
//! reuse-address behavior are explicit, then handed to mio for readiness
//! watching. It is the one long-lived resource of the reactor: registered
//! for read interest at startup and deregistered only at shutdown.

use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{ReactorError, Result};

/// Owns the bound, listening server socket and accepts new connections
/// without ever blocking the caller.
pub struct Acceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Create, configure, bind and start listening on `addr`.
    ///
    /// Failures here are unrecoverable setup errors; everything after a
    /// successful `bind` is non-blocking.
    pub fn bind(addr: SocketAddr, backlog: i32) -> Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(ReactorError::Socket)?;
        socket
            .set_reuse_address(true)
            .map_err(ReactorError::Socket)?;
        socket
            .bind(&addr.into())
            .map_err(|source| ReactorError::Bind { addr, source })?;
        socket
            .listen(backlog)
            .map_err(|source| ReactorError::Listen { addr, source })?;
        socket.set_nonblocking(true).map_err(ReactorError::Socket)?;

        let listener = TcpListener::from_std(socket.into());
        // Re-query the address so binding port 0 reports the assigned port.
        let local_addr = listener.local_addr().map_err(ReactorError::Socket)?;

        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The address the listening socket is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept one pending connection, if any.
    ///
    /// Returns `Ok(None)` when no connection is pending (`WouldBlock` is not
    /// an error). Accepted streams are already in non-blocking mode. Any
    /// other OS failure is returned for the caller to log; the listening
    /// socket stays usable.
    pub fn accept_nonblocking(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            match self.listener.accept() {
                Ok(pair) => return Ok(Some(pair)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// The listening socket as a poll source, for (de)registration.
    pub(crate) fn source_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }
}
