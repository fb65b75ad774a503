//! Per-connection state and handlers.
//!
//! A [`Connection`] is exclusively owned by the reactor's connection table.
//! The read/write handlers perform the actual non-blocking I/O and report a
//! [`Verdict`] back to the reactor, which is the only actor permitted to
//! re-register, change interest, or tear the connection down.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use mio::Interest;

use crate::config::ReplyMode;

/// The literal acknowledgment payload.
pub const ACK: &[u8] = b"ack";

/// What the reactor should do with a connection after a handler ran.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// No state change; keep the current interest.
    Continue,

    /// Re-register the connection with a different interest.
    Rearm(Interest),

    /// Terminal. The reactor must deregister the socket, release it, and
    /// remove the table entry as one unit.
    Close,
}

/// One accepted client socket.
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    interest: Interest,
    /// Pending reply remainder; drained from the front as bytes flush.
    out: Vec<u8>,
    bytes_in: u64,
    bytes_out: u64,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            interest: Interest::READABLE,
            out: Vec::new(),
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The interest this connection is currently registered for.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Bytes received over the connection's lifetime. Diagnostics only.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Bytes sent over the connection's lifetime. Diagnostics only.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    pub(crate) fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    pub(crate) fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Read path: drain the socket with bounded non-blocking reads.
    ///
    /// Zero bytes means the peer performed an orderly shutdown of its send
    /// side; that is terminal, as is any error other than would-block. The
    /// drain-until-would-block loop is required under edge-triggered
    /// notification.
    pub(crate) fn on_readable(&mut self, scratch: &mut [u8], reply: ReplyMode) -> Verdict {
        let mut received: u64 = 0;

        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Verdict::Close,
                Ok(n) => {
                    received += n as u64;
                    if reply == ReplyMode::Echo {
                        self.out.extend_from_slice(&scratch[..n]);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Verdict::Close,
            }
        }

        if received == 0 {
            // Spurious wakeup; nothing changed.
            return Verdict::Continue;
        }
        self.bytes_in += received;

        // One acknowledgment per readiness event that delivered data.
        if reply == ReplyMode::Ack {
            self.out.extend_from_slice(ACK);
        }

        if self.out.is_empty() {
            Verdict::Continue
        } else {
            Verdict::Rearm(Interest::WRITABLE)
        }
    }

    /// Write path: flush the pending reply with non-blocking sends.
    ///
    /// A partial send retains write interest and resumes from the unsent
    /// remainder on the next writable event; the remainder is never dropped
    /// or reordered. A full flush returns the connection to read interest.
    pub(crate) fn on_writable(&mut self) -> Verdict {
        while !self.out.is_empty() {
            match self.stream.write(&self.out) {
                Ok(0) => return Verdict::Close,
                Ok(n) => {
                    self.bytes_out += n as u64;
                    self.out.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Verdict::Continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return Verdict::Close,
            }
        }

        Verdict::Rearm(Interest::READABLE)
    }
}
