//! Error types.
//!
//! Only unrecoverable setup failures are surfaced through [`ReactorError`].
//! Per-connection I/O errors (would-block, partial I/O, peer resets) never
//! propagate out of the event loop; they are resolved locally by the
//! connection handlers.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Unrecoverable failures while setting up or driving the reactor.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Socket creation or configuration failed.
    #[error("failed to configure listening socket: {0}")]
    Socket(#[source] io::Error),

    /// Binding the listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },

    /// Putting the bound socket into listening mode failed.
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        source: io::Error,
    },

    /// The readiness context could not be created.
    #[error("failed to create poll context: {0}")]
    PollCreate(#[source] io::Error),

    /// A long-lived resource could not be registered with the readiness
    /// context.
    #[error("failed to register {what} with poll context: {source}")]
    Register {
        what: &'static str,
        source: io::Error,
    },

    /// Waiting on the readiness context failed.
    #[error("poll wait failed: {0}")]
    Wait(#[source] io::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReactorError>;
