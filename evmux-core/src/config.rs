//! Server configuration.
//!
//! The listening address/port, backlog, poll timeout, event capacity, read
//! buffer size and reply mode are the only external parameters of the
//! reactor. There is no configuration file and no CLI surface.

use std::net::SocketAddr;
use std::time::Duration;

/// What the server sends back after receiving data on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// Discard received bytes, never reply.
    None,

    /// Reply with the literal 3-byte acknowledgment `ack`, once per
    /// readiness event that delivered data.
    Ack,

    /// Reply with the received bytes themselves.
    Echo,
}

/// Configuration for a [`crate::Reactor`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the listening socket binds to.
    pub addr: SocketAddr,

    /// Listen backlog passed to the OS.
    pub backlog: i32,

    /// Upper bound on a single blocking wait in the event loop. The loop
    /// performs housekeeping (shutdown-flag check) at least this often even
    /// with no I/O activity.
    pub poll_timeout: Duration,

    /// Capacity of the event buffer handed to the readiness context.
    pub events_capacity: usize,

    /// Size of the bounded non-blocking reads performed by the read handler.
    pub read_buffer_size: usize,

    /// Reply behavior.
    pub reply: ReplyMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backlog: 128,
            poll_timeout: Duration::from_secs(1),
            events_capacity: 1024,
            read_buffer_size: 1024,
            reply: ReplyMode::Ack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.backlog, 128);
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert_eq!(config.events_capacity, 1024);
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.reply, ReplyMode::Ack);
    }
}
