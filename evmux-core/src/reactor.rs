//! The event loop.
//!
//! One thread, one readiness context. The reactor owns the listener, the
//! connection table and the interest set; nothing else is permitted to
//! touch them. Every loop iteration performs one bounded wait and
//! dispatches the ready events; all socket operations stay non-blocking so
//! no handler can stall the other connections.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Events, Interest, Token, Waker};
use slab::Slab;

use crate::config::ServerConfig;
use crate::conn::{Connection, Verdict};
use crate::error::{ReactorError, Result};
use crate::listener::Acceptor;
use crate::poll::Poller;

/// Token reserved for the listening socket.
const LISTENER: Token = Token(0);

/// Token reserved for the shutdown waker.
const WAKER: Token = Token(1);

/// Connection-table keys are offset past the reserved tokens.
const TOKEN_BASE: usize = 2;

/// Aggregate diagnostics. Byte totals cover connections that have completed
/// teardown; none of this feeds back into control flow.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReactorStats {
    /// Connections accepted since startup.
    pub accepted: u64,

    /// Connections fully torn down since startup.
    pub closed: u64,

    /// Bytes received on closed connections.
    pub bytes_in: u64,

    /// Bytes sent on closed connections.
    pub bytes_out: u64,
}

/// Cooperative stop signal for a running reactor. Usable from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the reactor to stop. The flag is observed at the top of the next
    /// loop iteration; the waker forces one immediately if the reactor is
    /// mid-wait, so stop latency is not bounded by the poll timeout.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            tracing::debug!("shutdown wake failed: {e}");
        }
    }
}

/// Single-threaded readiness reactor.
///
/// Multiplexes the listening socket and every accepted connection over one
/// OS readiness context. The connection table maps poll tokens to
/// [`Connection`] state; the invariant throughout is that a socket is in
/// the table if and only if it is registered with the poll context.
pub struct Reactor {
    config: ServerConfig,
    poller: Poller,
    acceptor: Acceptor,
    conns: Slab<Connection>,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
    stats: ReactorStats,
}

impl Reactor {
    /// Bind the listening socket and set up the readiness context.
    ///
    /// These are the only unrecoverable failures; once `new` returns, all
    /// further errors are handled inside the loop.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let mut acceptor = Acceptor::bind(config.addr, config.backlog)?;

        let poller = Poller::new().map_err(ReactorError::PollCreate)?;
        poller
            .register(acceptor.source_mut(), LISTENER, Interest::READABLE)
            .map_err(|source| ReactorError::Register {
                what: "listener",
                source,
            })?;
        let waker = Arc::new(poller.waker(WAKER).map_err(|source| ReactorError::Register {
            what: "waker",
            source,
        })?);

        tracing::info!("listening on {}", acceptor.local_addr());

        Ok(Self {
            config,
            poller,
            acceptor,
            conns: Slab::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
            stats: ReactorStats::default(),
        })
    }

    /// The address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Number of live entries in the connection table.
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Aggregate diagnostics.
    pub fn stats(&self) -> ReactorStats {
        self.stats
    }

    /// A handle that stops the loop cooperatively.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Run the event loop until a shutdown is requested, then close every
    /// in-flight connection cleanly and deregister the listener.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(self.config.events_capacity);
        let mut scratch = vec![0u8; self.config.read_buffer_size];

        while !self.shutdown.load(Ordering::Acquire) {
            self.tick(&mut events, &mut scratch)?;
        }

        self.teardown_all();
        Ok(())
    }

    /// One loop iteration: a bounded wait followed by dispatch of every
    /// readiness event returned.
    pub(crate) fn tick(&mut self, events: &mut Events, scratch: &mut [u8]) -> Result<()> {
        self.poller
            .wait(events, Some(self.config.poll_timeout))
            .map_err(ReactorError::Wait)?;

        for event in events.iter() {
            match event.token() {
                LISTENER => self.accept_pending(),
                WAKER => {} // shutdown flag is checked at the top of run()
                token => self.dispatch(token, event, scratch),
            }
        }

        Ok(())
    }

    /// Drain the accept queue; one readiness event may cover several
    /// pending connections.
    fn accept_pending(&mut self) {
        loop {
            match self.acceptor.accept_nonblocking() {
                Ok(Some((stream, peer))) => self.register_connection(stream, peer),
                Ok(None) => break,
                Err(e) => {
                    // Fatal for this accept only; existing connections and
                    // the listening socket keep serving.
                    tracing::warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn register_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let key = self.conns.insert(Connection::new(stream, peer));
        let token = Token(key + TOKEN_BASE);

        let conn = &mut self.conns[key];
        if let Err(e) = self
            .poller
            .register(conn.stream_mut(), token, Interest::READABLE)
        {
            // The table entry must not outlive a failed registration.
            tracing::warn!("failed to register connection from {peer}: {e}");
            self.conns.remove(key);
            return;
        }

        self.stats.accepted += 1;
        tracing::debug!("accepted connection from {peer}");
    }

    fn dispatch(&mut self, token: Token, event: &mio::event::Event, scratch: &mut [u8]) {
        let key = token.0 - TOKEN_BASE;
        let Some(conn) = self.conns.get_mut(key) else {
            // Stale event for a connection torn down earlier in this cycle.
            return;
        };

        let verdict = if event.is_error() {
            Verdict::Close
        } else if event.is_readable() || event.is_read_closed() {
            conn.on_readable(scratch, self.config.reply)
        } else if event.is_writable() && conn.interest() == Interest::WRITABLE {
            conn.on_writable()
        } else if event.is_write_closed() {
            Verdict::Close
        } else {
            Verdict::Continue
        };

        match verdict {
            Verdict::Continue => {}
            Verdict::Rearm(interest) => {
                conn.set_interest(interest);
                if let Err(e) = self.poller.reregister(conn.stream_mut(), token, interest) {
                    tracing::warn!("failed to change interest for {}: {e}", conn.peer());
                    self.close_connection(key);
                }
            }
            Verdict::Close => self.close_connection(key),
        }
    }

    /// The single teardown path for every terminal condition: deregister
    /// from the interest set, release the socket, remove the table entry.
    /// These three must never be separated.
    fn close_connection(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        if let Err(e) = self.poller.deregister(conn.stream_mut()) {
            tracing::warn!("failed to deregister {}: {e}", conn.peer());
        }

        let conn = self.conns.remove(key);
        self.stats.closed += 1;
        self.stats.bytes_in += conn.bytes_in();
        self.stats.bytes_out += conn.bytes_out();
        tracing::debug!(
            "closed connection from {} ({} bytes in, {} bytes out)",
            conn.peer(),
            conn.bytes_in(),
            conn.bytes_out()
        );
        // Dropping the stream releases the descriptor.
    }

    /// Shutdown path: close in-flight connections cleanly rather than
    /// abandoning them, then deregister the listener.
    fn teardown_all(&mut self) {
        let keys: Vec<usize> = self.conns.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.close_connection(key);
        }

        if let Err(e) = self.poller.deregister(self.acceptor.source_mut()) {
            tracing::warn!("failed to deregister listener: {e}");
        }

        tracing::info!(
            "reactor stopped ({} connections accepted, {} closed)",
            self.stats.accepted,
            self.stats.closed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplyMode;
    use std::io::{Read, Write};
    use std::net::{Shutdown, TcpStream as StdTcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    fn test_config() -> ServerConfig {
        ServerConfig {
            addr: "127.0.0.1:0".parse().unwrap(),
            poll_timeout: Duration::from_millis(100),
            ..ServerConfig::default()
        }
    }

    /// Run a reactor on its own thread; joining returns it for inspection.
    fn start_reactor(
        config: ServerConfig,
    ) -> (SocketAddr, ShutdownHandle, thread::JoinHandle<Reactor>) {
        let mut reactor = Reactor::new(config).unwrap();
        let addr = reactor.local_addr();
        let handle = reactor.shutdown_handle();
        let join = thread::spawn(move || {
            reactor.run().unwrap();
            reactor
        });
        (addr, handle, join)
    }

    fn ack_round_trip(addr: SocketAddr, payload: &[u8]) {
        let mut stream = StdTcpStream::connect(addr).unwrap();
        stream.write_all(payload).unwrap();
        let mut reply = [0u8; 3];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ack");
    }

    fn wait_for(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    /// Open descriptor count for the current process. Only meaningful on
    /// Linux; callers gate on the platform.
    fn open_fds() -> usize {
        std::fs::read_dir("/proc/self/fd").unwrap().count()
    }

    #[test]
    fn test_each_client_gets_exactly_one_ack() {
        let (addr, handle, join) = start_reactor(test_config());

        let clients: Vec<_> = (0..8)
            .map(|i| {
                thread::spawn(move || {
                    let mut stream = StdTcpStream::connect(addr).unwrap();
                    stream
                        .write_all(format!("client-{i}").as_bytes())
                        .unwrap();

                    let mut reply = [0u8; 3];
                    stream.read_exact(&mut reply).unwrap();
                    assert_eq!(&reply, b"ack");

                    // No duplicated acknowledgment may follow.
                    stream
                        .set_read_timeout(Some(Duration::from_millis(200)))
                        .unwrap();
                    let mut extra = [0u8; 8];
                    match stream.read(&mut extra) {
                        Ok(n) => panic!("unexpected {n} extra bytes"),
                        Err(e) => assert!(matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        )),
                    }
                })
            })
            .collect();

        for client in clients {
            client.join().unwrap();
        }

        handle.shutdown();
        let reactor = join.join().unwrap();
        assert_eq!(reactor.stats().accepted, 8);
    }

    #[test]
    fn test_eof_triggers_full_teardown() {
        let (addr, handle, join) = start_reactor(test_config());

        let baseline = if cfg!(target_os = "linux") {
            open_fds()
        } else {
            0
        };

        for _ in 0..32 {
            // Dropping the stream sends EOF; the server must deregister,
            // release the descriptor and drop the table entry.
            ack_round_trip(addr, b"ping");
        }

        if cfg!(target_os = "linux") {
            // Slack of a few descriptors tolerates concurrently running
            // tests; a real per-connection leak shows up as +32.
            assert!(
                wait_for(|| open_fds() <= baseline + 4, Duration::from_secs(5)),
                "descriptors leaked: {} vs baseline {}",
                open_fds(),
                baseline
            );
        } else {
            thread::sleep(Duration::from_millis(300));
        }

        handle.shutdown();
        let reactor = join.join().unwrap();
        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(reactor.stats().accepted, 32);
        assert_eq!(reactor.stats().closed, 32);
    }

    #[test]
    fn test_half_close_leaves_other_clients_unaffected() {
        let (addr, handle, join) = start_reactor(test_config());

        // B connects first and stays quiet.
        let mut b = StdTcpStream::connect(addr).unwrap();

        let mut a = StdTcpStream::connect(addr).unwrap();
        a.write_all(b"hello").unwrap();
        let mut reply = [0u8; 3];
        a.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ack");
        a.shutdown(Shutdown::Write).unwrap();

        // The server tears A down; its close arrives as EOF on our side.
        let mut rest = Vec::new();
        a.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());

        // B is unaffected and can still do a full round trip.
        b.write_all(b"still here").unwrap();
        b.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ack");

        handle.shutdown();
        let reactor = join.join().unwrap();
        assert_eq!(reactor.stats().accepted, 2);
    }

    #[test]
    fn test_echo_partial_writes_complete_byte_for_byte() {
        let (addr, handle, join) = start_reactor(ServerConfig {
            reply: ReplyMode::Echo,
            ..test_config()
        });

        let payload: Vec<u8> = (0..1_048_576).map(|i| (i % 249) as u8).collect();

        let mut stream = StdTcpStream::connect(addr).unwrap();
        let mut reader = stream.try_clone().unwrap();

        // Writer on its own thread so the echo stream drains concurrently;
        // otherwise both sides block on full socket buffers. The write side
        // stays open until the echo is fully received, since EOF is a
        // terminal condition for the server.
        let expected = payload.clone();
        let writer = thread::spawn(move || {
            stream.write_all(&expected).unwrap();
            stream
        });

        let mut echoed = Vec::with_capacity(payload.len());
        let mut buf = [0u8; 65536];
        while echoed.len() < payload.len() {
            let n = reader.read(&mut buf).unwrap();
            assert!(n > 0, "echo stream ended early at {} bytes", echoed.len());
            echoed.extend_from_slice(&buf[..n]);
        }

        let stream = writer.join().unwrap();
        assert_eq!(echoed, payload);
        drop(stream);
        drop(reader);

        handle.shutdown();
        join.join().unwrap();
    }

    #[test]
    fn test_shutdown_wakes_blocked_wait() {
        // A long poll timeout: prompt shutdown proves the waker works.
        let (_addr, handle, join) = start_reactor(ServerConfig {
            poll_timeout: Duration::from_secs(5),
            ..test_config()
        });

        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        handle.shutdown();
        join.join().unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_idle_tick_is_bounded_by_timeout() {
        let mut reactor = Reactor::new(ServerConfig {
            poll_timeout: Duration::from_millis(50),
            ..test_config()
        })
        .unwrap();

        let mut events = Events::with_capacity(16);
        let mut scratch = vec![0u8; 1024];

        for _ in 0..3 {
            let start = Instant::now();
            reactor.tick(&mut events, &mut scratch).unwrap();
            assert!(
                start.elapsed() < Duration::from_millis(500),
                "idle iteration exceeded the wait bound"
            );
        }
    }

    #[test]
    fn test_sequential_cycles_leak_nothing() {
        let (addr, handle, join) = start_reactor(test_config());

        let baseline = if cfg!(target_os = "linux") {
            open_fds()
        } else {
            0
        };

        for _ in 0..1000 {
            ack_round_trip(addr, b"cycle");
        }

        if cfg!(target_os = "linux") {
            assert!(
                wait_for(|| open_fds() <= baseline + 4, Duration::from_secs(10)),
                "descriptors leaked after 1000 cycles: {} vs baseline {}",
                open_fds(),
                baseline
            );
        } else {
            thread::sleep(Duration::from_millis(500));
        }

        handle.shutdown();
        let reactor = join.join().unwrap();
        assert_eq!(reactor.connection_count(), 0);
        assert_eq!(reactor.stats().accepted, 1000);
        assert_eq!(reactor.stats().closed, 1000);
    }

    #[test]
    fn test_stats_account_for_closed_connections() {
        let (addr, handle, join) = start_reactor(test_config());

        ack_round_trip(addr, b"hello");

        // Let the EOF-driven teardown land before stopping.
        thread::sleep(Duration::from_millis(300));
        handle.shutdown();
        let reactor = join.join().unwrap();

        let stats = reactor.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.bytes_in, 5);
        assert_eq!(stats.bytes_out, 3);
    }
}
