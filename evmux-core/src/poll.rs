//! Readiness-notification context.
//!
//! [`Poller`] is a thin wrapper over [`mio::Poll`] exposing exactly the
//! capability surface the reactor needs: `register`, `reregister`,
//! `deregister` and a bounded `wait`. The interest set it maintains is the
//! authoritative record of which sockets are watched for which conditions;
//! the reactor pairs every registration with a connection-table entry and
//! every deregistration with that entry's removal.

use std::io;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

/// The OS readiness context (epoll on Linux, kqueue on the BSDs).
pub struct Poller {
    poll: Poll,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self { poll: Poll::new()? })
    }

    /// Start watching `source` for `interest` under `token`.
    pub fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().register(source, token, interest)
    }

    /// Change the interest an already-watched `source` is registered for.
    pub fn reregister<S>(&self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().reregister(source, token, interest)
    }

    /// Stop watching `source`. The caller is responsible for also releasing
    /// the socket and dropping its table entry.
    pub fn deregister<S>(&self, source: &mut S) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll.registry().deregister(source)
    }

    /// Block until at least one readiness event arrives or `timeout`
    /// elapses. Interrupted waits are retried.
    pub fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        loop {
            match self.poll.poll(events, timeout) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Create a waker that forces a wait in progress on this context to
    /// return, delivering an event for `token`.
    pub fn waker(&self, token: Token) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_honors_timeout_when_idle() {
        let mut poller = Poller::new().unwrap();
        let mut events = Events::with_capacity(8);

        let start = Instant::now();
        poller
            .wait(&mut events, Some(Duration::from_millis(50)))
            .unwrap();
        let elapsed = start.elapsed();

        assert!(events.is_empty());
        // Must come back within the timeout plus scheduling slack.
        assert!(elapsed < Duration::from_millis(500), "wait took {elapsed:?}");
    }

    #[test]
    fn test_waker_interrupts_wait() {
        let mut poller = Poller::new().unwrap();
        let waker = poller.waker(Token(7)).unwrap();
        let mut events = Events::with_capacity(8);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.wake().unwrap();
        });

        poller
            .wait(&mut events, Some(Duration::from_secs(5)))
            .unwrap();

        let tokens: Vec<Token> = events.iter().map(|e| e.token()).collect();
        assert_eq!(tokens, vec![Token(7)]);

        handle.join().unwrap();
    }
}
