//! Round-trip latency example for Evmux.
//!
//! Starts an in-process ack server, then measures how long batches of
//! send-then-ack round trips take over a single connection. Each batch is
//! repeated a few times and the best run is reported.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Instant;

use evmux_core::{Reactor, ReactorError, ServerConfig};

const ROUNDS: usize = 3;
const REQUESTS: usize = 1000;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut reactor = Reactor::new(ServerConfig {
        addr: "127.0.0.1:0".parse()?,
        ..ServerConfig::default()
    })?;
    let addr = reactor.local_addr();
    let handle = reactor.shutdown_handle();

    let server = thread::spawn(move || -> Result<Reactor, ReactorError> {
        reactor.run()?;
        Ok(reactor)
    });

    let mut stream = TcpStream::connect(addr)?;
    let mut reply = [0u8; 3];

    let mut durations = Vec::with_capacity(ROUNDS);
    for round in 0..ROUNDS {
        let start = Instant::now();
        for _ in 0..REQUESTS {
            stream.write_all(b"ping")?;
            stream.read_exact(&mut reply)?;
        }
        let millis = start.elapsed().as_secs_f64() * 1000.0;
        println!(
            "round {}: {millis:.3} ms for {REQUESTS} round trips",
            round + 1
        );
        durations.push(millis);
    }

    let best = durations.iter().cloned().fold(f64::INFINITY, f64::min);
    println!("best of {ROUNDS}: {best:.3} ms");

    drop(stream);
    handle.shutdown();
    let reactor = server.join().expect("server thread panicked")?;

    let stats = reactor.stats();
    println!(
        "server accepted {} connections ({} bytes in, {} bytes out)",
        stats.accepted, stats.bytes_in, stats.bytes_out
    );

    Ok(())
}
