//! Acknowledgment server example for Evmux.
//!
//! Runs the reactor with the default configuration: every connection that
//! sends data receives the 3-byte `ack` reply. Press ENTER to stop.

use std::thread;

use evmux_core::{Reactor, ServerConfig};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut reactor = Reactor::new(ServerConfig::default())?;
    println!("ack server listening on {}", reactor.local_addr());
    println!("press ENTER to stop");

    // Cooperative shutdown from a second thread; the reactor itself stays
    // single-threaded.
    let handle = reactor.shutdown_handle();
    thread::spawn(move || {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        handle.shutdown();
    });

    reactor.run()?;

    let stats = reactor.stats();
    println!(
        "served {} connections ({} bytes in, {} bytes out)",
        stats.closed, stats.bytes_in, stats.bytes_out
    );

    Ok(())
}
