//! hop-relay: a measurable hop between an RTT client and an echo endpoint
//!
//! Three modes share one framing protocol (4-byte big-endian length
//! followed by the payload):
//! - `relay`: accept exactly one client, connect to the upstream, and
//!   forward frames in both directions until either side closes
//! - `echo`: answer every request frame with one response frame
//! - `probe`: measure round-trip times against a relay or echo endpoint
//!
//! Configuration via CLI arguments or TOML file.

mod codec;
mod config;
mod echo;
mod error;
mod listener;
mod probe;
mod pump;
mod session;
#[cfg(test)]
mod testing;

use config::{Config, EchoConfig, Mode, ProbeConfig, RelayConfig};
use pump::Direction;
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match config.mode {
        Mode::Relay(relay) => runtime.block_on(run_relay(relay)),
        Mode::Echo(echo) => runtime.block_on(run_echo(echo)),
        Mode::Probe(probe) => runtime.block_on(run_probe(probe)),
    }
}

/// Serve one relay session, stopping it on Ctrl-C.
async fn run_relay(config: RelayConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        upstream = %config.upstream,
        max_frame_len = ?config.max_frame_len,
        "Starting hop-relay"
    );

    let listener = listener::Listener::bind(&config).await?;
    info!(
        address = %listener.local_addr(),
        state = %listener.state(),
        "Waiting for a client"
    );
    let session = tokio::select! {
        accepted = listener.accept() => accepted?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted before a client connected");
            return Ok(());
        }
    };

    tokio::select! {
        _ = session.closed() => {}
        _ = tokio::signal::ctrl_c() => {
            info!(
                state = %session.state(),
                client_to_upstream = ?session.pump(Direction::ClientToUpstream).state(),
                upstream_to_client = ?session.pump(Direction::UpstreamToClient).state(),
                "Interrupt received"
            );
            session.stop().await;
        }
    }

    let report = session.wait().await?;
    info!(
        bytes_up = report.client_to_upstream.bytes,
        bytes_down = report.upstream_to_client.bytes,
        "Relay finished"
    );
    Ok(())
}

/// Run the echo endpoint until Ctrl-C.
async fn run_echo(config: EchoConfig) -> Result<(), Box<dyn std::error::Error>> {
    let server = echo::EchoServer::bind(config).await?;
    let cancel = shutdown_on_interrupt();
    server.serve(cancel).await;
    Ok(())
}

/// Probe the target and print one RTT in milliseconds per line.
async fn run_probe(config: ProbeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = shutdown_on_interrupt();
    let rtts = probe::run(&config, cancel).await?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for rtt in rtts {
        writeln!(out, "{}", probe::as_millis(rtt))?;
    }
    out.flush()?;
    Ok(())
}

/// A token that is cancelled on the first Ctrl-C.
fn shutdown_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            token.cancel();
        }
    });
    cancel
}
