//! Relay session: one client socket, one upstream socket, two pumps.
//!
//! State machine:
//!
//! ```text
//! Idle -> Listening -> Connected -> Relaying -> Closing -> Closed
//! ```
//!
//! `Idle`/`Listening` are driven by the listener. Once both sockets are
//! connected the session starts one pump per direction and a supervisor
//! task. The supervisor moves to `Closing` when either pump stops or a stop
//! is requested, cancels whatever is still running, then shuts down and
//! closes each socket exactly once. Ownership enforces the "exactly once":
//! the pumps hand their halves back, the supervisor reunites and drops them.

use crate::pump::{Direction, Pump, PumpExit, PumpHandle, PumpMonitor, PumpOutcome};
use socket2::SockRef;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

/// Lifecycle of a relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Listening,
    Connected,
    Relaying,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Listening => "listening",
            SessionState::Connected => "connected",
            SessionState::Relaying => "relaying",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Tunables applied to both pumps of a session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Upper bound on a declared frame length; `None` means unbounded.
    pub max_frame_len: Option<u32>,
    /// How long the surviving pump may keep draining after its peer stops.
    pub drain_grace: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_frame_len: None,
            drain_grace: Duration::from_millis(250),
        }
    }
}

/// What moved the session from `Relaying` to `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseTrigger {
    /// A pump stopped on its own.
    PumpStopped(Direction),
    /// `stop()` was called.
    Stop,
}

/// Final accounting for one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpSummary {
    pub exit: PumpExit,
    pub frames: u64,
    pub bytes: u64,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub trigger: CloseTrigger,
    pub client_to_upstream: PumpSummary,
    pub upstream_to_client: PumpSummary,
}

/// A connected client/upstream pair, ready to relay.
pub struct RelaySession {
    client: TcpStream,
    client_addr: SocketAddr,
    upstream: TcpStream,
    upstream_addr: SocketAddr,
    state: watch::Sender<SessionState>,
    options: SessionOptions,
}

impl RelaySession {
    /// Wrap two connected sockets. `state` is the channel the listener has
    /// been driving; it is moved to `Connected`.
    pub fn new(
        client: TcpStream,
        upstream: TcpStream,
        state: watch::Sender<SessionState>,
        options: SessionOptions,
    ) -> io::Result<Self> {
        let client_addr = client.peer_addr()?;
        let upstream_addr = upstream.peer_addr()?;
        state.send_replace(SessionState::Connected);
        Ok(Self {
            client,
            client_addr,
            upstream,
            upstream_addr,
            state,
            options,
        })
    }

    /// Start both pumps and the supervisor; the session is `Relaying` on return.
    pub fn start(self) -> SessionHandle {
        let cancel = CancellationToken::new();
        let (client_read, client_write) = self.client.into_split();
        let (upstream_read, upstream_write) = self.upstream.into_split();

        let outbound = Pump::new(
            Direction::ClientToUpstream,
            client_read,
            upstream_write,
            cancel.child_token(),
            self.options.max_frame_len,
        )
        .spawn();
        let inbound = Pump::new(
            Direction::UpstreamToClient,
            upstream_read,
            client_write,
            cancel.child_token(),
            self.options.max_frame_len,
        )
        .spawn();

        self.state.send_replace(SessionState::Relaying);
        info!(
            client = %self.client_addr,
            upstream = %self.upstream_addr,
            "Relaying"
        );

        let client_to_upstream = outbound.monitor().clone();
        let upstream_to_client = inbound.monitor().clone();
        let state = self.state.subscribe();

        let supervisor = Supervisor {
            outbound,
            inbound,
            cancel: cancel.clone(),
            state: self.state,
            drain_grace: self.options.drain_grace,
        };

        SessionHandle {
            state,
            guard: cancel.clone().drop_guard(),
            cancel,
            client_to_upstream,
            upstream_to_client,
            task: tokio::spawn(supervisor.run()),
        }
    }
}

struct Supervisor {
    outbound: PumpHandle,
    inbound: PumpHandle,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    drain_grace: Duration,
}

impl Supervisor {
    async fn run(mut self) -> SessionReport {
        let mut outbound = None;
        let mut inbound = None;

        // Cancelled pumps finish promptly, so check the stop request first.
        let trigger = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => CloseTrigger::Stop,
            done = self.outbound.join() => {
                outbound = Some(done);
                CloseTrigger::PumpStopped(Direction::ClientToUpstream)
            }
            done = self.inbound.join() => {
                inbound = Some(done);
                CloseTrigger::PumpStopped(Direction::UpstreamToClient)
            }
        };

        self.state.send_replace(SessionState::Closing);
        debug!(trigger = ?trigger, "Session closing");

        let grace = match trigger {
            CloseTrigger::Stop => Duration::ZERO,
            CloseTrigger::PumpStopped(_) => self.drain_grace,
        };

        let outbound = match outbound {
            Some(done) => done,
            None => finish(&mut self.outbound, grace, &self.cancel).await,
        };
        let inbound = match inbound {
            Some(done) => done,
            None => finish(&mut self.inbound, grace, &self.cancel).await,
        };

        let report = SessionReport {
            trigger,
            client_to_upstream: summarize(self.outbound.monitor(), &outbound),
            upstream_to_client: summarize(self.inbound.monitor(), &inbound),
        };

        match (outbound, inbound) {
            (Ok(outbound), Ok(inbound)) => {
                release(outbound.source, inbound.destination, "client");
                release(inbound.source, outbound.destination, "upstream");
            }
            _ => warn!("Pump task aborted; its socket halves were dropped with it"),
        }

        self.state.send_replace(SessionState::Closed);
        let idle_ms = |monitor: &PumpMonitor| {
            monitor
                .stats()
                .last_receipt_timestamp()
                .map(|at| at.elapsed().as_millis())
        };
        info!(
            trigger = ?report.trigger,
            client_to_upstream = ?report.client_to_upstream.exit,
            upstream_to_client = ?report.upstream_to_client.exit,
            frames_up = report.client_to_upstream.frames,
            frames_down = report.upstream_to_client.frames,
            idle_up_ms = ?idle_ms(self.outbound.monitor()),
            idle_down_ms = ?idle_ms(self.inbound.monitor()),
            "Session closed"
        );

        report
    }
}

/// Let a pump drain for up to `grace`, then cancel it and wait.
async fn finish(
    pump: &mut PumpHandle,
    grace: Duration,
    cancel: &CancellationToken,
) -> Result<PumpOutcome, JoinError> {
    if !grace.is_zero() {
        tokio::select! {
            done = pump.join() => return done,
            _ = tokio::time::sleep(grace) => {}
            _ = cancel.cancelled() => {}
        }
    }
    pump.cancel();
    pump.join().await
}

fn summarize(monitor: &PumpMonitor, outcome: &Result<PumpOutcome, JoinError>) -> PumpSummary {
    let exit = match outcome {
        Ok(outcome) => outcome.exit.clone(),
        Err(_) => PumpExit::Aborted,
    };
    PumpSummary {
        exit,
        frames: monitor.stats().frames(),
        bytes: monitor.stats().bytes(),
    }
}

/// Reunite the two halves of a socket, shut it down and close it.
fn release(read: OwnedReadHalf, write: OwnedWriteHalf, side: &'static str) {
    let stream = match read.reunite(write) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(side, error = %e, "Socket halves do not match");
            return;
        }
    };

    if let Err(e) = SockRef::from(&stream).shutdown(Shutdown::Both) {
        if e.kind() != io::ErrorKind::NotConnected {
            debug!(side, error = %e, "Socket shutdown failed");
        }
    }
    drop(stream);
    debug!(side, "Socket closed");
}

/// Control handle for a running session.
///
/// Dropping the handle stops the session.
pub struct SessionHandle {
    state: watch::Receiver<SessionState>,
    cancel: CancellationToken,
    guard: DropGuard,
    client_to_upstream: PumpMonitor,
    upstream_to_client: PumpMonitor,
    task: JoinHandle<SessionReport>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn pump(&self, direction: Direction) -> &PumpMonitor {
        match direction {
            Direction::ClientToUpstream => &self.client_to_upstream,
            Direction::UpstreamToClient => &self.upstream_to_client,
        }
    }

    /// Resolve once the session reaches `Closed`.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        // An error means the supervisor is gone, which only happens after Closed
        // or a panic; either way there is nothing left to wait for.
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }

    /// Cancel the session and wait until it is `Closed`. No-op once closed.
    pub async fn stop(&self) {
        if self.state() == SessionState::Closed {
            return;
        }
        info!("Stopping session");
        self.cancel.cancel();
        self.closed().await;
    }

    /// Wait for the supervisor and return the final report.
    pub async fn wait(self) -> Result<SessionReport, JoinError> {
        let SessionHandle { guard, task, .. } = self;
        let report = task.await;
        guard.disarm();
        report
    }
}
