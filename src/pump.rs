//! Directional pump: forwards frames from one socket to another.
//!
//! A pump decodes one frame at a time from its source read half, stamps
//! the receipt time, re-encodes the payload and writes the whole frame to
//! its destination write half. It stops on peer close, a truncated frame,
//! a read or write failure, or cancellation. None of these are fatal to
//! the session: they are reported as a [`PumpExit`] value.
//!
//! On the way out the pump half-closes its sockets (read side of the
//! source, write side of the destination) so the opposite direction keeps
//! running until it drains, then hands both halves back to its owner.

use crate::codec;
use crate::error::FrameError;
use bytes::BytesMut;
use socket2::SockRef;
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Initial capacity of the per-pump output buffer.
const OUTPUT_BUFFER_SIZE: usize = 16 * 1024;

/// Which way a pump moves frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => write!(f, "client->upstream"),
            Direction::UpstreamToClient => write!(f, "upstream->client"),
        }
    }
}

/// Lifecycle of a pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    /// Forwarding frames.
    Running,
    /// Terminated, half-closing its sockets.
    Draining,
    /// Done; the socket halves have been handed back.
    Stopped,
}

/// Why a pump stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// Source closed cleanly between frames.
    PeerClosed,
    /// Source closed in the middle of a frame.
    IncompleteFrame { expected: usize, received: usize },
    /// Source declared a frame above the configured bound.
    FrameTooLarge { len: u32, limit: u32 },
    /// Reading from the source failed.
    ReadFailed(io::ErrorKind),
    /// Writing to the destination failed.
    WriteFailed(io::ErrorKind),
    /// Cancellation was requested.
    Cancelled,
    /// The pump task panicked or was aborted.
    Aborted,
}

impl PumpExit {
    fn from_read(err: FrameError) -> Self {
        match err {
            FrameError::ConnectionClosed => PumpExit::PeerClosed,
            FrameError::IncompleteFrame { expected, received } => {
                PumpExit::IncompleteFrame { expected, received }
            }
            FrameError::FrameTooLarge { len, limit } => PumpExit::FrameTooLarge { len, limit },
            FrameError::PayloadTooLarge(_) => PumpExit::ReadFailed(io::ErrorKind::InvalidData),
            FrameError::Io(e) => PumpExit::ReadFailed(e.kind()),
        }
    }

    /// True when the source went away, as opposed to a local failure or stop.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            PumpExit::PeerClosed | PumpExit::IncompleteFrame { .. }
        )
    }
}

/// Forwarding counters for one pump.
///
/// Written only by the owning pump; readable from anywhere.
#[derive(Debug)]
pub struct PumpStats {
    epoch: Instant,
    /// Nanoseconds since `epoch` plus one; zero means nothing received yet.
    last_receipt: AtomicU64,
    frames: AtomicU64,
    bytes: AtomicU64,
}

impl PumpStats {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_receipt: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    fn record(&self, payload_len: usize) {
        let offset = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX - 1) + 1;
        self.last_receipt.fetch_max(offset, Ordering::Release);
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(payload_len as u64, Ordering::Relaxed);
    }

    /// When the most recent frame was received, if any.
    pub fn last_receipt_timestamp(&self) -> Option<Instant> {
        match self.last_receipt.load(Ordering::Acquire) {
            0 => None,
            offset => Some(self.epoch + std::time::Duration::from_nanos(offset - 1)),
        }
    }

    /// Number of frames forwarded.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Number of payload bytes forwarded, excluding length prefixes.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl Default for PumpStats {
    fn default() -> Self {
        Self::new()
    }
}

/// What a finished pump hands back to its owner.
#[derive(Debug)]
pub struct PumpOutcome {
    pub exit: PumpExit,
    pub source: OwnedReadHalf,
    pub destination: OwnedWriteHalf,
}

/// Read-only view of a pump's state and counters.
#[derive(Debug, Clone)]
pub struct PumpMonitor {
    state: watch::Receiver<PumpState>,
    stats: Arc<PumpStats>,
}

impl PumpMonitor {
    pub fn state(&self) -> PumpState {
        *self.state.borrow()
    }

    pub fn stats(&self) -> &PumpStats {
        &self.stats
    }
}

/// A unidirectional frame forwarder.
pub struct Pump {
    direction: Direction,
    source: OwnedReadHalf,
    destination: OwnedWriteHalf,
    cancel: CancellationToken,
    max_frame_len: Option<u32>,
    state: watch::Sender<PumpState>,
    stats: Arc<PumpStats>,
}

impl Pump {
    pub fn new(
        direction: Direction,
        source: OwnedReadHalf,
        destination: OwnedWriteHalf,
        cancel: CancellationToken,
        max_frame_len: Option<u32>,
    ) -> Self {
        let (state, _) = watch::channel(PumpState::Running);
        Self {
            direction,
            source,
            destination,
            cancel,
            max_frame_len,
            state,
            stats: Arc::new(PumpStats::new()),
        }
    }

    pub fn monitor(&self) -> PumpMonitor {
        PumpMonitor {
            state: self.state.subscribe(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Run the pump on its own task.
    pub fn spawn(self) -> PumpHandle {
        let monitor = self.monitor();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(self.run());
        PumpHandle {
            monitor,
            cancel,
            task,
        }
    }

    /// Forward frames until termination, then half-close and return the halves.
    pub async fn run(mut self) -> PumpOutcome {
        debug!(direction = %self.direction, "Pump started");

        let exit = self.forward().await;
        self.state.send_replace(PumpState::Draining);
        self.half_close().await;
        self.state.send_replace(PumpState::Stopped);

        if exit.is_disconnect() || exit == PumpExit::Cancelled {
            debug!(
                direction = %self.direction,
                exit = ?exit,
                frames = self.stats.frames(),
                bytes = self.stats.bytes(),
                "Pump stopped"
            );
        } else {
            warn!(direction = %self.direction, exit = ?exit, "Pump failed");
        }

        PumpOutcome {
            exit,
            source: self.source,
            destination: self.destination,
        }
    }

    async fn forward(&mut self) -> PumpExit {
        let mut out = BytesMut::with_capacity(OUTPUT_BUFFER_SIZE);

        loop {
            let payload = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpExit::Cancelled,
                decoded = codec::decode(&mut self.source, self.max_frame_len) => match decoded {
                    Ok(payload) => payload,
                    Err(e) => return PumpExit::from_read(e),
                },
            };

            self.stats.record(payload.len());
            trace!(direction = %self.direction, len = payload.len(), "Frame received");

            out.clear();
            if codec::encode_into(&payload, &mut out).is_err() {
                return PumpExit::WriteFailed(io::ErrorKind::InvalidInput);
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return PumpExit::Cancelled,
                written = self.destination.write_all(&out) => {
                    if let Err(e) = written {
                        return PumpExit::WriteFailed(e.kind());
                    }
                }
            }
        }
    }

    /// Shut down the read side of the source and the write side of the destination.
    async fn half_close(&mut self) {
        let source: &tokio::net::TcpStream = self.source.as_ref();
        if let Err(e) = SockRef::from(source).shutdown(Shutdown::Read) {
            trace!(direction = %self.direction, error = %e, "Source read shutdown");
        }
        if let Err(e) = self.destination.shutdown().await {
            trace!(direction = %self.direction, error = %e, "Destination write shutdown");
        }
    }
}

/// A pump running on its own task.
pub struct PumpHandle {
    monitor: PumpMonitor,
    cancel: CancellationToken,
    task: JoinHandle<PumpOutcome>,
}

impl PumpHandle {
    pub fn monitor(&self) -> &PumpMonitor {
        &self.monitor
    }

    /// Ask the pump to stop; it unblocks from any pending read or write.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the pump task to finish. Cancel safe.
    pub async fn join(&mut self) -> Result<PumpOutcome, JoinError> {
        (&mut self.task).await
    }
}
