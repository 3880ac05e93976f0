//! Error types for the relay.
//!
//! Codec failures are recoverable end-of-stream signals for a pump.
//! Startup failures (bind/accept/connect) are the only errors surfaced
//! to the caller of the listener.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Failure while reading or writing a single frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Peer closed before the length prefix was fully read.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Peer closed after the length prefix but before the full payload.
    #[error("incomplete frame: expected {expected} payload bytes, received {received}")]
    IncompleteFrame { expected: usize, received: usize },

    /// Declared length exceeds the configured bound.
    #[error("frame length {len} exceeds limit {limit}")]
    FrameTooLarge { len: u32, limit: u32 },

    /// Payload does not fit in a 32-bit length prefix.
    #[error("payload of {0} bytes does not fit in a 32-bit length prefix")]
    PayloadTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True for the two clean end-of-stream conditions.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            FrameError::ConnectionClosed | FrameError::IncompleteFrame { .. }
        )
    }
}

/// Fatal errors raised while setting up a relay session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept client on {addr}: {source}")]
    Accept {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
