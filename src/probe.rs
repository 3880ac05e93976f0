//! Round-trip-time probe.
//!
//! Connects to a relay or echo endpoint, sends one request frame at a
//! time and times how long the response frame takes to come back. The
//! first `warmup` exchanges absorb connection setup effects and are not
//! recorded.

use crate::codec;
use crate::config::ProbeConfig;
use crate::error::RelayError;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run the probe until `samples` RTTs are recorded or `cancel` fires.
///
/// Returns the samples gathered so far in either case.
pub async fn run(config: &ProbeConfig, cancel: CancellationToken) -> Result<Vec<Duration>, RelayError> {
    let mut stream =
        TcpStream::connect(&config.target)
            .await
            .map_err(|source| RelayError::Connect {
                addr: config.target.clone(),
                source,
            })?;
    info!(
        target = %config.target,
        samples = config.samples,
        payload_size = config.payload_size,
        "Probe connected"
    );

    let mut rtts = Vec::with_capacity(config.samples);
    let mut payload = vec![0u8; config.payload_size];
    let mut seq: u64 = 0;

    while rtts.len() < config.samples {
        fill_payload(&mut payload, seq);

        let exchange = async {
            let sent = Instant::now();
            codec::write_frame(&mut stream, &payload).await?;
            codec::decode(&mut stream, None).await?;
            Ok::<_, RelayError>(sent.elapsed())
        };
        let rtt = tokio::select! {
            _ = cancel.cancelled() => break,
            rtt = exchange => rtt?,
        };

        if seq >= config.warmup as u64 {
            rtts.push(rtt);
        }
        seq += 1;

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.interval) => {}
        }
    }

    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "Probe shutdown");
    }
    info!(recorded = rtts.len(), "Probe finished");
    Ok(rtts)
}

/// Fill `payload` with bytes derived from the sequence number so that
/// consecutive requests differ.
fn fill_payload(payload: &mut [u8], seq: u64) {
    let mut state = seq.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    for byte in payload.iter_mut() {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *byte = state as u8;
    }
}

/// Render an RTT as fractional milliseconds.
pub fn as_millis(rtt: Duration) -> f64 {
    rtt.as_secs_f64() * 1000.0
}
