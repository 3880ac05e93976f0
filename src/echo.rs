//! Framed echo endpoint.
//!
//! Accepts any number of concurrent clients, one task per connection and no
//! state shared between them. For every request frame it writes exactly one
//! response frame, until the client disconnects.
//!
//! ## Response modes
//!
//! - `Echo`: the request payload, unchanged
//! - `Replicate(n)`: the request payload repeated `n` times
//! - `Fixed(bytes)`: the same configured payload for every request
//!
//! Accepted sockets get TCP keepalive so handles held by silently dead
//! peers are eventually reclaimed.

use crate::codec;
use crate::config::{EchoConfig, KeepaliveConfig};
use crate::error::{FrameError, RelayError};
use bytes::{Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// How the endpoint answers a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoResponse {
    Echo,
    Replicate(usize),
    /// Raw bytes, sent as loaded; no text encoding is applied.
    Fixed(Bytes),
}

impl EchoResponse {
    /// Build the response payload for one request payload.
    ///
    /// Fails with `PayloadTooLarge` when a replicated response would not
    /// fit in one frame.
    pub fn respond(&self, request: Bytes) -> Result<Bytes, FrameError> {
        match self {
            EchoResponse::Echo => Ok(request),
            EchoResponse::Replicate(copies) => {
                if request.is_empty() {
                    return Ok(request);
                }
                let len = request.len().saturating_mul(*copies);
                if u32::try_from(len).is_err() {
                    return Err(FrameError::PayloadTooLarge(len));
                }
                let mut out = BytesMut::with_capacity(len);
                for _ in 0..*copies {
                    out.extend_from_slice(&request);
                }
                Ok(out.freeze())
            }
            EchoResponse::Fixed(payload) => Ok(payload.clone()),
        }
    }
}

/// Echo server instance
pub struct EchoServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    response: Arc<EchoResponse>,
    keepalive: KeepaliveConfig,
    max_frame_len: Option<u32>,
    connection_limit: Arc<Semaphore>,
}

impl EchoServer {
    /// Bind the configured address.
    pub async fn bind(config: EchoConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.listen.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, response = ?config.response, "Echo server listening");

        Ok(Self {
            listener,
            local_addr,
            response: Arc::new(config.response),
            keepalive: config.keepalive,
            max_frame_len: config.max_frame_len,
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `cancel` fires.
    pub async fn serve(self, cancel: CancellationToken) {
        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.connection_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    info!(peer = %addr, "Client connected");
                    if let Err(e) = set_keepalive(&stream, &self.keepalive) {
                        debug!(peer = %addr, error = %e, "Failed to enable keepalive");
                    }

                    let response = Arc::clone(&self.response);
                    let max_frame_len = self.max_frame_len;
                    let cancel = cancel.child_token();

                    tokio::spawn(async move {
                        match handle_connection(stream, response, max_frame_len, cancel).await {
                            Ok(()) => info!(peer = %addr, "Client disconnected"),
                            Err(e) => debug!(peer = %addr, error = %e, "Connection error"),
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
        info!("Echo server stopped");
    }
}

/// Answer request frames on one connection until the client goes away.
async fn handle_connection(
    mut stream: TcpStream,
    response: Arc<EchoResponse>,
    max_frame_len: Option<u32>,
    cancel: CancellationToken,
) -> Result<(), FrameError> {
    let (mut reader, mut writer) = stream.split();

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            decoded = codec::decode(&mut reader, max_frame_len) => match decoded {
                Ok(request) => request,
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(e),
            },
        };

        let reply = response.respond(request)?;
        codec::write_frame(&mut writer, &reply).await?;
    }
}

/// Enable TCP keepalive with the configured idle time, interval and retries.
fn set_keepalive(stream: &TcpStream, config: &KeepaliveConfig) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(config.idle);
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive
        .with_interval(config.interval)
        .with_retries(config.retries);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn echo_config(response: EchoResponse, max_connections: usize) -> EchoConfig {
        EchoConfig {
            listen: "127.0.0.1:0".to_string(),
            max_connections,
            response,
            keepalive: KeepaliveConfig {
                idle: Duration::from_secs(7),
                interval: Duration::from_secs(3),
                retries: 4,
            },
            max_frame_len: None,
        }
    }

    async fn spawn(response: EchoResponse, max_connections: usize) -> (SocketAddr, CancellationToken) {
        let server = EchoServer::bind(echo_config(response, max_connections))
            .await
            .unwrap();
        let addr = server.local_addr();
        let cancel = CancellationToken::new();
        tokio::spawn(server.serve(cancel.clone()));
        (addr, cancel)
    }

    #[test]
    fn test_respond_modes() {
        let request = Bytes::from_static(b"ab");
        assert_eq!(EchoResponse::Echo.respond(request.clone()).unwrap(), request);
        assert_eq!(
            &EchoResponse::Replicate(3).respond(request.clone()).unwrap()[..],
            b"ababab"
        );
        assert_eq!(
            &EchoResponse::Fixed(Bytes::from_static(b"img")).respond(request).unwrap()[..],
            b"img"
        );
    }

    #[test]
    fn test_replicate_oversized_response() {
        let request = Bytes::from_static(b"ab");
        assert!(matches!(
            EchoResponse::Replicate(usize::MAX).respond(request.clone()),
            Err(FrameError::PayloadTooLarge(_))
        ));
        // Fits in usize but not in a 32-bit length prefix.
        assert!(matches!(
            EchoResponse::Replicate(1 << 31).respond(request.clone()),
            Err(FrameError::PayloadTooLarge(_))
        ));
        // Empty requests replicate to an empty response regardless of count.
        assert!(EchoResponse::Replicate(usize::MAX)
            .respond(Bytes::new())
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_echo_round_trips() {
        let (addr, cancel) = spawn(EchoResponse::Echo, 8).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        for payload in [&b"\x01\x02\x03"[..], &b""[..], &[7u8; 20000][..]] {
            codec::write_frame(&mut client, payload).await.unwrap();
            let reply = codec::decode(&mut client, None).await.unwrap();
            assert_eq!(&reply[..], payload);
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_concurrent_clients_are_independent() {
        let (addr, cancel) = spawn(EchoResponse::Replicate(2), 8).await;
        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();

        codec::write_frame(&mut a, b"a").await.unwrap();
        codec::write_frame(&mut b, b"b").await.unwrap();
        assert_eq!(&codec::decode(&mut b, None).await.unwrap()[..], b"bb");
        assert_eq!(&codec::decode(&mut a, None).await.unwrap()[..], b"aa");

        // One client leaving does not affect the other.
        drop(a);
        codec::write_frame(&mut b, b"c").await.unwrap();
        assert_eq!(&codec::decode(&mut b, None).await.unwrap()[..], b"cc");
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_closes_on_truncated_request() {
        use tokio::io::AsyncWriteExt;

        let (addr, cancel) = spawn(EchoResponse::Echo, 8).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0, 0, 0, 9, 1]).await.unwrap();
        client.shutdown().await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (addr, cancel) = spawn(EchoResponse::Echo, 1).await;
        let mut first = TcpStream::connect(addr).await.unwrap();
        codec::write_frame(&mut first, b"1").await.unwrap();
        assert_eq!(&codec::decode(&mut first, None).await.unwrap()[..], b"1");

        // The second client sits in the backlog until the first slot frees up.
        let mut second = TcpStream::connect(addr).await.unwrap();
        codec::write_frame(&mut second, b"2").await.unwrap();
        let waiting =
            tokio::time::timeout(Duration::from_millis(100), codec::decode(&mut second, None)).await;
        assert!(waiting.is_err());

        drop(first);
        let reply = tokio::time::timeout(Duration::from_secs(2), codec::decode(&mut second, None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply[..], b"2");
        cancel.cancel();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_keepalive_applied() {
        let (client, accepted) = crate::testing::tcp_pair().await;
        let config = echo_config(EchoResponse::Echo, 1).keepalive;
        set_keepalive(&accepted, &config).unwrap();

        let sock = SockRef::from(&accepted);
        assert!(sock.keepalive().unwrap());
        assert_eq!(sock.keepalive_time().unwrap(), Duration::from_secs(7));
        assert_eq!(sock.keepalive_interval().unwrap(), Duration::from_secs(3));
        assert_eq!(sock.keepalive_retries().unwrap(), 4);
        drop(client);
    }
}
