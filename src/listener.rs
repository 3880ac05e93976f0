//! Single-use listener that produces one relay session.
//!
//! Binds the listen address, accepts exactly one client, connects exactly
//! once to the upstream and hands both sockets to a [`RelaySession`]. The
//! listen socket is dropped as soon as the client is accepted: there is no
//! accept loop, so serving another client means starting a new listener.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::session::{RelaySession, SessionHandle, SessionOptions, SessionState};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

/// A bound listen socket waiting for its one client.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    upstream: String,
    options: SessionOptions,
    state: watch::Sender<SessionState>,
}

impl Listener {
    /// Bind the configured listen address. Moves the session to `Listening`.
    pub async fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        let (state, _) = watch::channel(SessionState::Idle);

        let bind_err = |source: io::Error| RelayError::Bind {
            addr: config.listen.clone(),
            source,
        };
        let addr = tokio::net::lookup_host(&config.listen)
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| bind_err(io::Error::from(io::ErrorKind::AddrNotAvailable)))?;
        let listener = TcpListener::from_std(create_listener(addr).map_err(bind_err)?)
            .map_err(bind_err)?;
        let local_addr = listener.local_addr()?;

        state.send_replace(SessionState::Listening);
        info!(
            address = %local_addr,
            upstream = %config.upstream,
            "Relay listening"
        );

        Ok(Self {
            listener,
            local_addr,
            upstream: config.upstream.clone(),
            options: config.session_options(),
            state,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Accept the single client, connect upstream and start relaying.
    ///
    /// Consumes the listener; a failure here leaves no session behind.
    pub async fn accept(self) -> Result<SessionHandle, RelayError> {
        let Listener {
            listener,
            local_addr,
            upstream,
            options,
            state,
        } = self;

        let (client, client_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(source) => {
                state.send_replace(SessionState::Closed);
                return Err(RelayError::Accept {
                    addr: local_addr,
                    source,
                });
            }
        };
        drop(listener);
        info!(peer = %client_addr, "Client connected");

        let upstream_stream = match TcpStream::connect(&upstream).await {
            Ok(stream) => stream,
            Err(source) => {
                warn!(upstream = %upstream, error = %source, "Upstream connect failed");
                state.send_replace(SessionState::Closed);
                return Err(RelayError::Connect {
                    addr: upstream,
                    source,
                });
            }
        };
        info!(upstream = %upstream, "Connected to upstream");

        let session = RelaySession::new(client, upstream_stream, state, options)?;
        Ok(session.start())
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR set.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    // Only one client is ever accepted
    socket.listen(1)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::config::EchoConfig;
    use crate::echo::{EchoResponse, EchoServer};
    use crate::testing::closed_port;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn relay_config(upstream: String) -> RelayConfig {
        RelayConfig {
            listen: "127.0.0.1:0".to_string(),
            upstream,
            max_frame_len: None,
            drain_grace: Duration::from_millis(250),
        }
    }

    async fn spawn_echo(cancel: CancellationToken) -> SocketAddr {
        let server = EchoServer::bind(EchoConfig {
            listen: "127.0.0.1:0".to_string(),
            max_connections: 16,
            response: EchoResponse::Echo,
            keepalive: crate::config::KeepaliveConfig {
                idle: Duration::from_secs(1),
                interval: Duration::from_secs(3),
                retries: 5,
            },
            max_frame_len: None,
        })
        .await
        .unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(cancel));
        addr
    }

    #[tokio::test]
    async fn test_listener_states() {
        let listener = Listener::bind(&relay_config("127.0.0.1:1".to_string()))
            .await
            .unwrap();
        assert_eq!(listener.state(), SessionState::Listening);
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = relay_config("127.0.0.1:1".to_string());
        config.listen = taken.local_addr().unwrap().to_string();

        match Listener::bind(&config).await {
            Err(RelayError::Bind { .. }) => {}
            Err(other) => panic!("unexpected: {:?}", other),
            Ok(_) => panic!("bind should have failed"),
        }
    }

    #[tokio::test]
    async fn test_upstream_connect_failure() {
        let upstream = closed_port().await;
        let listener = Listener::bind(&relay_config(upstream.to_string()))
            .await
            .unwrap();
        let addr = listener.local_addr();

        let accept = tokio::spawn(listener.accept());
        let _client = TcpStream::connect(addr).await.unwrap();

        match accept.await.unwrap() {
            Err(RelayError::Connect { addr, .. }) => assert_eq!(addr, upstream.to_string()),
            Err(other) => panic!("unexpected: {:?}", other),
            Ok(_) => panic!("connect should have failed"),
        }
    }

    #[tokio::test]
    async fn test_end_to_end_single_session() {
        let cancel = CancellationToken::new();
        let echo_addr = spawn_echo(cancel.clone()).await;

        let listener = Listener::bind(&relay_config(echo_addr.to_string()))
            .await
            .unwrap();
        let relay_addr = listener.local_addr();
        let accept = tokio::spawn(listener.accept());

        let mut client = TcpStream::connect(relay_addr).await.unwrap();
        let session = accept.await.unwrap().unwrap();
        assert_eq!(session.state(), SessionState::Relaying);

        for payload in [&b"\x01\x02\x03"[..], &b""[..], &b"hello relay"[..]] {
            codec::write_frame(&mut client, payload).await.unwrap();
            let reply = tokio::time::timeout(Duration::from_secs(2), codec::decode(&mut client, None))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&reply[..], payload);
        }

        // The listen socket is gone: a second client is refused.
        assert!(TcpStream::connect(relay_addr).await.is_err());

        drop(client);
        tokio::time::timeout(Duration::from_secs(2), session.closed())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Closed);

        // Still single-use after the session has closed.
        assert!(TcpStream::connect(relay_addr).await.is_err());

        session.stop().await;
        assert_eq!(session.state(), SessionState::Closed);
        cancel.cancel();
    }
}
