//! Mixed SOCKS5/HTTP inbound. A single TCP listener peeks the first client
//! byte to pick the protocol: 0x05 is SOCKS5, anything else is treated as
//! HTTP/1.x. The peeked byte stays in the buffered reader so each protocol
//! parser sees the stream from its very first byte.

use std::io;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::inbound::Inbound;
use crate::core::router::DefaultRouter;
use crate::inbound::mixed::config::MixedInboundSettings;

pub mod config;
mod http;
mod socks;

pub const DEFAULT_LISTEN: &str = "0.0.0.0";
pub const DEFAULT_LISTEN_PORT: u16 = 1080;

enum State {
    Created,
    Started,
    Closed,
}

pub struct MixedInbound {
    tag: String,
    settings: MixedInboundSettings,
    router: Arc<DefaultRouter>,
    cancel: CancellationToken,
    state: Mutex<State>,
}

impl MixedInbound {
    pub fn new(
        tag: &str,
        settings: MixedInboundSettings,
        router: Arc<DefaultRouter>,
    ) -> MixedInbound {
        MixedInbound {
            tag: tag.to_string(),
            settings,
            router,
            cancel: CancellationToken::new(),
            state: Mutex::new(State::Created),
        }
    }
}

#[async_trait]
impl Inbound for MixedInbound {
    async fn start(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            State::Created => {}
            _ => {
                return Err(io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("mixed inbound '{}' already started", self.tag),
                ))
            }
        }

        let listen = self.settings.listen.as_deref().unwrap_or(DEFAULT_LISTEN);
        let port = self.settings.listen_port.unwrap_or(DEFAULT_LISTEN_PORT);
        let addr = format!("{}:{}", listen, port);
        let listener = TcpListener::bind(&addr).await.map_err(|err| {
            io::Error::new(err.kind(), format!("cannot listen on {}: {}", addr, err))
        })?;
        info!("mixed inbound '{}' listening on {}", self.tag, addr);

        let router = self.router.clone();
        let cancel = self.cancel.clone();
        let tag = self.tag.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((socket, peer)) => {
                        let router = router.clone();
                        // A failing handler never takes the listener down.
                        tokio::spawn(async move {
                            handle_connection(router, socket, peer).await;
                        });
                    }
                    Err(err) => {
                        warn!("mixed inbound '{}' accept error: {}", tag, err);
                        continue;
                    }
                }
            }
            debug!("mixed inbound '{}' stopped accepting", tag);
        });

        *state = State::Started;
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, State::Closed) {
            State::Created => {
                *state = State::Created;
                Err(io::Error::new(
                    ErrorKind::NotConnected,
                    format!("mixed inbound '{}' was never started", self.tag),
                ))
            }
            // Accepted connections finish through their own I/O errors.
            _ => {
                self.cancel.cancel();
                Ok(())
            }
        }
    }

    fn tag(&self) -> &str {
        &self.tag
    }
}

pub(crate) async fn handle_connection<S>(router: Arc<DefaultRouter>, stream: S, peer: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut reader = BufReader::new(stream);
    let first = match reader.fill_buf().await {
        Ok(buf) if buf.is_empty() => return,
        Ok(buf) => buf[0],
        Err(err) => {
            debug!("cannot peek connection from {}: {}", peer, err);
            return;
        }
    };
    if first == socks::SOCKS_VERSION {
        debug!("socks5 connection from {}", peer);
        socks::serve(router, reader, peer).await;
    } else {
        debug!("http connection from {}", peer);
        http::serve(router, reader, peer).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::AsyncProxyStream;
    use crate::core::router::Dialer;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn peer() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    /// Dialer whose every connection echoes bytes back to the sender.
    struct EchoDialer;

    #[async_trait]
    impl Dialer for EchoDialer {
        async fn dial_context(
            &self,
            _network: &str,
            _address: &str,
        ) -> io::Result<Box<dyn AsyncProxyStream>> {
            let (near, mut far) = duplex(4096);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match far.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if far.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Ok(Box::new(near))
        }
    }

    /// Dialer that answers any request with a canned HTTP response carrying
    /// multi-valued headers.
    struct CannedHttpDialer;

    #[async_trait]
    impl Dialer for CannedHttpDialer {
        async fn dial_context(
            &self,
            _network: &str,
            _address: &str,
        ) -> io::Result<Box<dyn AsyncProxyStream>> {
            let (near, mut far) = duplex(4096);
            tokio::spawn(async move {
                let mut raw = Vec::new();
                let mut buf = [0u8; 1024];
                loop {
                    match far.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            raw.extend_from_slice(&buf[..n]);
                            if raw.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                    }
                }
                let _ = far
                    .write_all(
                        b"HTTP/1.1 200 OK\r\n\
                          Set-Cookie: a=1\r\n\
                          Set-Cookie: b=2\r\n\
                          Content-Length: 5\r\n\
                          \r\n\
                          hello",
                    )
                    .await;
            });
            Ok(Box::new(near))
        }
    }

    fn router_with(dialer: Option<Arc<dyn Dialer>>) -> Arc<DefaultRouter> {
        let router = Arc::new(DefaultRouter::new(None));
        if let Some(dialer) = dialer {
            router.set_default_dialer(dialer);
        }
        router
    }

    #[tokio::test]
    async fn socks5_connect_and_echo() {
        let router = router_with(Some(Arc::new(EchoDialer)));
        let (mut client, server) = duplex(4096);
        let handler = tokio::spawn(handle_connection(router, server, peer()));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut buf = [0u8; 2];
        timeout(TEST_TIMEOUT, client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buf, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        timeout(TEST_TIMEOUT, client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        client.write_all(b"ABCD").await.unwrap();
        let mut echoed = [0u8; 4];
        timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"ABCD");

        drop(client);
        let _ = timeout(TEST_TIMEOUT, handler).await;
    }

    #[tokio::test]
    async fn http_connect_tunnels_bytes() {
        let router = router_with(Some(Arc::new(EchoDialer)));
        let (mut client, server) = duplex(4096);
        let handler = tokio::spawn(handle_connection(router, server, peer()));

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let mut reply = [0u8; 19];
        timeout(TEST_TIMEOUT, client.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&reply, b"HTTP/1.1 200 OK\r\n\r\n");

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&echoed, b"ping");

        drop(client);
        let _ = timeout(TEST_TIMEOUT, handler).await;
    }

    #[tokio::test]
    async fn http_forward_preserves_status_headers_and_body() {
        let router = router_with(Some(Arc::new(CannedHttpDialer)));
        let (mut client, server) = duplex(4096);
        let handler = tokio::spawn(handle_connection(router, server, peer()));

        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut response = Vec::new();
        timeout(TEST_TIMEOUT, client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Set-Cookie: a=1\r\n"));
        assert!(response.contains("Set-Cookie: b=2\r\n"));
        assert!(response.ends_with("hello"));

        let _ = timeout(TEST_TIMEOUT, handler).await;
    }

    #[tokio::test]
    async fn http_without_dialer_gets_503() {
        let router = router_with(None);
        let (mut client, server) = duplex(4096);
        let handler = tokio::spawn(handle_connection(router, server, peer()));

        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        timeout(TEST_TIMEOUT, client.read_to_end(&mut response))
            .await
            .unwrap()
            .unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));

        let _ = timeout(TEST_TIMEOUT, handler).await;
    }

    #[tokio::test]
    async fn socks5_without_dialer_is_aborted() {
        let router = router_with(None);
        let (mut client, server) = duplex(4096);
        let handler = tokio::spawn(handle_connection(router, server, peer()));

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut buf = [0u8; 1];
        let n = timeout(TEST_TIMEOUT, client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0, "connection should close without a reply");

        let _ = timeout(TEST_TIMEOUT, handler).await;
    }

    #[tokio::test]
    async fn listener_lifecycle_and_close_rules() {
        let router = router_with(None);
        let inbound = MixedInbound::new(
            "mixed-in",
            MixedInboundSettings {
                listen: Some("127.0.0.1".to_string()),
                listen_port: Some(0),
            },
            router,
        );
        assert!(inbound.close().await.is_err());
        inbound.start().await.unwrap();
        assert!(inbound.start().await.is_err());
        inbound.close().await.unwrap();
        inbound.close().await.unwrap();
    }
}
