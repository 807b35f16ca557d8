//! Tunnel-owning inbound: opens the transport, builds the local stack,
//! pumps packets between them and, in netstack mode, publishes the stack's
//! dialer for stream inbounds.

use std::io::{self, ErrorKind};
use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::profile::Profile;
use crate::core::inbound::Inbound;
use crate::core::packet::PacketConn;
use crate::core::router::DefaultRouter;
use crate::inbound::tun::config::TunInboundSettings;
use crate::stack::netstack::NetStack;
use crate::stack::system::SystemStack;

pub mod config;
mod pump;

pub const DEFAULT_MTU: u16 = 1280;
pub const STACK_NETSTACK: &str = "netstack";
pub const STACK_SYSTEM: &str = "system";

enum State {
    Created,
    Started(Started),
    Closed,
}

struct Started {
    local: Arc<dyn PacketConn>,
    remote: Arc<dyn PacketConn>,
    published_dialer: bool,
}

pub struct TunInbound {
    tag: String,
    settings: TunInboundSettings,
    router: Arc<DefaultRouter>,
    profile: Arc<Profile>,
    cancel: CancellationToken,
    state: Mutex<State>,
}

impl TunInbound {
    pub fn new(
        tag: &str,
        settings: TunInboundSettings,
        router: Arc<DefaultRouter>,
        profile: Arc<Profile>,
    ) -> TunInbound {
        TunInbound {
            tag: tag.to_string(),
            settings,
            router,
            profile,
            cancel: CancellationToken::new(),
            state: Mutex::new(State::Created),
        }
    }
}

#[async_trait]
impl Inbound for TunInbound {
    async fn start(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            State::Created => {}
            _ => {
                return Err(io::Error::new(
                    ErrorKind::AlreadyExists,
                    format!("tun inbound '{}' already started", self.tag),
                ))
            }
        }

        let transport_tag = self.router.route(&self.tag, "")?;
        let transport = self.router.transport(&transport_tag)?;
        let remote = transport.start_tunnel().await?;

        let mtu = self.settings.mtu.unwrap_or(DEFAULT_MTU);
        let stack_kind = self.settings.stack.as_deref().unwrap_or(STACK_NETSTACK);
        let mut published_dialer = false;
        let local: Arc<dyn PacketConn> = match stack_kind {
            STACK_SYSTEM => {
                match SystemStack::new(&self.tag, mtu, self.profile.ipv4, self.profile.ipv6) {
                    Ok(stack) => Arc::new(stack),
                    Err(err) => {
                        let _ = remote.close().await;
                        return Err(err);
                    }
                }
            }
            STACK_NETSTACK => {
                match NetStack::new(self.profile.ipv4, self.profile.ipv6, mtu as usize) {
                    Ok((conn, dialer)) => {
                        info!("publishing the netstack dialer for stream inbounds");
                        self.router.set_default_dialer(dialer);
                        published_dialer = true;
                        conn
                    }
                    Err(err) => {
                        let _ = remote.close().await;
                        return Err(err);
                    }
                }
            }
            other => {
                let _ = remote.close().await;
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("unknown stack type '{}'", other),
                ));
            }
        };

        let tunnel_cancel = self.cancel.child_token();
        tokio::spawn(pump::pump(
            local.clone(),
            remote.clone(),
            tunnel_cancel.clone(),
            "uplink",
            mtu as usize,
        ));
        tokio::spawn(pump::pump(
            remote.clone(),
            local.clone(),
            tunnel_cancel.clone(),
            "downlink",
            mtu as usize,
        ));

        // Whichever direction fails first cancels the shared token; this
        // task then withdraws the dialer so stream inbounds fail closed, and
        // releases the tunnel. All closes are idempotent.
        let router = self.router.clone();
        let local_cleanup = local.clone();
        let remote_cleanup = remote.clone();
        tokio::spawn(async move {
            tunnel_cancel.cancelled().await;
            if published_dialer {
                router.clear_default_dialer();
            }
            let _ = local_cleanup.close().await;
            let _ = remote_cleanup.close().await;
        });

        *state = State::Started(Started {
            local,
            remote,
            published_dialer,
        });
        info!(
            "tun inbound '{}' started with the {} stack",
            self.tag, stack_kind
        );
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, State::Closed) {
            State::Created => {
                *state = State::Created;
                Err(io::Error::new(
                    ErrorKind::NotConnected,
                    format!("tun inbound '{}' was never started", self.tag),
                ))
            }
            State::Closed => Ok(()),
            State::Started(started) => {
                self.cancel.cancel();
                if started.published_dialer {
                    self.router.clear_default_dialer();
                }
                let mut first_error = None;
                if let Err(err) = started.local.close().await {
                    first_error.get_or_insert(err);
                }
                if let Err(err) = started.remote.close().await {
                    first_error.get_or_insert(err);
                }
                match first_error {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }

    fn tag(&self) -> &str {
        &self.tag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::profile::Profile;
    use crate::core::packet::memory;
    use crate::core::transport::Transport;
    use crate::util::generate_ec_keypair;

    struct MemoryTransport {
        tunnel: Mutex<Option<memory::MemoryPacketConn>>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn start_tunnel(&self) -> io::Result<Arc<dyn PacketConn>> {
            let conn = self.tunnel.lock().await.take().ok_or_else(|| {
                io::Error::new(ErrorKind::Unsupported, "tunnel already started")
            })?;
            Ok(Arc::new(conn))
        }

        fn tag(&self) -> &str {
            "memory-out"
        }
    }

    fn test_profile() -> Arc<Profile> {
        let (private_key_der, _) = generate_ec_keypair().unwrap();
        let (_, peer_public_key_der) = generate_ec_keypair().unwrap();
        Arc::new(Profile {
            private_key_der,
            peer_public_key_der,
            endpoint_v4: "162.159.198.1".to_string(),
            endpoint_v6: String::new(),
            ipv4: "10.0.0.2".parse().unwrap(),
            ipv6: "fd00::2".parse().unwrap(),
            device_id: String::new(),
        })
    }

    fn router_with_memory_transport() -> (Arc<DefaultRouter>, Arc<dyn PacketConn>) {
        let (inner, outer) = memory::pair();
        let router = Arc::new(DefaultRouter::new(None));
        router.register_transport(Arc::new(MemoryTransport {
            tunnel: Mutex::new(Some(inner)),
        }));
        (router, Arc::new(outer))
    }

    #[tokio::test]
    async fn start_publishes_the_dialer_and_close_withdraws_it() {
        let (router, _remote) = router_with_memory_transport();
        let inbound = TunInbound::new(
            "tun-in",
            TunInboundSettings::default(),
            router.clone(),
            test_profile(),
        );

        assert!(router.get_default_dialer().is_err());
        inbound.start().await.unwrap();
        assert!(router.get_default_dialer().is_ok());

        inbound.close().await.unwrap();
        assert!(router.get_default_dialer().is_err());
        // Close is idempotent.
        inbound.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_before_start_is_an_error() {
        let (router, _remote) = router_with_memory_transport();
        let inbound = TunInbound::new(
            "tun-in",
            TunInboundSettings::default(),
            router,
            test_profile(),
        );
        assert!(inbound.close().await.is_err());
    }

    #[tokio::test]
    async fn double_start_is_an_error() {
        let (router, _remote) = router_with_memory_transport();
        let inbound = TunInbound::new(
            "tun-in",
            TunInboundSettings::default(),
            router,
            test_profile(),
        );
        inbound.start().await.unwrap();
        assert!(inbound.start().await.is_err());
        inbound.close().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_stack_type_fails_start() {
        let (router, _remote) = router_with_memory_transport();
        let inbound = TunInbound::new(
            "tun-in",
            TunInboundSettings {
                stack: Some("hybrid".to_string()),
                mtu: None,
            },
            router,
            test_profile(),
        );
        let err = inbound.start().await.unwrap_err();
        assert!(err.to_string().contains("unknown stack type"));
    }
}
