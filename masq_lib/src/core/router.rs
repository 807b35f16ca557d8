use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::config::config::RoutingConfig;
use crate::core::io::AsyncProxyStream;
use crate::core::transport::Transport;

/// Capability producing a byte-stream connection for `(network, address)`.
/// The netstack publishes the authoritative implementation; it is internally
/// concurrent and safe for parallel dials.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial_context(
        &self,
        network: &str,
        address: &str,
    ) -> io::Result<Box<dyn AsyncProxyStream>>;
}

/// Service registry shared by every inbound. Holds the transports built at
/// startup and the single default-dialer slot that the tun inbound fills in
/// netstack mode. Readers clone the Arc out and release the lock before any
/// I/O happens on the dialer.
pub struct DefaultRouter {
    routing: RoutingConfig,
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
    default_transport: RwLock<Option<String>>,
    dialer: RwLock<Option<Arc<dyn Dialer>>>,
}

impl DefaultRouter {
    pub fn new(routing: Option<RoutingConfig>) -> DefaultRouter {
        DefaultRouter {
            routing: routing.unwrap_or_default(),
            transports: RwLock::new(HashMap::new()),
            default_transport: RwLock::new(None),
            dialer: RwLock::new(None),
        }
    }

    /// The first registered transport becomes the fallback for inbounds that
    /// no routing rule mentions.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        let tag = transport.tag().to_string();
        self.default_transport
            .write()
            .unwrap()
            .get_or_insert(tag.clone());
        self.transports.write().unwrap().insert(tag, transport);
    }

    /// Maps an inbound and a destination to the tag of the transport that
    /// should carry it. Destination matching is reserved for rule extensions;
    /// today rules select on the inbound tag alone.
    pub fn route(&self, inbound_tag: &str, _destination: &str) -> io::Result<String> {
        for rule in &self.routing.rules {
            if rule.inbound_tag.iter().any(|tag| tag == inbound_tag) {
                return Ok(rule.transport_tag.clone());
            }
        }
        self.default_transport
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "no transport is registered"))
    }

    pub fn transport(&self, tag: &str) -> io::Result<Arc<dyn Transport>> {
        self.transports
            .read()
            .unwrap()
            .get(tag)
            .cloned()
            .ok_or_else(|| {
                io::Error::new(
                    ErrorKind::NotFound,
                    format!("no transport with tag '{}'", tag),
                )
            })
    }

    /// Atomic publish; the last writer wins. In practice only the tun
    /// inbound writes here.
    pub fn set_default_dialer(&self, dialer: Arc<dyn Dialer>) {
        *self.dialer.write().unwrap() = Some(dialer);
    }

    pub fn clear_default_dialer(&self) {
        self.dialer.write().unwrap().take();
    }

    pub fn get_default_dialer(&self) -> io::Result<Arc<dyn Dialer>> {
        self.dialer.read().unwrap().clone().ok_or_else(|| {
            io::Error::new(
                ErrorKind::NotConnected,
                "no default dialer; a tun inbound with the netstack stack must be configured",
            )
        })
    }
}
