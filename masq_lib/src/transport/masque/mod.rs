use std::io::{self, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::info;

use crate::config::profile::Profile;
use crate::core::packet::PacketConn;
use crate::core::transport::Transport;
use crate::transport::masque::config::MasqueSettings;
use crate::util::parse_endpoint;

pub mod config;
mod h3;
mod tls;
mod tunnel;

/// SNI presented to the provider edge. The endpoint itself is dialed by
/// address, so hostname verification stays off and trust rests on the pin.
pub const CONNECT_SNI: &str = "consumer-masque.cloudflareclient.com";

/// Scheme token carried in the :protocol pseudo-header of the extended
/// CONNECT request.
pub const CONNECT_PROTOCOL: &str = "cf-connect-ip";

/// Vendor HTTP/3 setting that switches CONNECT-IP on at the provider edge;
/// the server refuses the extended CONNECT without it.
pub const H3_SETTING_CONNECT_IP: u64 = 0x276;

pub(crate) const ACCESS_DENIED: &str =
    "login failed: device key is not enrolled with the provider";

const DEFAULT_KEEPALIVE_SECS: u64 = 30;
const DEFAULT_INITIAL_PACKET_SIZE: u16 = 1242;
const DEFAULT_CONNECT_PORT: u16 = 443;

pub struct MasqueTransport {
    tag: String,
    sni: String,
    keepalive: Duration,
    initial_packet_size: u16,
    endpoint_host: String,
    endpoint_port: u16,
    profile: Arc<Profile>,
}

impl MasqueTransport {
    pub fn new(
        tag: &str,
        settings: MasqueSettings,
        profile: Arc<Profile>,
    ) -> io::Result<MasqueTransport> {
        let port = settings.port.unwrap_or(DEFAULT_CONNECT_PORT);
        let endpoint = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| profile.endpoint_v4.clone());
        let (endpoint_host, endpoint_port) = parse_endpoint(&endpoint, port)?;
        // Both IPv6 fields are validated even though only v4 is dialed today.
        if !profile.endpoint_v6.is_empty() {
            parse_endpoint(&profile.endpoint_v6, port)?;
        }
        tls::validate_key_material(&profile.private_key_der, &profile.peer_public_key_der)?;
        Ok(MasqueTransport {
            tag: tag.to_string(),
            sni: settings.sni.clone().unwrap_or_else(|| CONNECT_SNI.to_string()),
            keepalive: Duration::from_secs(settings.keepalive.unwrap_or(DEFAULT_KEEPALIVE_SECS)),
            initial_packet_size: settings
                .initial_packet_size
                .unwrap_or(DEFAULT_INITIAL_PACKET_SIZE),
            endpoint_host,
            endpoint_port,
            profile,
        })
    }

    async fn endpoint_addr(&self) -> io::Result<SocketAddr> {
        if let Ok(ip) = self.endpoint_host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.endpoint_port));
        }
        tokio::net::lookup_host((self.endpoint_host.as_str(), self.endpoint_port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    ErrorKind::NotFound,
                    format!("cannot resolve endpoint '{}'", self.endpoint_host),
                )
            })
    }
}

#[async_trait]
impl Transport for MasqueTransport {
    async fn start_tunnel(&self) -> io::Result<Arc<dyn PacketConn>> {
        let remote = self.endpoint_addr().await?;
        info!(
            "establishing tunnel via transport '{}' to {}",
            self.tag, remote
        );
        let conn = tunnel::connect_tunnel(
            remote,
            &self.endpoint_host,
            &self.sni,
            self.keepalive,
            self.initial_packet_size,
            &self.profile,
        )
        .await?;
        Ok(conn)
    }

    fn tag(&self) -> &str {
        &self.tag
    }
}
