use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MasqueSettings {
    pub sni: Option<String>,
    /// Keep-alive interval in seconds.
    pub keepalive: Option<u64>,
    /// Initial QUIC packet size in bytes.
    pub initial_packet_size: Option<u16>,
    /// Connect port on the remote endpoint.
    pub port: Option<u16>,
    /// Overrides the profile's IPv4 endpoint. Accepts `host`, `host:port`,
    /// bare IPv6 and `[v6]:port`.
    pub endpoint: Option<String>,
}
