use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::core::packet::PacketConn;

/// Factory for outbound tunnels to a remote provider. Every call produces a
/// fresh tunnel with its own socket and session; the transport outlives any
/// one tunnel and never retries on its own.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start_tunnel(&self) -> io::Result<Arc<dyn PacketConn>>;

    fn tag(&self) -> &str;
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TransportConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    pub options: Option<Box<RawValue>>,
}
