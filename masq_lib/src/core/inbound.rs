use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// A listener-side service. The lifecycle is created -> started -> closed;
/// an inbound owns every resource it allocates during start.
#[async_trait]
pub trait Inbound: Send + Sync {
    /// Non-blocking: spawns whatever tasks the inbound needs and returns.
    async fn start(&self) -> io::Result<()>;

    /// Closing before a completed start is an error; closing twice is not.
    async fn close(&self) -> io::Result<()>;

    fn tag(&self) -> &str;
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InboundConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub tag: String,
    pub options: Option<Box<RawValue>>,
}
