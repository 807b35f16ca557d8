use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MixedInboundSettings {
    pub listen: Option<String>,
    pub listen_port: Option<u16>,
}
