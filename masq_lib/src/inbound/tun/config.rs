use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TunInboundSettings {
    /// "system" for a kernel device, "netstack" for the user-space stack.
    pub stack: Option<String>,
    pub mtu: Option<u16>,
}
