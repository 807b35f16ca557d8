use std::io::{self, ErrorKind};

use serde::{Deserialize, Serialize};

use crate::core::inbound::InboundConfig;
use crate::core::transport::TransportConfig;

pub const DEFAULT_PROFILE_PATH: &str = "profile.json";

/// Run-mode configuration, loaded once at startup and never mutated.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Path of the account profile produced by enrollment.
    pub profile: Option<String>,
    pub inbounds: Vec<InboundConfig>,
    #[serde(default)]
    pub transports: Vec<TransportConfig>,
    pub routing: Option<RoutingConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RoutingConfig {
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RuleConfig {
    #[serde(default)]
    pub inbound_tag: Vec<String>,
    /// Example: "tcp:80,443". Reserved for rule extensions.
    #[serde(default)]
    pub destination: String,
    pub transport_tag: String,
}

impl Config {
    pub fn parse(json: &str) -> io::Result<Config> {
        serde_json::from_str(json).map_err(|err| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("malformed configuration: {}", err),
            )
        })
    }

    pub fn profile_path(&self) -> &str {
        self.profile.as_deref().unwrap_or(DEFAULT_PROFILE_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_configuration() {
        let raw = r#"{
            "profile": "warp.json",
            "inbounds": [
                { "type": "tun", "tag": "tun-in", "options": { "stack": "netstack", "mtu": 1280 } },
                { "type": "mixed", "tag": "mixed-in", "options": { "listen_port": 1080 } }
            ],
            "transports": [
                { "type": "masque", "tag": "masque-out", "options": { "sni": "example.com" } }
            ],
            "routing": {
                "rules": [
                    { "inbound_tag": ["tun-in"], "destination": "", "transport_tag": "masque-out" }
                ]
            }
        }"#;
        let config = Config::parse(raw).unwrap();
        assert_eq!(config.profile_path(), "warp.json");
        assert_eq!(config.inbounds.len(), 2);
        assert_eq!(config.inbounds[0].kind, "tun");
        assert_eq!(config.transports[0].tag, "masque-out");
        assert_eq!(config.routing.unwrap().rules.len(), 1);
    }

    #[test]
    fn defaults_apply_when_sections_are_missing() {
        let config = Config::parse(r#"{ "inbounds": [] }"#).unwrap();
        assert_eq!(config.profile_path(), DEFAULT_PROFILE_PATH);
        assert!(config.transports.is_empty());
        assert!(config.routing.is_none());
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(Config::parse("{").is_err());
        assert!(Config::parse(r#"{ "inbounds": 3 }"#).is_err());
    }
}
