use std::fs;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, Ipv6Addr};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey};
use serde::{Deserialize, Serialize};

/// On-disk account document produced by device enrollment. Only the
/// data-plane fields are interpreted here; the provisioning identifiers are
/// carried opaquely.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProfileDocument {
    pub private_key: String,
    pub endpoint_pub_key: String,
    pub endpoint_v4: String,
    #[serde(default)]
    pub endpoint_v6: String,
    pub ipv4: String,
    pub ipv6: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub license: String,
}

/// Validated account profile. Key material is normalized at load time so the
/// transport never re-parses base64 or guesses encodings.
#[derive(Debug, Clone)]
pub struct Profile {
    /// Device private key, PKCS#8 DER, P-256.
    pub private_key_der: Vec<u8>,
    /// Pinned peer public key, SPKI DER, P-256.
    pub peer_public_key_der: Vec<u8>,
    pub endpoint_v4: String,
    pub endpoint_v6: String,
    /// Tunnel address assigned to the local interface.
    pub ipv4: Ipv4Addr,
    pub ipv6: Ipv6Addr,
    pub device_id: String,
}

impl Profile {
    pub fn load(path: &str) -> io::Result<Profile> {
        let raw = fs::read_to_string(path).map_err(|err| {
            io::Error::new(
                err.kind(),
                format!("cannot read profile '{}': {}", path, err),
            )
        })?;
        let document: ProfileDocument = serde_json::from_str(&raw).map_err(|err| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("malformed profile '{}': {}", path, err),
            )
        })?;
        Profile::from_document(&document)
    }

    pub fn from_document(document: &ProfileDocument) -> io::Result<Profile> {
        if document.endpoint_v4.is_empty() {
            return Err(io::Error::new(
                ErrorKind::InvalidData,
                "profile has no IPv4 endpoint",
            ));
        }
        let ipv4 = document.ipv4.parse().map_err(|_| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("profile IPv4 address '{}' is invalid", document.ipv4),
            )
        })?;
        let ipv6 = document.ipv6.parse().map_err(|_| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("profile IPv6 address '{}' is invalid", document.ipv6),
            )
        })?;
        Ok(Profile {
            private_key_der: decode_private_key(&document.private_key)?,
            peer_public_key_der: decode_peer_public_key(&document.endpoint_pub_key)?,
            endpoint_v4: document.endpoint_v4.clone(),
            endpoint_v6: document.endpoint_v6.clone(),
            ipv4,
            ipv6,
            device_id: document.id.clone(),
        })
    }
}

// Enrollment emits SEC1; PKCS#8 is accepted as well and everything is
// normalized to PKCS#8 for the TLS layer.
fn decode_private_key(encoded: &str) -> io::Result<Vec<u8>> {
    let der = BASE64.decode(encoded).map_err(|err| {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("device private key is not valid base64: {}", err),
        )
    })?;
    let key = p256::SecretKey::from_sec1_der(&der)
        .or_else(|_| p256::SecretKey::from_pkcs8_der(&der))
        .map_err(|_| {
            io::Error::new(ErrorKind::InvalidData, "device private key is not a P-256 key")
        })?;
    let der = key
        .to_pkcs8_der()
        .map_err(|err| io::Error::new(ErrorKind::InvalidData, err.to_string()))?;
    Ok(der.as_bytes().to_vec())
}

fn decode_peer_public_key(encoded: &str) -> io::Result<Vec<u8>> {
    let der = BASE64.decode(encoded).map_err(|err| {
        io::Error::new(
            ErrorKind::InvalidData,
            format!("peer public key is not valid base64: {}", err),
        )
    })?;
    p256::PublicKey::from_public_key_der(&der).map_err(|_| {
        io::Error::new(ErrorKind::InvalidData, "peer public key is not a P-256 key")
    })?;
    Ok(der)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::generate_ec_keypair;

    fn document() -> ProfileDocument {
        let (private_key, _) = generate_ec_keypair().unwrap();
        let (_, peer_public) = generate_ec_keypair().unwrap();
        ProfileDocument {
            private_key: BASE64.encode(private_key),
            endpoint_pub_key: BASE64.encode(peer_public),
            endpoint_v4: "162.159.198.1".to_string(),
            endpoint_v6: "2606:4700:103::1".to_string(),
            ipv4: "172.16.0.2".to_string(),
            ipv6: "2606:4700:110:8000::1".to_string(),
            id: "t.1234".to_string(),
            access_token: String::new(),
            license: String::new(),
        }
    }

    #[test]
    fn accepts_a_complete_document() {
        let profile = Profile::from_document(&document()).unwrap();
        assert_eq!(profile.ipv4, Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(profile.endpoint_v4, "162.159.198.1");
        assert!(!profile.private_key_der.is_empty());
        assert!(!profile.peer_public_key_der.is_empty());
    }

    #[test]
    fn rejects_malformed_key_material() {
        let mut doc = document();
        doc.private_key = "not base64 !!".to_string();
        assert!(Profile::from_document(&doc).is_err());

        let mut doc = document();
        doc.private_key = BASE64.encode(b"garbage key bytes");
        assert!(Profile::from_document(&doc).is_err());

        let mut doc = document();
        doc.endpoint_pub_key = BASE64.encode(b"garbage key bytes");
        assert!(Profile::from_document(&doc).is_err());
    }

    #[test]
    fn rejects_bad_addresses() {
        let mut doc = document();
        doc.ipv4 = "999.0.0.1".to_string();
        assert!(Profile::from_document(&doc).is_err());

        let mut doc = document();
        doc.endpoint_v4 = String::new();
        assert!(Profile::from_document(&doc).is_err());
    }
}
