use std::io::{self, ErrorKind};
use std::net::Ipv6Addr;

/// Generates a fresh P-256 key pair and returns (PKCS#8 private key DER,
/// SPKI public key DER), the shapes device enrollment exchanges with the
/// provider.
pub fn generate_ec_keypair() -> io::Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|err| io::Error::other(err.to_string()))?;
    Ok((key_pair.serialize_der(), key_pair.public_key_der()))
}

/// Splits an endpoint into host and port, defaulting the port. Accepts
/// `host`, `host:port`, bare IPv6 and `[v6]:port` forms.
pub fn parse_endpoint(endpoint: &str, default_port: u16) -> io::Result<(String, u16)> {
    let endpoint = endpoint.trim();
    if endpoint.is_empty() {
        return Err(io::Error::new(ErrorKind::InvalidInput, "empty endpoint"));
    }
    if let Some(rest) = endpoint.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "unterminated bracketed address",
            ));
        };
        return match tail.strip_prefix(':') {
            Some(port) => Ok((host.to_string(), parse_port(port)?)),
            None if tail.is_empty() => Ok((host.to_string(), default_port)),
            None => Err(io::Error::new(
                ErrorKind::InvalidInput,
                "trailing characters after bracketed address",
            )),
        };
    }
    if endpoint.parse::<Ipv6Addr>().is_ok() {
        return Ok((endpoint.to_string(), default_port));
    }
    match endpoint.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), parse_port(port)?)),
        Some(_) => Err(io::Error::new(ErrorKind::InvalidInput, "empty host")),
        None => Ok((endpoint.to_string(), default_port)),
    }
}

fn parse_port(raw: &str) -> io::Result<u16> {
    raw.parse::<u16>()
        .map_err(|_| io::Error::new(ErrorKind::InvalidInput, format!("invalid port '{}'", raw)))
}

/// Interface names end up in kernel calls; reject separators early.
pub fn check_ifname(name: &str) -> io::Result<()> {
    if name.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "interface name cannot be empty",
        ));
    }
    if name.contains('/') || name.chars().any(|c| c.is_whitespace()) {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "interface name contains '/' or whitespace",
        ));
    }
    Ok(())
}
