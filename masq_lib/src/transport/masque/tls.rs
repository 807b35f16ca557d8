//! Pinned-key TLS for the provider edge.
//!
//! The endpoint is dialed by address while the SNI names a shared frontend,
//! so chain and hostname verification are replaced by a byte-for-byte
//! comparison of the leaf's public key against the enrolled pin.

use std::io::{self, ErrorKind};
use std::sync::Arc;

use p256::pkcs8::{DecodePrivateKey, DecodePublicKey};
use quinn::rustls;
use quinn::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use quinn::rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use quinn::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
};
use quinn::rustls::{DigitallySignedStruct, SignatureScheme};
use x509_parser::prelude::*;

pub(crate) const PIN_MISMATCH: &str =
    "remote endpoint has a different public key than what we trust";

pub(crate) fn validate_key_material(
    private_key_der: &[u8],
    peer_spki_der: &[u8],
) -> io::Result<()> {
    p256::SecretKey::from_pkcs8_der(private_key_der).map_err(|_| {
        io::Error::new(ErrorKind::InvalidData, "device private key is not a P-256 key")
    })?;
    p256::PublicKey::from_public_key_der(peer_spki_der).map_err(|_| {
        io::Error::new(ErrorKind::InvalidData, "pinned peer key is not a P-256 key")
    })?;
    Ok(())
}

/// Mints the short-lived self-signed client certificate: empty subject and
/// issuer, serial 0, valid for 24 hours from now, carrying the device key.
/// A fresh one is minted for every tunnel so reconnects past the validity
/// window keep working.
pub(crate) fn mint_client_cert(private_key_der: &[u8]) -> io::Result<CertificateDer<'static>> {
    let key_pair = rcgen::KeyPair::try_from(private_key_der).map_err(|err| {
        io::Error::new(ErrorKind::InvalidData, format!("device key rejected: {}", err))
    })?;
    let mut params = rcgen::CertificateParams::default();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.serial_number = Some(rcgen::SerialNumber::from(0u64));
    let now = ::time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + ::time::Duration::days(1);
    let cert = params
        .self_signed(&key_pair)
        .map_err(|err| io::Error::other(format!("cannot mint client certificate: {}", err)))?;
    Ok(cert.der().clone())
}

/// TLS 1.3 client configuration presenting the device certificate, ALPN h3,
/// and the pinned-key verifier in place of the WebPKI chain.
pub(crate) fn build_client_config(
    private_key_der: &[u8],
    peer_spki_der: &[u8],
) -> io::Result<rustls::ClientConfig> {
    let cert = mint_client_cert(private_key_der)?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(private_key_der.to_vec()));
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|err| io::Error::other(err.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinnedKeyVerifier::new(
            peer_spki_der.to_vec(),
        )))
        .with_client_auth_cert(vec![cert], key)
        .map_err(|err| {
            io::Error::new(
                ErrorKind::InvalidData,
                format!("client certificate rejected: {}", err),
            )
        })?;
    config.alpn_protocols = vec![b"h3".to_vec()];
    Ok(config)
}

#[derive(Debug)]
pub(crate) struct PinnedKeyVerifier {
    pinned_spki: Vec<u8>,
    provider: Arc<CryptoProvider>,
}

impl PinnedKeyVerifier {
    pub(crate) fn new(pinned_spki: Vec<u8>) -> PinnedKeyVerifier {
        PinnedKeyVerifier {
            pinned_spki,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl ServerCertVerifier for PinnedKeyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let (_, cert) = X509Certificate::from_der(end_entity.as_ref()).map_err(|err| {
            rustls::Error::General(format!("cannot parse peer certificate: {}", err))
        })?;
        let spki = cert.public_key();
        if p256::PublicKey::from_public_key_der(spki.raw).is_err() {
            return Err(rustls::Error::General(
                "remote endpoint presented a non-ECDSA key".to_string(),
            ));
        }
        if spki.raw != self.pinned_spki.as_slice() {
            return Err(rustls::Error::General(PIN_MISMATCH.to_string()));
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::generate_ec_keypair;

    fn verify(
        verifier: &PinnedKeyVerifier,
        cert: &CertificateDer<'_>,
    ) -> Result<ServerCertVerified, rustls::Error> {
        verifier.verify_server_cert(
            cert,
            &[],
            &ServerName::try_from("example.com").unwrap(),
            &[],
            UnixTime::now(),
        )
    }

    #[test]
    fn accepts_the_pinned_key_and_rejects_others() {
        let (private_der, public_der) = generate_ec_keypair().unwrap();
        let cert = mint_client_cert(&private_der).unwrap();

        let matching = PinnedKeyVerifier::new(public_der.clone());
        assert!(verify(&matching, &cert).is_ok());

        let (_, other_public) = generate_ec_keypair().unwrap();
        let mismatching = PinnedKeyVerifier::new(other_public);
        let err = verify(&mismatching, &cert).unwrap_err();
        assert!(err.to_string().contains(PIN_MISMATCH));
    }

    #[test]
    fn key_material_validation() {
        let (private_der, public_der) = generate_ec_keypair().unwrap();
        assert!(validate_key_material(&private_der, &public_der).is_ok());
        assert!(validate_key_material(b"junk", &public_der).is_err());
        assert!(validate_key_material(&private_der, b"junk").is_err());
    }

    #[test]
    fn client_config_builds_with_h3_alpn() {
        let (private_der, public_der) = generate_ec_keypair().unwrap();
        let config = build_client_config(&private_der, &public_der).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h3".to_vec()]);
    }
}
