//! TLS credential builder for mutual authentication
//!
//! Turns a PEM CA bundle, client certificate, and private key into a
//! validated rustls client configuration. Purely a byte-to-config
//! transformation: no file or network I/O happens here, so it can be unit
//! tested without a broker. The resulting posture is one-directional
//! client auth: this client authenticates to the broker with its
//! certificate and verifies the broker against the trusted roots. No
//! revocation checking is performed.

use ring::signature::{self, KeyPair as _};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rumqttc::tokio_rustls::rustls::{ClientConfig, RootCertStore};
use rumqttc::{TlsConfiguration, Transport};
use std::sync::Arc;
use thiserror::Error;

/// Errors from credential construction - all fatal, never retried
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("CA bundle invalid: {0}")]
    CaBundle(String),

    #[error("Client certificate invalid: {0}")]
    ClientCert(String),

    #[error("Private key invalid: {0}")]
    PrivateKey(String),

    #[error("Private key does not match the certificate's public key")]
    KeyMismatch,
}

/// Validated transport-security configuration for one connection attempt
///
/// Immutable once built. The client certificate chain is retained so the
/// identity presented to the broker can be inspected.
pub struct SecurityConfig {
    client_config: Arc<ClientConfig>,
    client_chain: Vec<CertificateDer<'static>>,
}

impl SecurityConfig {
    /// The certificate chain this client presents to the broker
    pub fn client_cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.client_chain
    }

    /// The leaf certificate's public key (SubjectPublicKeyInfo bits)
    pub fn client_public_key(&self) -> Result<Vec<u8>, CredentialError> {
        certificate_public_key(&self.client_chain[0])
    }

    /// Build the rumqttc transport wrapping this configuration
    pub fn transport(&self) -> Transport {
        Transport::tls_with_config(TlsConfiguration::Rustls(self.client_config.clone()))
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("client_chain_len", &self.client_chain.len())
            .finish()
    }
}

/// Builder for [`SecurityConfig`]
pub struct CredentialBuilder;

impl CredentialBuilder {
    /// Build a validated security configuration from PEM byte buffers
    ///
    /// Fails with [`CredentialError`] when the CA bundle contains no
    /// parseable certificate, the client certificate or key do not parse,
    /// or the key does not correspond to the certificate's public key.
    /// Never partially succeeds.
    pub fn build(
        ca_pem: &[u8],
        cert_pem: &[u8],
        key_pem: &[u8],
    ) -> Result<SecurityConfig, CredentialError> {
        let roots = parse_trusted_roots(ca_pem)?;
        let chain = parse_cert_chain(cert_pem)?;
        let key = parse_private_key(key_pem)?;

        verify_key_matches_cert(&chain[0], &key)?;

        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(chain.clone(), key)
            .map_err(|e| CredentialError::ClientCert(e.to_string()))?;

        Ok(SecurityConfig {
            client_config: Arc::new(client_config),
            client_chain: chain,
        })
    }
}

fn parse_trusted_roots(ca_pem: &[u8]) -> Result<RootCertStore, CredentialError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &ca_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| CredentialError::CaBundle(e.to_string()))?;

    if certs.is_empty() {
        return Err(CredentialError::CaBundle(
            "no certificates found in bundle".to_string(),
        ));
    }

    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| CredentialError::CaBundle(e.to_string()))?;
    }
    Ok(roots)
}

fn parse_cert_chain(cert_pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| CredentialError::ClientCert(e.to_string()))?;

    if chain.is_empty() {
        return Err(CredentialError::ClientCert(
            "no certificate found".to_string(),
        ));
    }
    Ok(chain)
}

fn parse_private_key(key_pem: &[u8]) -> Result<PrivateKeyDer<'static>, CredentialError> {
    rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| CredentialError::PrivateKey(e.to_string()))?
        .ok_or_else(|| CredentialError::PrivateKey("no private key found".to_string()))
}

/// Extract the public key bits (SubjectPublicKeyInfo contents) from a certificate
fn certificate_public_key(cert: &CertificateDer<'_>) -> Result<Vec<u8>, CredentialError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref())
        .map_err(|e| CredentialError::ClientCert(e.to_string()))?;
    Ok(parsed.public_key().subject_public_key.data.to_vec())
}

/// Derive the public key bits from a private key
///
/// The encodings line up with the certificate's SubjectPublicKeyInfo bit
/// string: DER RSAPublicKey for RSA, the uncompressed point for ECDSA, and
/// the raw 32 bytes for Ed25519.
fn private_key_public_bits(key: &PrivateKeyDer<'_>) -> Result<Vec<u8>, CredentialError> {
    match key {
        PrivateKeyDer::Pkcs1(der) => {
            let pair = signature::RsaKeyPair::from_der(der.secret_pkcs1_der())
                .map_err(|e| CredentialError::PrivateKey(e.to_string()))?;
            Ok(pair.public_key().as_ref().to_vec())
        }
        PrivateKeyDer::Pkcs8(der) => {
            let pkcs8 = der.secret_pkcs8_der();
            if let Ok(pair) = signature::RsaKeyPair::from_pkcs8(pkcs8) {
                return Ok(pair.public_key().as_ref().to_vec());
            }
            let rng = ring::rand::SystemRandom::new();
            if let Ok(pair) = signature::EcdsaKeyPair::from_pkcs8(
                &signature::ECDSA_P256_SHA256_ASN1_SIGNING,
                pkcs8,
                &rng,
            ) {
                return Ok(pair.public_key().as_ref().to_vec());
            }
            if let Ok(pair) = signature::EcdsaKeyPair::from_pkcs8(
                &signature::ECDSA_P384_SHA384_ASN1_SIGNING,
                pkcs8,
                &rng,
            ) {
                return Ok(pair.public_key().as_ref().to_vec());
            }
            if let Ok(pair) = signature::Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8) {
                return Ok(pair.public_key().as_ref().to_vec());
            }
            Err(CredentialError::PrivateKey(
                "unsupported or malformed PKCS#8 key".to_string(),
            ))
        }
        _ => Err(CredentialError::PrivateKey(
            "unsupported key encoding".to_string(),
        )),
    }
}

fn verify_key_matches_cert(
    cert: &CertificateDer<'_>,
    key: &PrivateKeyDer<'_>,
) -> Result<(), CredentialError> {
    let cert_key = certificate_public_key(cert)?;
    let derived_key = private_key_public_bits(key)?;
    if cert_key != derived_key {
        return Err(CredentialError::KeyMismatch);
    }
    Ok(())
}
