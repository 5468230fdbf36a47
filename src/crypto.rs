//! # Cryptographic Operations
//!
//! This module provides the node's TLS identity and the hashing used across
//! the protocol:
//! - Loading and generating the node certificate and private key (PEM)
//! - Deriving a peer fingerprint from a certificate's public key
//! - rustls configurations enforcing mutual certificate authentication
//! - SHA-1 content digests for change detection
//!
//! Certificates are self-signed. Trust is not delegated to a CA: a peer is
//! identified solely by the fingerprint of its public key, and the session
//! layer compares that fingerprint against the configured ones.

use sha1::{Digest as _, Sha1};
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::AsyncReadExt;
use tracing::debug;
use x509_parser::public_key::PublicKey;

use crate::error::CryptoError;
use crate::message::{Digest, PeerIdentity};

/// ALPN protocol identifier negotiated on every connection.
pub const ALPN: &[u8] = b"lumesync/1";

/// Name every node certificate is issued for and every dial verifies against.
pub const SERVER_NAME: &str = "lumesync.local";

/// Certificate chain and private key presented to peers.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub cert_chain: Vec<rustls::Certificate>,
    pub key: rustls::PrivateKey,
}

/// Freshly generated credentials together with their PEM encodings.
pub struct GeneratedCredentials {
    pub credentials: Credentials,
    pub cert_pem: String,
    pub key_pem: String,
}

impl Credentials {
    /// Load a PEM certificate chain and a PEM private key.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CryptoError> {
        let cert_data = std::fs::read(cert_path)?;
        let mut cert_chain = Vec::new();
        for pem in x509_parser::pem::Pem::iter_from_buffer(&cert_data) {
            let pem = pem.map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
            if pem.label == "CERTIFICATE" {
                cert_chain.push(rustls::Certificate(pem.contents));
            }
        }
        if cert_chain.is_empty() {
            return Err(CryptoError::MissingCertificate(cert_path.to_path_buf()));
        }

        let key_data = std::fs::read(key_path)?;
        let key = x509_parser::pem::Pem::iter_from_buffer(&key_data)
            .filter_map(|pem| pem.ok())
            .find(|pem| pem.label.ends_with("PRIVATE KEY"))
            .map(|pem| rustls::PrivateKey(pem.contents))
            .ok_or_else(|| CryptoError::MissingKey(key_path.to_path_buf()))?;

        debug!("Loaded {} certificate(s) from {}", cert_chain.len(), cert_path.display());
        Ok(Self { cert_chain, key })
    }

    /// Generate a self-signed certificate for this node.
    pub fn generate(node_name: &str) -> Result<GeneratedCredentials, CryptoError> {
        let key_pair = rcgen::KeyPair::generate()?;

        let mut params = rcgen::CertificateParams::new(vec![SERVER_NAME.to_string()])?;
        let mut distinguished_name = rcgen::DistinguishedName::new();
        distinguished_name.push(rcgen::DnType::CommonName, node_name);
        distinguished_name.push(rcgen::DnType::OrganizationName, "lumesync");
        params.distinguished_name = distinguished_name;

        let cert = params.self_signed(&key_pair)?;

        Ok(GeneratedCredentials {
            credentials: Self {
                cert_chain: vec![rustls::Certificate(cert.der().to_vec())],
                key: rustls::PrivateKey(key_pair.serialize_der()),
            },
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Identity derived from the leaf certificate.
    pub fn identity(&self) -> Result<PeerIdentity, CryptoError> {
        let leaf = self
            .cert_chain
            .first()
            .ok_or_else(|| CryptoError::InvalidCertificate("empty certificate chain".to_string()))?;
        identity_from_certificate(&leaf.0)
    }
}

impl GeneratedCredentials {
    /// Write the certificate and key, restricting the key to the owner.
    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<(), CryptoError> {
        for path in [cert_path, key_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(cert_path, &self.cert_pem)?;
        std::fs::write(key_path, &self.key_pem)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(key_path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(key_path, perms)?;
        }

        Ok(())
    }
}

/// Compute the peer identity for a DER certificate.
///
/// The fingerprint is `hex(SHA-1(key material))` where the material is the
/// RSA modulus for RSA keys and the raw public key bits otherwise.
pub fn identity_from_certificate(cert_der: &[u8]) -> Result<PeerIdentity, CryptoError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| CryptoError::InvalidCertificate(e.to_string()))?;
    let spki = cert.public_key();

    let material = match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => strip_leading_zeros(rsa.modulus).to_vec(),
        _ => spki.subject_public_key.data.to_vec(),
    };

    let fingerprint = hex::encode(Sha1::digest(&material));
    Ok(PeerIdentity::new(fingerprint, material))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// SHA-1 over an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> Digest {
    let mut digest = [0u8; 20];
    digest.copy_from_slice(&Sha1::digest(data));
    digest
}

/// SHA-1 over the full content of a file.
pub async fn hash_file(path: &Path) -> std::io::Result<Digest> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let mut digest = [0u8; 20];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

/// TLS server configuration that requires every client to present a certificate.
pub fn server_config(credentials: &Credentials) -> Result<rustls::ServerConfig, CryptoError> {
    let mut config = rustls::ServerConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(Arc::new(RequireAnyClientCert))
        .with_single_cert(credentials.cert_chain.clone(), credentials.key.clone())?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// TLS client configuration presenting our certificate. The server
/// certificate is accepted here and checked by fingerprint once the
/// handshake has completed.
pub fn client_config(credentials: &Credentials) -> Result<rustls::ClientConfig, CryptoError> {
    let mut config = rustls::ClientConfig::builder()
        .with_safe_default_cipher_suites()
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_client_auth_cert(credentials.cert_chain.clone(), credentials.key.clone())?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

struct RequireAnyClientCert;

impl rustls::server::ClientCertVerifier for RequireAnyClientCert {
    fn client_auth_root_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _now: SystemTime,
    ) -> Result<rustls::server::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::ClientCertVerified::assertion())
    }
}

struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_identity_is_stable() {
        let generated = Credentials::generate("node-a").unwrap();
        let first = generated.credentials.identity().unwrap();
        let second = identity_from_certificate(&generated.credentials.cert_chain[0].0).unwrap();

        // SHA-1 is 20 bytes = 40 hex chars
        assert_eq!(first.fingerprint.len(), 40);
        assert_eq!(first, second);
    }

    #[test]
    fn test_distinct_keys_have_distinct_fingerprints() {
        let a = Credentials::generate("a").unwrap().credentials.identity().unwrap();
        let b = Credentials::generate("b").unwrap().credentials.identity().unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_fingerprint_is_sha1_of_key_material() {
        let identity = Credentials::generate("node").unwrap().credentials.identity().unwrap();
        assert_eq!(identity.fingerprint, hex::encode(hash_bytes(&identity.public_key)));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let cert_path = temp_dir.path().join("node.crt");
        let key_path = temp_dir.path().join("keys/node.key");

        let generated = Credentials::generate("node").unwrap();
        generated.save(&cert_path, &key_path).unwrap();

        let loaded = Credentials::load(&cert_path, &key_path).unwrap();
        assert_eq!(loaded.identity().unwrap(), generated.credentials.identity().unwrap());
        assert_eq!(loaded.key, generated.credentials.key);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_without_certificate_fails() {
        let temp_dir = TempDir::new().unwrap();
        let cert_path = temp_dir.path().join("empty.crt");
        let key_path = temp_dir.path().join("empty.key");
        std::fs::write(&cert_path, "").unwrap();
        std::fs::write(&key_path, "").unwrap();

        assert!(matches!(
            Credentials::load(&cert_path, &key_path),
            Err(CryptoError::MissingCertificate(_))
        ));
    }

    #[test]
    fn test_strip_leading_zeros() {
        assert_eq!(strip_leading_zeros(&[0, 0, 1, 0]), &[1, 0]);
        assert_eq!(strip_leading_zeros(&[0, 0]), &[] as &[u8]);
    }

    #[test]
    fn test_hash_bytes_known_value() {
        assert_eq!(
            hex::encode(hash_bytes(b"")),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
    }

    #[tokio::test]
    async fn test_hash_file_matches_hash_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        assert_eq!(hash_file(&path).await.unwrap(), hash_bytes(&data));
    }

    #[test]
    fn test_tls_configs_build() {
        let generated = Credentials::generate("node").unwrap();
        let server = server_config(&generated.credentials).unwrap();
        let client = client_config(&generated.credentials).unwrap();
        assert_eq!(server.alpn_protocols, vec![ALPN.to_vec()]);
        assert_eq!(client.alpn_protocols, vec![ALPN.to_vec()]);
    }
}
