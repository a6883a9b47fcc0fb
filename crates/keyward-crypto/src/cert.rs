//! Self-signed TLS certificate for the agent's loopback port.
//!
//! Generated once with rcgen and kept in the state directory; the client side
//! pins this exact certificate as its only trust root.

use crate::paths::{ensure_private_dir, write_private_file};
use anyhow::{Context, Result};
use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ECDSA_P256_SHA256, SanType};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const CERT_FILE: &str = "agent-cert.pem";
const KEY_FILE: &str = "agent-key.pem";

/// DNS name the agent certificate is issued for.
pub const AGENT_SERVER_NAME: &str = "localhost";

/// PEM-encoded certificate and private key.
#[derive(Clone)]
pub struct CertPair {
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
}

#[derive(Debug, Clone)]
pub struct CertStore {
    dir: PathBuf,
}

impl CertStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.join(KEY_FILE)
    }

    /// Load the agent certificate, generating and persisting it on first use.
    pub fn load_or_create(&self) -> Result<CertPair> {
        let cert_path = self.cert_path();
        let key_path = self.key_path();
        if cert_path.exists() && key_path.exists() {
            return load(&cert_path, &key_path);
        }

        ensure_private_dir(&self.dir)?;
        let pair = generate()?;
        write_private_file(&key_path, pair.key_pem.as_bytes())?;
        std::fs::write(&cert_path, &pair.cert_pem)
            .with_context(|| format!("failed to write {}", cert_path.display()))?;
        tracing::info!(cert = %cert_path.display(), "generated agent TLS certificate");
        Ok(pair)
    }
}

fn load(cert_path: &Path, key_path: &Path) -> Result<CertPair> {
    let cert_pem = std::fs::read_to_string(cert_path)
        .with_context(|| format!("failed to read {}", cert_path.display()))?;
    let key_pem = std::fs::read_to_string(key_path)
        .with_context(|| format!("failed to read {}", key_path.display()))?;
    Ok(CertPair {
        cert_pem,
        key_pem: Zeroizing::new(key_pem),
    })
}

fn generate() -> Result<CertPair> {
    let key_pair =
        KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).context("key generation failed")?;

    let mut params = CertificateParams::new(vec![AGENT_SERVER_NAME.to_string()])
        .context("invalid certificate subject")?;
    params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    params
        .distinguished_name
        .push(DnType::CommonName, "keyward agent");

    let cert = params
        .self_signed(&key_pair)
        .context("certificate generation failed")?;

    Ok(CertPair {
        cert_pem: cert.pem(),
        key_pem: Zeroizing::new(key_pair.serialize_pem()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_once_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path());

        let first = store.load_or_create().unwrap();
        assert!(first.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(first.key_pem.contains("PRIVATE KEY"));

        let second = store.load_or_create().unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(*first.key_pem, *second.key_pem);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = CertStore::new(dir.path());
        store.load_or_create().unwrap();
        let meta = std::fs::metadata(store.key_path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
