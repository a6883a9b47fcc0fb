//! Agent key material.
//!
//! The agent owns one secp256k1 private key. Symmetric value keys are sealed
//! to its public key with an ephemeral ECDH exchange and ChaCha20-Poly1305,
//! so a sealed key reference can travel over the wire and be stored on disk
//! while only the agent can open it.

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use k256::ecdh::diffie_hellman;
use k256::{PublicKey, SecretKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 12;

const SEAL_LABEL: &[u8] = b"keyward-symmetric-key-v1";

/// The agent's long-lived private key.
#[derive(Clone)]
pub struct PrivateKey(SecretKey);

impl PrivateKey {
    /// Generate a fresh random private key.
    pub fn generate() -> Self {
        Self(SecretKey::random(&mut OsRng))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let secret = SecretKey::from_slice(bytes).context("invalid private key bytes")?;
        Ok(Self(secret))
    }

    pub fn to_bytes(&self) -> Zeroizing<[u8; KEY_BYTES]> {
        let mut out = Zeroizing::new([0u8; KEY_BYTES]);
        out.copy_from_slice(&self.0.to_bytes());
        out
    }

    pub fn public_key(&self) -> PublicKey {
        self.0.public_key()
    }

    /// SEC1-compressed public key, base64-encoded.
    pub fn public_key_b64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.public_key().to_sec1_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PrivateKey").field(&"<redacted>").finish()
    }
}

/// An opened symmetric key, tagged with the revision it belongs to.
#[derive(Clone)]
pub struct SymmetricKey {
    pub revision: u64,
    bytes: Zeroizing<[u8; KEY_BYTES]>,
}

impl SymmetricKey {
    pub fn new(revision: u64, bytes: [u8; KEY_BYTES]) -> Self {
        Self {
            revision,
            bytes: Zeroizing::new(bytes),
        }
    }

    /// Generate random key material for the given revision.
    pub fn generate(revision: u64) -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_BYTES]);
        OsRng.fill_bytes(bytes.as_mut());
        Self { revision, bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_BYTES] {
        &self.bytes
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

/// A symmetric key sealed to the agent's public key.
///
/// All binary fields are base64. The revision is bound into the AEAD as
/// associated data, so a reference cannot be replayed under another revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSymmetricKeyRef {
    pub revision: u64,
    pub ephemeral_public_key: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Seal a symmetric key so only the holder of `recipient`'s private key can open it.
pub fn seal_symmetric_key(
    key: &SymmetricKey,
    recipient: &PublicKey,
) -> Result<EncryptedSymmetricKeyRef> {
    let ephemeral = SecretKey::random(&mut OsRng);
    let ephemeral_public = ephemeral.public_key().to_sec1_bytes();
    let shared = diffie_hellman(ephemeral.to_nonzero_scalar(), recipient.as_affine());
    let wrapping_key = derive_wrapping_key(&ephemeral_public, shared.raw_secret_bytes());

    let cipher = ChaCha20Poly1305::new_from_slice(wrapping_key.as_ref())
        .context("invalid wrapping key length")?;
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    let aad = key.revision.to_be_bytes();
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: key.as_bytes(),
                aad: &aad,
            },
        )
        .map_err(|_| anyhow!("failed to seal symmetric key"))?;

    let b64 = base64::engine::general_purpose::STANDARD;
    Ok(EncryptedSymmetricKeyRef {
        revision: key.revision,
        ephemeral_public_key: b64.encode(ephemeral_public),
        nonce: b64.encode(nonce),
        ciphertext: b64.encode(ciphertext),
    })
}

/// Open a sealed symmetric key with the agent's private key.
pub fn decrypt_symmetric_key(
    key_ref: &EncryptedSymmetricKeyRef,
    private_key: &PrivateKey,
) -> Result<SymmetricKey> {
    let b64 = base64::engine::general_purpose::STANDARD;
    let ephemeral_bytes = b64
        .decode(&key_ref.ephemeral_public_key)
        .context("ephemeral public key is not valid base64")?;
    let ephemeral = PublicKey::from_sec1_bytes(&ephemeral_bytes)
        .context("invalid ephemeral public key")?;
    let nonce = b64
        .decode(&key_ref.nonce)
        .context("nonce is not valid base64")?;
    if nonce.len() != NONCE_BYTES {
        bail!("invalid nonce length");
    }
    let ciphertext = b64
        .decode(&key_ref.ciphertext)
        .context("sealed key is not valid base64")?;

    let shared = diffie_hellman(private_key.0.to_nonzero_scalar(), ephemeral.as_affine());
    let wrapping_key = derive_wrapping_key(&ephemeral_bytes, shared.raw_secret_bytes());
    let cipher = ChaCha20Poly1305::new_from_slice(wrapping_key.as_ref())
        .context("invalid wrapping key length")?;
    let aad = key_ref.revision.to_be_bytes();
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| {
                anyhow!(
                    "failed to open symmetric key revision {} (wrong agent key?)",
                    key_ref.revision
                )
            })?,
    );

    if plaintext.len() != KEY_BYTES {
        bail!(
            "symmetric key has invalid length: expected {KEY_BYTES} bytes, got {}",
            plaintext.len()
        );
    }
    let mut bytes = [0u8; KEY_BYTES];
    bytes.copy_from_slice(&plaintext);
    let key = SymmetricKey::new(key_ref.revision, bytes);
    zeroize::Zeroize::zeroize(&mut bytes);
    Ok(key)
}

fn derive_wrapping_key(ephemeral_public: &[u8], shared: &[u8]) -> Zeroizing<[u8; KEY_BYTES]> {
    let mut hasher = Sha256::new();
    hasher.update(SEAL_LABEL);
    hasher.update(ephemeral_public);
    hasher.update(shared);
    let digest = hasher.finalize();
    let mut key = Zeroizing::new([0u8; KEY_BYTES]);
    key.copy_from_slice(&digest[..KEY_BYTES]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_round_trip() {
        let agent = PrivateKey::generate();
        let key = SymmetricKey::generate(3);
        let sealed = seal_symmetric_key(&key, &agent.public_key()).unwrap();
        assert_eq!(sealed.revision, 3);

        let opened = decrypt_symmetric_key(&sealed, &agent).unwrap();
        assert_eq!(opened.revision, 3);
        assert_eq!(opened.as_bytes(), key.as_bytes());
    }

    #[test]
    fn other_agent_cannot_open() {
        let agent = PrivateKey::generate();
        let intruder = PrivateKey::generate();
        let sealed = seal_symmetric_key(&SymmetricKey::generate(1), &agent.public_key()).unwrap();
        let err = decrypt_symmetric_key(&sealed, &intruder).unwrap_err();
        assert!(err.to_string().contains("wrong agent key"));
    }

    #[test]
    fn revision_is_bound_to_sealed_key() {
        let agent = PrivateKey::generate();
        let mut sealed =
            seal_symmetric_key(&SymmetricKey::generate(1), &agent.public_key()).unwrap();
        sealed.revision = 2;
        assert!(decrypt_symmetric_key(&sealed, &agent).is_err());
    }

    #[test]
    fn private_key_bytes_round_trip() {
        let key = PrivateKey::generate();
        let restored = PrivateKey::from_bytes(key.to_bytes().as_ref()).unwrap();
        assert_eq!(key.public_key_b64(), restored.public_key_b64());
    }

    #[test]
    fn debug_output_redacts_key_material() {
        let key = PrivateKey::generate();
        assert_eq!(format!("{key:?}"), "PrivateKey(\"<redacted>\")");
        let sym = SymmetricKey::generate(9);
        assert!(format!("{sym:?}").contains("revision: 9"));
    }
}
