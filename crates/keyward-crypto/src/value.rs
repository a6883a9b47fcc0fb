//! Value encryption under a symmetric key.
//!
//! Ciphertexts are text: `<scheme>:<revision>:<payload>`, where the payload is
//! base64 of `nonce || ChaCha20-Poly1305 ciphertext` over the JSON encoding of
//! the value. The scheme and revision prefix is authenticated as associated data.

use crate::keys::{NONCE_BYTES, SymmetricKey};
use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;

pub const CIPHERTEXT_SCHEME: &str = "kw1";

/// Extract the symmetric key revision embedded in a ciphertext.
pub fn parse_revision(ciphertext: &str) -> Result<u64> {
    let mut parts = ciphertext.splitn(3, ':');
    let (Some(_scheme), Some(revision), Some(_payload)) = (parts.next(), parts.next(), parts.next())
    else {
        bail!("malformed ciphertext: expected <scheme>:<revision>:<payload>");
    };
    revision
        .parse::<u64>()
        .map_err(|_| anyhow!("malformed ciphertext: revision {revision:?} is not numeric"))
}

/// Encrypt a JSON value under `key`.
pub fn encrypt_value(value: &serde_json::Value, key: &SymmetricKey) -> Result<String> {
    let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(value)?);
    let prefix = format!("{CIPHERTEXT_SCHEME}:{}", key.revision);

    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).context("invalid key length")?;
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: prefix.as_bytes(),
            },
        )
        .map_err(|_| anyhow!("encryption failed"))?;

    let mut payload = Vec::with_capacity(NONCE_BYTES + sealed.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&sealed);
    Ok(format!(
        "{prefix}:{}",
        base64::engine::general_purpose::STANDARD.encode(payload)
    ))
}

/// Decrypt a ciphertext produced by [`encrypt_value`].
pub fn decrypt_value(ciphertext: &str, key: &SymmetricKey) -> Result<serde_json::Value> {
    let revision = parse_revision(ciphertext)?;
    let mut parts = ciphertext.splitn(3, ':');
    let scheme = parts.next().unwrap_or_default();
    let payload = parts.nth(1).unwrap_or_default();

    if scheme != CIPHERTEXT_SCHEME {
        bail!("unsupported ciphertext scheme: {scheme}");
    }
    if revision != key.revision {
        bail!(
            "ciphertext revision {revision} does not match key revision {}",
            key.revision
        );
    }

    let payload = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .context("ciphertext payload is not valid base64")?;
    if payload.len() <= NONCE_BYTES {
        bail!("ciphertext payload is too short");
    }
    let (nonce, sealed) = payload.split_at(NONCE_BYTES);

    let prefix = format!("{scheme}:{revision}");
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).context("invalid key length")?;
    let plaintext = zeroize::Zeroizing::new(
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: prefix.as_bytes(),
                },
            )
            .map_err(|_| anyhow!("decryption failed"))?,
    );
    serde_json::from_slice(&plaintext).context("decrypted payload is not valid JSON")
}
