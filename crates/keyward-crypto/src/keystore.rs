//! On-disk key store for the agent.
//!
//! Layout inside the state directory:
//! - `agent.key`: the private key, encrypted with an Argon2id-derived key
//!   from the agent passphrase (the public key is stored alongside in clear);
//! - `keys.json`: every symmetric key revision, each sealed to the agent's
//!   public key.
//!
//! The private key is decrypted on first use and cached for the lifetime of
//! the store. The symmetric key list is cached until a forced refresh.

use crate::keys::{
    EncryptedSymmetricKeyRef, KEY_BYTES, NONCE_BYTES, PrivateKey, SymmetricKey,
    seal_symmetric_key,
};
use crate::paths::{ensure_private_dir, write_private_file};
use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use k256::PublicKey;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

const PRIVATE_KEY_FILE: &str = "agent.key";
const SYMMETRIC_KEYS_FILE: &str = "keys.json";
const SALT_LEN: usize = 16;
const FORMAT_VERSION: u32 = 1;

/// On-disk format for the passphrase-encrypted private key.
#[derive(Serialize, Deserialize)]
struct EncryptedPrivateKey {
    /// Argon2id salt (hex).
    salt: String,
    /// ChaCha20-Poly1305 nonce (hex).
    nonce: String,
    /// Encrypted private key (hex).
    ciphertext: String,
    /// SEC1 public key (base64), readable without the passphrase.
    public_key: String,
    version: u32,
}

/// One symmetric key revision as persisted in `keys.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymmetricKeyRecord {
    pub revision: u64,
    pub created_at_ms: u64,
    pub key_ref: EncryptedSymmetricKeyRef,
}

pub struct KeyStore {
    dir: PathBuf,
    passphrase: Option<Zeroizing<String>>,
    private_key: OnceLock<PrivateKey>,
    symmetric_keys: Mutex<Option<Vec<SymmetricKeyRecord>>>,
}

impl KeyStore {
    /// Open the key store rooted at `dir`. No file is touched until first use.
    pub fn open(dir: impl Into<PathBuf>, passphrase: Option<Zeroizing<String>>) -> Self {
        Self {
            dir: dir.into(),
            passphrase,
            private_key: OnceLock::new(),
            symmetric_keys: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_initialized(&self) -> bool {
        self.dir.join(PRIVATE_KEY_FILE).exists()
    }

    /// Create the private key and the first symmetric key revision.
    pub fn init(&self) -> Result<PrivateKey> {
        if self.is_initialized() {
            bail!("key store already initialized at {}", self.dir.display());
        }
        let passphrase = self.require_passphrase()?;
        ensure_private_dir(&self.dir)?;

        let private_key = PrivateKey::generate();
        save_private_key(&self.dir.join(PRIVATE_KEY_FILE), passphrase, &private_key)?;

        let first = SymmetricKey::generate(1);
        let record = SymmetricKeyRecord {
            revision: 1,
            created_at_ms: now_ms(),
            key_ref: seal_symmetric_key(&first, &private_key.public_key())?,
        };
        self.save_symmetric_keys(vec![record])?;

        let _ = self.private_key.set(private_key.clone());
        tracing::info!(dir = %self.dir.display(), "key store initialized");
        Ok(private_key)
    }

    /// Return the private key, decrypting it with the passphrase on first use.
    pub fn load_private_key_lazy(&self) -> Result<PrivateKey> {
        if let Some(key) = self.private_key.get() {
            return Ok(key.clone());
        }
        let passphrase = self.require_passphrase()?;
        let key = load_private_key(&self.dir.join(PRIVATE_KEY_FILE), passphrase)?;
        tracing::debug!("private key decrypted");
        Ok(self.private_key.get_or_init(|| key).clone())
    }

    /// The agent public key, readable without the passphrase.
    pub fn public_key(&self) -> Result<PublicKey> {
        if let Some(key) = self.private_key.get() {
            return Ok(key.public_key());
        }
        let stored = read_encrypted_private_key(&self.dir.join(PRIVATE_KEY_FILE))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&stored.public_key)
            .context("stored public key is not valid base64")?;
        PublicKey::from_sec1_bytes(&bytes).context("stored public key is invalid")
    }

    /// List all symmetric key revisions, oldest first.
    ///
    /// The list is read from disk once and cached; `force_refresh` rereads it.
    pub fn load_symmetric_keys(&self, force_refresh: bool) -> Result<Vec<SymmetricKeyRecord>> {
        let mut cache = self
            .symmetric_keys
            .lock()
            .map_err(|_| anyhow!("symmetric key cache poisoned"))?;
        if !force_refresh && let Some(keys) = cache.as_ref() {
            return Ok(keys.clone());
        }
        let keys = read_symmetric_keys(&self.dir.join(SYMMETRIC_KEYS_FILE))?;
        *cache = Some(keys.clone());
        Ok(keys)
    }

    /// The sealed reference for the newest revision.
    pub fn latest_key_ref(&self) -> Result<EncryptedSymmetricKeyRef> {
        self.load_symmetric_keys(false)?
            .into_iter()
            .max_by_key(|record| record.revision)
            .map(|record| record.key_ref)
            .context("no symmetric keys found; run: keyward-agent init")
    }

    /// Add a new symmetric key revision sealed to the agent public key.
    pub fn rotate(&self) -> Result<SymmetricKeyRecord> {
        let public_key = self.public_key()?;
        let mut keys = self.load_symmetric_keys(true)?;
        let revision = keys.iter().map(|r| r.revision).max().unwrap_or(0) + 1;
        let record = SymmetricKeyRecord {
            revision,
            created_at_ms: now_ms(),
            key_ref: seal_symmetric_key(&SymmetricKey::generate(revision), &public_key)?,
        };
        keys.push(record.clone());
        self.save_symmetric_keys(keys)?;
        tracing::info!(revision, "symmetric key rotated");
        Ok(record)
    }

    fn save_symmetric_keys(&self, keys: Vec<SymmetricKeyRecord>) -> Result<()> {
        let json = serde_json::to_vec_pretty(&keys)?;
        write_private_file(&self.dir.join(SYMMETRIC_KEYS_FILE), &json)?;
        let mut cache = self
            .symmetric_keys
            .lock()
            .map_err(|_| anyhow!("symmetric key cache poisoned"))?;
        *cache = Some(keys);
        Ok(())
    }

    fn require_passphrase(&self) -> Result<&str> {
        self.passphrase
            .as_deref()
            .map(String::as_str)
            .context("agent passphrase required (set KEYWARD_PASSPHRASE)")
    }
}

/// Derive a 32-byte key from a passphrase + salt using Argon2id.
fn derive_key_from_passphrase(passphrase: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    use argon2::Argon2;

    let mut key = Zeroizing::new([0u8; 32]);
    Argon2::default()
        .hash_password_into(passphrase.as_bytes(), salt, key.as_mut())
        .map_err(|e| anyhow!("argon2 key derivation failed: {e}"))?;
    Ok(key)
}

fn save_private_key(path: &Path, passphrase: &str, key: &PrivateKey) -> Result<()> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);

    let wrapping_key = derive_key_from_passphrase(passphrase, &salt)?;
    let cipher =
        ChaCha20Poly1305::new_from_slice(wrapping_key.as_ref()).context("invalid wrapping key")?;
    let key_bytes = key.to_bytes();
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), &key_bytes[..])
        .map_err(|_| anyhow!("failed to encrypt private key"))?;

    let encrypted = EncryptedPrivateKey {
        salt: hex::encode(salt),
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
        public_key: key.public_key_b64(),
        version: FORMAT_VERSION,
    };
    write_private_file(path, serde_json::to_string_pretty(&encrypted)?.as_bytes())
}

fn read_encrypted_private_key(path: &Path) -> Result<EncryptedPrivateKey> {
    let json = std::fs::read_to_string(path).with_context(|| {
        format!(
            "failed to read private key {}; run: keyward-agent init",
            path.display()
        )
    })?;
    let encrypted: EncryptedPrivateKey =
        serde_json::from_str(&json).context("invalid private key format")?;
    if encrypted.version != FORMAT_VERSION {
        bail!("unsupported private key version: {}", encrypted.version);
    }
    Ok(encrypted)
}

fn load_private_key(path: &Path, passphrase: &str) -> Result<PrivateKey> {
    let encrypted = read_encrypted_private_key(path)?;
    let salt = hex::decode(&encrypted.salt).context("invalid salt hex")?;
    let nonce = hex::decode(&encrypted.nonce).context("invalid nonce hex")?;
    let ciphertext = hex::decode(&encrypted.ciphertext).context("invalid ciphertext hex")?;
    if nonce.len() != NONCE_BYTES {
        bail!("invalid nonce length");
    }

    let wrapping_key = derive_key_from_passphrase(passphrase, &salt)?;
    let cipher =
        ChaCha20Poly1305::new_from_slice(wrapping_key.as_ref()).context("invalid wrapping key")?;
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| anyhow!("failed to decrypt private key (wrong passphrase?)"))?,
    );
    if plaintext.len() != KEY_BYTES {
        bail!("private key has invalid length: {}", plaintext.len());
    }
    PrivateKey::from_bytes(&plaintext)
}

fn read_symmetric_keys(path: &Path) -> Result<Vec<SymmetricKeyRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&json).context("invalid symmetric key list")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
