pub mod cert;
pub mod keys;
pub mod keystore;
pub mod paths;
pub mod value;

pub use cert::{AGENT_SERVER_NAME, CertPair, CertStore};
pub use keys::{EncryptedSymmetricKeyRef, PrivateKey, SymmetricKey, decrypt_symmetric_key};
pub use keystore::{KeyStore, SymmetricKeyRecord};
pub use value::{CIPHERTEXT_SCHEME, decrypt_value, encrypt_value, parse_revision};
