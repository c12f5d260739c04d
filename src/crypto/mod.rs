//! At-rest encryption of variable payloads.
//!
//! - [`keyring`] - XChaCha20-Poly1305 root keys with rotation

pub mod keyring;

pub use keyring::{KeyState, Keyring};

use crate::core::error::{VarError, VarResult};
use crate::vars::model::{VariableData, VariableItems};

/// Symmetric encryption under an active key.
///
/// Implementations must be safe to call concurrently.
pub trait Encrypter: Send + Sync {
    /// Encrypt under the active key, returning ciphertext and key ID.
    fn encrypt(&self, plaintext: &[u8]) -> VarResult<(Vec<u8>, String)>;

    /// Decrypt ciphertext produced under `key_id`.
    fn decrypt(&self, ciphertext: &[u8], key_id: &str) -> VarResult<Vec<u8>>;
}

/// Serialize and encrypt items.
pub fn seal_items(encrypter: &dyn Encrypter, items: &VariableItems) -> VarResult<VariableData> {
    let plaintext = serde_json::to_vec(items).map_err(|e| VarError::encryption(e.to_string()))?;
    let (data, key_id) = encrypter.encrypt(&plaintext)?;
    Ok(VariableData { data, key_id })
}

/// Decrypt and deserialize items.
pub fn open_items(encrypter: &dyn Encrypter, data: &VariableData) -> VarResult<VariableItems> {
    let plaintext = encrypter.decrypt(&data.data, &data.key_id)?;
    serde_json::from_slice(&plaintext).map_err(|e| VarError::decryption(e.to_string()))
}
