//! Root keyring backed by XChaCha20-Poly1305.
//!
//! One key is active and encrypts new payloads. Rotation demotes it to
//! inactive: inactive keys still decrypt what they wrote. Retired keys
//! refuse to decrypt. Ciphertext is the 24-byte nonce followed by the sealed
//! payload.

use crate::core::error::{VarError, VarResult};
use crate::crypto::Encrypter;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use zeroize::{Zeroize, ZeroizeOnDrop};

const NONCE_LEN: usize = 24;

/// 256-bit key material, wiped on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new((&self.0).into())
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Lifecycle state of a root key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// Encrypts and decrypts.
    Active,
    /// Decrypts only.
    Inactive,
    /// Neither encrypts nor decrypts.
    Retired,
}

#[derive(Debug)]
struct RootKey {
    material: SecretKey,
    state: KeyState,
}

struct KeyringInner {
    keys: HashMap<String, RootKey>,
    active_id: String,
    encryptions_since_rotation: u64,
}

/// Keyring statistics.
#[derive(Debug, Clone, Default)]
pub struct KeyringStats {
    /// ID of the active key.
    pub active_key_id: String,
    /// Keys that can still decrypt.
    pub usable_keys: usize,
    /// Retired keys.
    pub retired_keys: usize,
    /// Rotations performed.
    pub rotations: u64,
    /// Payloads encrypted.
    pub encryptions: u64,
    /// Payloads decrypted.
    pub decryptions: u64,
}

/// Set of root keys with one active key.
pub struct Keyring {
    inner: RwLock<KeyringInner>,
    /// Rotate after this many encryptions (0 = never).
    rotation_threshold: u64,
    rotations: AtomicU64,
    encryptions: AtomicU64,
    decryptions: AtomicU64,
}

impl Keyring {
    /// Create a keyring with a freshly generated active key.
    pub fn new(rotation_threshold: u64) -> Self {
        let active_id = uuid::Uuid::new_v4().to_string();
        let mut keys = HashMap::new();
        keys.insert(
            active_id.clone(),
            RootKey {
                material: SecretKey::generate(),
                state: KeyState::Active,
            },
        );
        Self {
            inner: RwLock::new(KeyringInner {
                keys,
                active_id,
                encryptions_since_rotation: 0,
            }),
            rotation_threshold,
            rotations: AtomicU64::new(0),
            encryptions: AtomicU64::new(0),
            decryptions: AtomicU64::new(0),
        }
    }

    /// ID of the active key.
    pub fn active_key_id(&self) -> String {
        self.inner.read().active_id.clone()
    }

    /// State of a key, if known.
    pub fn key_state(&self, key_id: &str) -> Option<KeyState> {
        self.inner.read().keys.get(key_id).map(|k| k.state)
    }

    /// Generate a new active key; the previous one becomes inactive.
    pub fn rotate(&self) -> String {
        let mut inner = self.inner.write();
        Self::rotate_locked(&mut inner);
        self.rotations.fetch_add(1, Ordering::Relaxed);
        inner.active_id.clone()
    }

    /// Retire an inactive key. The active key cannot be retired.
    pub fn retire(&self, key_id: &str) -> VarResult<()> {
        let mut inner = self.inner.write();
        if inner.active_id == key_id {
            return Err(VarError::invalid("active root key cannot be retired"));
        }
        let key = inner
            .keys
            .get_mut(key_id)
            .ok_or_else(|| VarError::invalid(format!("root key {key_id} not found")))?;
        key.state = KeyState::Retired;
        tracing::info!(key_id = %key_id, "retired root key");
        Ok(())
    }

    /// Get statistics.
    pub fn stats(&self) -> KeyringStats {
        let inner = self.inner.read();
        let retired_keys = inner
            .keys
            .values()
            .filter(|k| k.state == KeyState::Retired)
            .count();
        KeyringStats {
            active_key_id: inner.active_id.clone(),
            usable_keys: inner.keys.len() - retired_keys,
            retired_keys,
            rotations: self.rotations.load(Ordering::Relaxed),
            encryptions: self.encryptions.load(Ordering::Relaxed),
            decryptions: self.decryptions.load(Ordering::Relaxed),
        }
    }

    fn rotate_locked(inner: &mut KeyringInner) {
        let previous = inner.active_id.clone();
        if let Some(old) = inner.keys.get_mut(&previous) {
            old.state = KeyState::Inactive;
        }
        let next = uuid::Uuid::new_v4().to_string();
        inner.keys.insert(
            next.clone(),
            RootKey {
                material: SecretKey::generate(),
                state: KeyState::Active,
            },
        );
        inner.active_id = next;
        inner.encryptions_since_rotation = 0;
        tracing::info!(
            key_id = %inner.active_id,
            previous = %previous,
            "rotated root key"
        );
    }
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Encrypter for Keyring {
    fn encrypt(&self, plaintext: &[u8]) -> VarResult<(Vec<u8>, String)> {
        let mut inner = self.inner.write();
        if self.rotation_threshold > 0
            && inner.encryptions_since_rotation >= self.rotation_threshold
        {
            Self::rotate_locked(&mut inner);
            self.rotations.fetch_add(1, Ordering::Relaxed);
        }

        let key_id = inner.active_id.clone();
        let key = inner
            .keys
            .get(&key_id)
            .ok_or_else(|| VarError::encryption("active root key missing"))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);
        let sealed = key
            .material
            .cipher()
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| VarError::encryption(e.to_string()))?;

        inner.encryptions_since_rotation += 1;
        self.encryptions.fetch_add(1, Ordering::Relaxed);

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok((out, key_id))
    }

    fn decrypt(&self, ciphertext: &[u8], key_id: &str) -> VarResult<Vec<u8>> {
        let inner = self.inner.read();
        let key = inner
            .keys
            .get(key_id)
            .ok_or_else(|| VarError::decryption(format!("root key {key_id} not found")))?;
        if key.state == KeyState::Retired {
            return Err(VarError::decryption(format!("root key {key_id} is retired")));
        }
        if ciphertext.len() < NONCE_LEN {
            return Err(VarError::decryption("ciphertext too short"));
        }

        let (nonce, sealed) = ciphertext.split_at(NONCE_LEN);
        let plaintext = key
            .material
            .cipher()
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|e| VarError::decryption(e.to_string()))?;
        self.decryptions.fetch_add(1, Ordering::Relaxed);
        Ok(plaintext)
    }
}
