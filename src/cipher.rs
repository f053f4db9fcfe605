//! Secret Cipher
//!
//! Authenticated encryption of device credentials at rest.
//!
//! - [`KeyRing`]: versioned symmetric keys persisted in a key directory
//! - [`SecretCipher`]: ChaCha20-Poly1305 sealing under the active key version
//! - [`SealedSecret`]: ciphertext plus the key version it was sealed under
//!
//! A ciphertext is `nonce (12 bytes) || payload + tag`. The key version is
//! stored next to it so old records stay readable after a rotation until they
//! are re-sealed.

mod keyring;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use thiserror::Error;
use zeroize::Zeroizing;

pub use keyring::{KEY_LEN, KeyRing};

/// Nonce length for ChaCha20-Poly1305.
pub const NONCE_LEN: usize = 12;

/// Errors raised by the cipher and key ring.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Ciphertext is malformed, was tampered with, or was sealed under another key.
    #[error("decryption failed for key version {version}")]
    Decryption { version: u32 },

    /// The record references a key version that is not in the key ring.
    #[error("unknown key version {0}")]
    UnknownKeyVersion(u32),

    /// Sealing failed (should not happen for in-memory payloads).
    #[error("encryption failed")]
    Encryption,

    /// Key directory I/O failed.
    #[error("key store error: {0}")]
    KeyStore(#[from] std::io::Error),

    /// A key file exists but its content is not a valid key.
    #[error("invalid key file '{path}': {reason}")]
    InvalidKey { path: String, reason: String },

    /// The key directory holds no key and initialization was not requested.
    #[error("no encryption key found in '{0}'")]
    NoKey(String),
}

/// Ciphertext tagged with the key version it was sealed under.
#[derive(Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub key_version: u32,
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for SealedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedSecret")
            .field("key_version", &self.key_version)
            .field("len", &self.ciphertext.len())
            .finish()
    }
}

/// Process-wide secret cipher.
///
/// Built at startup from a [`KeyRing`] and shared read-only (`Arc`)
/// between the registry and every poll worker. [`reload`](Self::reload)
/// rebuilds it from the same key directory after an out-of-process rotation.
pub struct SecretCipher {
    keys: BTreeMap<u32, ChaCha20Poly1305>,
    active: u32,
    dir: PathBuf,
    pinned: bool,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("active", &self.active)
            .field("versions", &self.keys.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Build a cipher from all keys in the ring.
    pub fn new(ring: &KeyRing) -> Result<Self, CipherError> {
        let mut keys = BTreeMap::new();
        for (version, bytes) in ring.keys() {
            let aead = ChaCha20Poly1305::new_from_slice(bytes.as_slice()).map_err(|_| {
                CipherError::InvalidKey {
                    path: format!("v{version}"),
                    reason: "wrong key length".to_string(),
                }
            })?;
            keys.insert(version, aead);
        }

        let active = ring.active_version();
        if !keys.contains_key(&active) {
            return Err(CipherError::UnknownKeyVersion(active));
        }

        Ok(Self {
            keys,
            active,
            dir: ring.dir().to_path_buf(),
            pinned: ring.is_pinned(),
        })
    }

    /// Re-read the key directory this cipher was built from.
    ///
    /// A pinned active version stays pinned; otherwise the newest version
    /// on disk becomes active.
    pub fn reload(&self) -> Result<Self, CipherError> {
        let ring = KeyRing::load(&self.dir)?;
        let ring = if self.pinned {
            ring.with_active(self.active)?
        } else {
            ring
        };
        Self::new(&ring)
    }

    /// Whether a key for `version` is loaded.
    pub fn has_version(&self, version: u32) -> bool {
        self.keys.contains_key(&version)
    }

    /// Version used for every new encryption.
    pub fn active_version(&self) -> u32 {
        self.active
    }

    /// Seal a plaintext secret under the active key with a fresh random nonce.
    pub fn encrypt(&self, plaintext: &str) -> Result<SealedSecret, CipherError> {
        let aead = self
            .keys
            .get(&self.active)
            .ok_or(CipherError::UnknownKeyVersion(self.active))?;

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let sealed = aead
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encryption)?;

        let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
        ciphertext.extend_from_slice(nonce.as_slice());
        ciphertext.extend_from_slice(&sealed);

        Ok(SealedSecret {
            key_version: self.active,
            ciphertext,
        })
    }

    /// Open a sealed secret. The returned plaintext is wiped on drop.
    pub fn decrypt(&self, sealed: &SealedSecret) -> Result<Zeroizing<String>, CipherError> {
        let version = sealed.key_version;
        let aead = self
            .keys
            .get(&version)
            .ok_or(CipherError::UnknownKeyVersion(version))?;

        if sealed.ciphertext.len() < NONCE_LEN {
            return Err(CipherError::Decryption { version });
        }
        let (nonce, payload) = sealed.ciphertext.split_at(NONCE_LEN);

        let plaintext = Zeroizing::new(
            aead.decrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| CipherError::Decryption { version })?,
        );

        let text = std::str::from_utf8(&plaintext).map_err(|_| CipherError::Decryption { version })?;
        Ok(Zeroizing::new(text.to_owned()))
    }

    /// Returns true when the secret must be re-sealed under the active key.
    pub fn needs_reseal(&self, sealed: &SealedSecret) -> bool {
        sealed.key_version != self.active
    }
}
