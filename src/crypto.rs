//! # Record Encryption
//!
//! This module provides encryption at rest for record values. Values are
//! sealed with AES-256-GCM; the per-file key is derived from the registered
//! master key with HKDF-SHA256, and each record gets a random 96-bit nonce
//! stored as a prefix of the ciphertext.
//!
//! ## Key Registration
//!
//! The engine reopens files internally during destroy/copy, so keys are
//! registered ahead of time in a process-wide table keyed by canonical path:
//!
//! ```rust,ignore
//! crypto::register_encryption_key(&path, key);
//! let db = Database::open(&path, config)?;   // picks up the key
//! ```
//!
//! ## Security Properties
//!
//! - **Confidentiality**: AES-256-GCM encryption of record values
//! - **Integrity**: GCM authentication tag per record
//! - **Key isolation**: per-file keys via HKDF, salted with the file path

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// AES-256 key size in bytes.
pub const AES256_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits).
pub const AES_GCM_NONCE_SIZE: usize = 12;

// =============================================================================
// Key Registry
// =============================================================================

fn key_registry() -> &'static Mutex<HashMap<PathBuf, [u8; AES256_KEY_SIZE]>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, [u8; AES256_KEY_SIZE]>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers an encryption key for a file path. Subsequent opens of that path
/// encrypt and decrypt record values with a key derived from it.
pub fn register_encryption_key(path: &Path, key: [u8; AES256_KEY_SIZE]) {
    key_registry()
        .lock()
        .unwrap()
        .insert(path.to_path_buf(), key);
}

/// Removes the registered key for a path, if any.
pub fn unregister_encryption_key(path: &Path) {
    key_registry().lock().unwrap().remove(path);
}

/// Looks up the registered key for a path.
pub fn registered_key(path: &Path) -> Option<[u8; AES256_KEY_SIZE]> {
    key_registry().lock().unwrap().get(path).copied()
}

// =============================================================================
// Record Cryptor
// =============================================================================

/// Seals and opens record values for one file.
pub struct RecordCryptor {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for RecordCryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCryptor").finish_non_exhaustive()
    }
}

impl RecordCryptor {
    /// Creates a cryptor for `path` from a master key, deriving the per-file
    /// key with HKDF-SHA256 (path bytes as the info input).
    pub fn new(path: &Path, master_key: &[u8; AES256_KEY_SIZE]) -> Result<RecordCryptor> {
        let hk = Hkdf::<Sha256>::new(Some(&master_key[..16]), master_key);
        let mut file_key = [0u8; AES256_KEY_SIZE];
        hk.expand(path.to_string_lossy().as_bytes(), &mut file_key)
            .map_err(|_| Error::Crypto("HKDF expand failed".into()))?;

        let cipher = Aes256Gcm::new_from_slice(&file_key)
            .map_err(|_| Error::Crypto("invalid derived key length".into()))?;
        Ok(RecordCryptor { cipher })
    }

    /// Creates a cryptor for `path` when a key is registered for it.
    pub fn for_registered_path(path: &Path) -> Result<Option<RecordCryptor>> {
        match registered_key(path) {
            Some(key) => Ok(Some(RecordCryptor::new(path, &key)?)),
            None => Ok(None),
        }
    }

    /// Encrypts a record value. Output layout: `nonce || ciphertext+tag`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; AES_GCM_NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Crypto("encryption failed".into()))?;

        let mut sealed = Vec::with_capacity(AES_GCM_NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypts a sealed record value.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < AES_GCM_NONCE_SIZE {
            return Err(Error::Crypto("sealed value too short".into()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(AES_GCM_NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::Crypto("decryption failed (wrong key or corrupt value)".into()))
    }
}

// =============================================================================
// Tests
// =============================================================================
