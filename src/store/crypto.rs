//! At-rest encryption for answer payloads and biometric templates.
//!
//! ChaCha20-Poly1305 with a key derived from the device passphrase via
//! Argon2id. The per-database salt lives in the `meta` table; each sealed
//! value carries its own random nonce as a 12-byte prefix, so the same
//! plaintext never produces the same ciphertext twice.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use super::StoreError;

/// Argon2id memory cost in KiB (64 MB)
pub const ARGON2_MEMORY_KB: u32 = 65536;

/// Argon2id iteration count
pub const ARGON2_ITERATIONS: u32 = 3;

/// Argon2id parallelism (threads)
pub const ARGON2_PARALLELISM: u32 = 4;

/// Salt length for key derivation (16 bytes)
pub const SALT_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

/// Generate a fresh random salt for a new database.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Sealing/opening handle derived once per opened store.
pub struct StoreCrypto {
    cipher: ChaCha20Poly1305,
}

impl StoreCrypto {
    /// Derive the store key from the device passphrase and the database
    /// salt. Memory-hard parameters match the custodial key handling.
    pub fn derive(passphrase: &str, salt: &[u8]) -> Result<Self, StoreError> {
        let params = Params::new(
            ARGON2_MEMORY_KB,
            ARGON2_ITERATIONS,
            ARGON2_PARALLELISM,
            Some(32),
        )
        .map_err(|e| StoreError::Crypto(format!("invalid Argon2 params: {e}")))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| StoreError::Crypto(format!("key derivation failed: {e}")))?;

        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    /// Encrypt a value; the returned bytes are `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| StoreError::Crypto(format!("encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a `nonce || ciphertext` value.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, StoreError> {
        if sealed.len() < NONCE_LEN {
            return Err(StoreError::Crypto("sealed value too short".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Crypto("decryption failed (wrong passphrase or tampered data)".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let salt = generate_salt();
        let crypto = StoreCrypto::derive("device-passphrase", &salt).unwrap();

        let plaintext = br#"{"type":"single_choice","value":2}"#;
        let sealed = crypto.seal(plaintext).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], plaintext.as_slice());

        let opened = crypto.open(&sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_nonce_is_fresh_per_seal() {
        let salt = generate_salt();
        let crypto = StoreCrypto::derive("device-passphrase", &salt).unwrap();

        let a = crypto.seal(b"same").unwrap();
        let b = crypto.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_passphrase_fails_to_open() {
        let salt = generate_salt();
        let crypto = StoreCrypto::derive("correct", &salt).unwrap();
        let sealed = crypto.seal(b"secret").unwrap();

        let wrong = StoreCrypto::derive("incorrect", &salt).unwrap();
        assert!(wrong.open(&sealed).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails_to_open() {
        let salt = generate_salt();
        let crypto = StoreCrypto::derive("device-passphrase", &salt).unwrap();
        let mut sealed = crypto.seal(b"secret").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(crypto.open(&sealed).is_err());
    }
}
