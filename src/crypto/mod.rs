//! # Block & metadata encryption
//!
//! Every object body (compressed block payload or metadata snapshot) is
//! encrypted with AES-256-GCM under the filesystem's data key before it
//! reaches the backend. The data key itself never touches disk in the
//! clear: it is generated once at `mkfs` time, wrapped with a key derived
//! from the user's passphrase (Argon2id), and the wrapped blob is stored
//! under the reserved `s3ql_passphrase` backend key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed: authentication error or corrupted data")]
    DecryptionFailed,

    #[error("ciphertext too short to contain a nonce")]
    Truncated,

    #[error("key derivation failed: {0}")]
    Kdf(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// A 256-bit symmetric key, zeroized on drop.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct DataKey([u8; KEY_LEN]);

impl DataKey {
    /// Generate a fresh random data key (used once, at `mkfs` time).
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        DataKey(bytes)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&self.0).expect("key is exactly 32 bytes")
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext‖tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt data produced by [`DataKey::encrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher()
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// The passphrase-wrapped form of a [`DataKey`], as stored under the
/// `s3ql_passphrase` backend key. Self-contained: carries the Argon2 salt
/// and parameters needed to re-derive the wrapping key from the passphrase.
#[derive(Serialize, Deserialize)]
pub struct WrappedDataKey {
    salt: [u8; SALT_LEN],
    /// `nonce || ciphertext‖tag` produced by encrypting the data key under
    /// the passphrase-derived key.
    wrapped: Vec<u8>,
    /// Argon2 parameters, so future versions can tune cost without breaking
    /// existing filesystems.
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
}

impl WrappedDataKey {
    /// Derive a wrapping key from `passphrase` and encrypt `data_key` under it.
    pub fn wrap(data_key: &DataKey, passphrase: &str) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);

        let (mem_cost_kib, time_cost, parallelism) = (19 * 1024, 2, 1);
        let wrapping_key = derive_wrapping_key(passphrase, &salt, mem_cost_kib, time_cost, parallelism)?;
        let wrapped = wrapping_key.encrypt(&data_key.0)?;

        Ok(WrappedDataKey {
            salt,
            wrapped,
            mem_cost_kib,
            time_cost,
            parallelism,
        })
    }

    /// Re-derive the wrapping key from `passphrase` and recover the data key.
    pub fn unwrap(&self, passphrase: &str) -> Result<DataKey> {
        let wrapping_key = derive_wrapping_key(
            passphrase,
            &self.salt,
            self.mem_cost_kib,
            self.time_cost,
            self.parallelism,
        )?;
        let raw = wrapping_key.decrypt(&self.wrapped)?;
        if raw.len() != KEY_LEN {
            return Err(CryptoError::DecryptionFailed);
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&raw);
        Ok(DataKey(key))
    }
}

fn derive_wrapping_key(
    passphrase: &str,
    salt: &[u8; SALT_LEN],
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
) -> Result<DataKey> {
    let params = argon2::Params::new(mem_cost_kib, time_cost, parallelism, Some(KEY_LEN))
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut out = [0u8; KEY_LEN];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut out)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(DataKey(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trips() {
        let key = DataKey::generate();
        let plaintext = b"s3ql block payload, not that it matters what's in here";
        let ciphertext = key.encrypt(plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        assert_eq!(key.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let key = DataKey::generate();
        let mut ciphertext = key.encrypt(b"hello world").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(key.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let key_a = DataKey::generate();
        let key_b = DataKey::generate();
        let ciphertext = key_a.encrypt(b"hello world").unwrap();
        assert!(key_b.decrypt(&ciphertext).is_err());
    }

    #[test]
    fn passphrase_wrap_unwrap_round_trips() {
        let data_key = DataKey::generate();
        let wrapped = WrappedDataKey::wrap(&data_key, "correct horse battery staple").unwrap();
        let recovered = wrapped.unwrap("correct horse battery staple").unwrap();

        // Keys are compared through their encryption behaviour since DataKey
        // deliberately doesn't implement Eq.
        let probe = b"probe message";
        let ct = data_key.encrypt(probe).unwrap();
        assert_eq!(recovered.decrypt(&ct).unwrap(), probe);
    }

    #[test]
    fn wrong_passphrase_fails_to_unwrap() {
        let data_key = DataKey::generate();
        let wrapped = WrappedDataKey::wrap(&data_key, "right passphrase").unwrap();
        assert!(wrapped.unwrap("wrong passphrase").is_err());
    }
}
