//! Credential encryption for stored server passwords.
//!
//! Ciphertexts are `base64(nonce || AES-256-GCM ciphertext)` with a key
//! derived from a passphrase with SHA-256.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid encryption key")]
    InvalidKey,
    #[error("Base64 decode failed: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("Ciphertext too short")]
    Truncated,
    #[error("Decryption failed")]
    Authentication,
    #[error("Encryption failed")]
    Encryption,
    #[error("Decrypted value is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Encrypts and decrypts credentials with one tenant-independent key.
#[derive(Clone)]
pub struct Cipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(..)")
    }
}

impl Cipher {
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CryptoError> {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let key: [u8; 32] = hasher.finalize().into();
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;

        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(&out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, CryptoError> {
        let data = base64::engine::general_purpose::STANDARD.decode(encoded.trim())?;
        if data.len() <= NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| CryptoError::Authentication)?;
        Ok(String::from_utf8(plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = Cipher::from_passphrase("test-key").unwrap();
        let enc1 = cipher.encrypt("s3cret!").unwrap();
        let enc2 = cipher.encrypt("s3cret!").unwrap();
        assert_ne!(enc1, enc2);
        assert_eq!(cipher.decrypt(&enc1).unwrap(), "s3cret!");
        assert_eq!(cipher.decrypt(&enc2).unwrap(), "s3cret!");
    }

    #[test]
    fn test_decrypt_failures_are_typed() {
        let cipher = Cipher::from_passphrase("test-key").unwrap();
        let other = Cipher::from_passphrase("other-key").unwrap();
        let enc = cipher.encrypt("pw").unwrap();

        assert!(matches!(other.decrypt(&enc), Err(CryptoError::Authentication)));
        assert!(matches!(cipher.decrypt("***"), Err(CryptoError::Encoding(_))));
        assert!(matches!(cipher.decrypt("AAAA"), Err(CryptoError::Truncated)));
    }
}
