//! Symmetric encryption of credential blobs under a process-wide key.
//!
//! Ciphertext is self-describing: `base64(nonce || ciphertext+tag)` with a
//! fresh random 12-byte nonce per call. A decryption failure means the key
//! or the stored blob is wrong, which is a configuration fault, never a
//! retriable one.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::Engine;

const NONCE_LEN: usize = 12;

pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Build a vault from the base64-encoded 32-byte key in `CRYPTO_KEY`
    /// form. Anything that is not exactly 32 bytes after decoding is
    /// rejected at startup.
    pub fn from_key_base64(raw: &str) -> Result<Self> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .context("crypto key is not valid base64")?;
        Self::from_key_bytes(&key)
    }

    pub fn from_key_bytes(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(anyhow!(
                "crypto key must be 32 bytes after decoding, got {}",
                key.len()
            ));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| anyhow!("failed to initialize cipher: {e}"))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| anyhow!("encryption failed: {e}"))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> Result<Vec<u8>> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(blob.trim())
            .context("ciphertext is not valid base64")?;
        if raw.len() <= NONCE_LEN {
            return Err(anyhow!("ciphertext too short: {} bytes", raw.len()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| anyhow!("decryption failed: wrong key or corrupted blob"))
    }

    /// Convenience for credential strings.
    pub fn decrypt_string(&self, blob: &str) -> Result<String> {
        let plaintext = self.decrypt(blob)?;
        String::from_utf8(plaintext).context("decrypted credential is not UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> Vault {
        Vault::from_key_bytes(&[7u8; 32]).expect("vault")
    }

    #[test]
    fn round_trip_is_identity() {
        let vault = test_vault();
        for plaintext in [&b""[..], b"api-key-123", &[0u8; 1024][..]] {
            let blob = vault.encrypt(plaintext).expect("encrypt");
            assert_eq!(vault.decrypt(&blob).expect("decrypt"), plaintext);
        }
    }

    #[test]
    fn nonces_differ_between_calls() {
        let vault = test_vault();
        let a = vault.encrypt(b"same input").expect("encrypt");
        let b = vault.encrypt(b"same input").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_blob_is_rejected() {
        let vault = test_vault();
        let blob = vault.encrypt(b"secret").expect("encrypt");
        let mut raw = base64::engine::general_purpose::STANDARD
            .decode(&blob)
            .expect("decode");
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = base64::engine::general_purpose::STANDARD.encode(raw);
        assert!(vault.decrypt(&tampered).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let vault = test_vault();
        let other = Vault::from_key_bytes(&[8u8; 32]).expect("vault");
        let blob = vault.encrypt(b"secret").expect("encrypt");
        assert!(other.decrypt(&blob).is_err());
    }

    #[test]
    fn key_length_is_enforced() {
        assert!(Vault::from_key_bytes(&[1u8; 16]).is_err());
        assert!(Vault::from_key_base64("not base64!!").is_err());
    }
}
