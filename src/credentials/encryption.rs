//! AES-256-GCM encryption for stored tokens.
//!
//! Each token is encrypted separately with a fresh random nonce. The nonce is
//! prepended to the ciphertext and the pair is base64-encoded, so a stored
//! token is a single opaque string. The master key must be 32 bytes (256 bits).

use super::Cipher;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Validates that the master key is exactly 32 bytes when base64 decoded.
///
/// # Returns
/// * `Ok(Vec<u8>)` - Decoded key bytes (32 bytes)
/// * `Err` - If key is invalid length or invalid base64
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64)
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// [`Cipher`] backed by AES-256-GCM.
///
/// # Security
/// - A cryptographically secure random nonce per call (never reused)
/// - Authenticated encryption: tampering or a wrong key fails decryption
/// - The key lives in memory only
pub struct AesGcmCipher {
    cipher: Aes256Gcm,
}

impl AesGcmCipher {
    /// Creates a cipher from a base64-encoded 32-byte key.
    pub fn new(key_base64: &str) -> Result<Self> {
        let key = validate_key(key_base64).context("Invalid encryption key")?;
        Self::from_bytes(&key)
    }

    /// Creates a cipher from raw key bytes (must be 32 bytes).
    pub fn from_bytes(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
        }
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;
        Ok(Self { cipher })
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| anyhow!("Encryption failed: {}", e))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let sealed = BASE64
            .decode(ciphertext)
            .context("Failed to decode ciphertext")?;

        if sealed.len() <= NONCE_SIZE {
            return Err(anyhow!(
                "Ciphertext too short: expected more than {} bytes, got {}",
                NONCE_SIZE,
                sealed.len()
            ));
        }

        let (nonce_bytes, body) = sealed.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

        String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cipher(byte: u8) -> AesGcmCipher {
        AesGcmCipher::from_bytes(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_key_validation() {
        let valid_key = BASE64.encode([0u8; 32]);
        assert!(validate_key(&valid_key).is_ok());
        assert!(AesGcmCipher::new(&valid_key).is_ok());

        // Too short
        let short_key = BASE64.encode([0u8; 16]);
        assert!(validate_key(&short_key).is_err());

        // Too long
        let long_key = BASE64.encode([0u8; 64]);
        assert!(validate_key(&long_key).is_err());

        // Invalid base64
        assert!(validate_key("not-valid-base64!@#$").is_err());
        assert!(AesGcmCipher::from_bytes(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_decrypt_recovers_plaintext() {
        let cipher = test_cipher(0);
        for plaintext in ["ya29.a0AfH6SM-access", "", "ключ-🔑"] {
            let sealed = cipher.encrypt(plaintext).unwrap();
            assert_ne!(sealed, plaintext);
            assert_eq!(cipher.decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_encrypt_is_not_deterministic() {
        let cipher = test_cipher(0);
        let a = cipher.encrypt("same-plaintext").unwrap();
        let b = cipher.encrypt("same-plaintext").unwrap();

        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), "same-plaintext");
        assert_eq!(cipher.decrypt(&b).unwrap(), "same-plaintext");
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = test_cipher(0).encrypt("secret").unwrap();
        assert!(test_cipher(1).decrypt(&sealed).is_err());
    }

    #[test]
    fn test_malformed_ciphertext_fails() {
        let cipher = test_cipher(0);
        assert!(cipher.decrypt("not base64 at all!").is_err());
        assert!(cipher.decrypt(&BASE64.encode([7u8; 8])).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = test_cipher(0);
        let sealed = cipher.encrypt("secret").unwrap();

        let mut bytes = BASE64.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        assert!(cipher.decrypt(&BASE64.encode(bytes)).is_err());
    }
}
