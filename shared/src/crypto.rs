use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

/// AES-GCM nonce length in bytes; prepended to every ciphertext.
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("encryption key must decode to exactly 32 bytes")]
    BadKey,
    #[error("payload is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("payload shorter than the nonce")]
    Truncated,
    #[error("payload could not be decrypted")]
    Decrypt,
    #[error("decrypted payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Symmetric cipher for credential payloads at rest.
///
/// Wire format is `base64(nonce || ciphertext)` with a fresh random nonce
/// per encryption, so encrypting the same payload twice yields different
/// blobs that both decrypt to the original.
#[derive(Clone)]
pub struct PayloadCipher {
    cipher: Aes256Gcm,
}

impl PayloadCipher {
    /// Builds a cipher from a base64-encoded 256-bit key, normally taken
    /// straight from configuration.
    pub fn from_base64_key(key: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64.decode(key.trim())?;
        if bytes.len() != 32 {
            return Err(CryptoError::BadKey);
        }
        let key = Key::<Aes256Gcm>::from_slice(&bytes);
        Ok(PayloadCipher {
            cipher: Aes256Gcm::new(key),
        })
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Decrypt)?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(blob))
    }

    pub fn decrypt(&self, armored: &str) -> Result<Vec<u8>, CryptoError> {
        let blob = BASE64.decode(armored.trim())?;
        if blob.len() < NONCE_LEN {
            return Err(CryptoError::Truncated);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Decrypts a credential payload into the protocol-specific JSON object
    /// plugins expect on stdin.
    pub fn decrypt_json(&self, armored: &str) -> Result<serde_json::Value, CryptoError> {
        let plaintext = self.decrypt(armored)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=";

    #[test]
    fn test_round_trip() {
        let cipher = PayloadCipher::from_base64_key(TEST_KEY).unwrap();
        let payload = br#"{"username":"admin","password":"hunter2"}"#;
        let armored = cipher.encrypt(payload).unwrap();
        assert_eq!(cipher.decrypt(&armored).unwrap(), payload.to_vec());
    }

    #[test]
    fn test_fresh_nonce_per_encryption() {
        let cipher = PayloadCipher::from_base64_key(TEST_KEY).unwrap();
        let first = cipher.encrypt(b"same payload").unwrap();
        let second = cipher.encrypt(b"same payload").unwrap();
        assert_ne!(first, second);
        assert_eq!(cipher.decrypt(&first).unwrap(), b"same payload".to_vec());
        assert_eq!(cipher.decrypt(&second).unwrap(), b"same payload".to_vec());
    }

    #[test]
    fn test_decrypt_json() {
        let cipher = PayloadCipher::from_base64_key(TEST_KEY).unwrap();
        let armored = cipher.encrypt(br#"{"community":"public"}"#).unwrap();
        let value = cipher.decrypt_json(&armored).unwrap();
        assert_eq!(value["community"], "public");
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let cipher = PayloadCipher::from_base64_key(TEST_KEY).unwrap();
        let armored = cipher.encrypt(b"secret").unwrap();
        let mut blob = BASE64.decode(&armored).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        let tampered = BASE64.encode(blob);
        assert!(matches!(
            cipher.decrypt(&tampered),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn test_garbage_inputs() {
        let cipher = PayloadCipher::from_base64_key(TEST_KEY).unwrap();
        assert!(matches!(
            cipher.decrypt("not base64!!!"),
            Err(CryptoError::Encoding(_))
        ));
        assert!(matches!(cipher.decrypt("AAAA"), Err(CryptoError::Truncated)));
    }

    #[test]
    fn test_bad_key_rejected() {
        assert!(matches!(
            PayloadCipher::from_base64_key("c2hvcnQ="),
            Err(CryptoError::BadKey)
        ));
        assert!(PayloadCipher::from_base64_key("!!").is_err());
    }
}
