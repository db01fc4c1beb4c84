use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

use crate::controller::BaseError;

const NONCE_LEN: usize = 12;
const HINT_LEN: usize = 4;

/// Encrypts upstream API keys at rest with AES-256-GCM.
///
/// The 256-bit key is the SHA-256 digest of the platform secret. Ciphertexts are
/// `base64(nonce || sealed)`, so each encryption of the same key differs.
#[derive(Clone)]
pub struct CredentialCodec {
    cipher: Option<Aes256Gcm>,
}

impl std::fmt::Debug for CredentialCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCodec")
            .field("configured", &self.cipher.is_some())
            .finish()
    }
}

impl CredentialCodec {
    pub fn new(secret: Option<&str>) -> Self {
        let cipher = secret
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .and_then(|s| Aes256Gcm::new_from_slice(&Sha256::digest(s.as_bytes())).ok());
        CredentialCodec { cipher }
    }

    pub fn is_configured(&self) -> bool {
        self.cipher.is_some()
    }

    fn cipher(&self) -> Result<&Aes256Gcm, BaseError> {
        self.cipher.as_ref().ok_or_else(|| {
            BaseError::Configuration(Some("model provider secret is not configured".to_string()))
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, BaseError> {
        let cipher = self.cipher()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| BaseError::InternalServerError(Some(format!("failed to encrypt api key: {}", e))))?;
        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(nonce.as_slice());
        payload.extend_from_slice(&sealed);
        Ok(STANDARD.encode(payload))
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, BaseError> {
        let cipher = self.cipher()?;
        let payload = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| BaseError::Configuration(Some(format!("stored api key is not valid base64: {}", e))))?;
        if payload.len() <= NONCE_LEN {
            return Err(BaseError::Configuration(Some("stored api key is truncated".to_string())));
        }
        let (nonce_bytes, sealed) = payload.split_at(NONCE_LEN);
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed)
            .map_err(|_| BaseError::Configuration(Some("stored api key cannot be decrypted with the configured secret".to_string())))?;
        String::from_utf8(plain)
            .map_err(|e| BaseError::Configuration(Some(format!("stored api key is not utf-8: {}", e))))
    }
}

/// Last four characters of the key, or `None` for keys too short to redact safely.
pub fn key_hint(plaintext: &str) -> Option<String> {
    let trimmed = plaintext.trim();
    let chars: Vec<char> = trimmed.chars().collect();
    if chars.len() < HINT_LEN {
        return None;
    }
    Some(chars[chars.len() - HINT_LEN..].iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let codec = CredentialCodec::new(Some("platform-secret"));
        let sealed = codec.encrypt("sk-live-1234abcd").unwrap();
        assert_ne!(sealed, "sk-live-1234abcd");
        assert_ne!(sealed, codec.encrypt("sk-live-1234abcd").unwrap());
        assert_eq!(codec.decrypt(&sealed).unwrap(), "sk-live-1234abcd");
    }

    #[test]
    fn test_wrong_secret_cannot_decrypt() {
        let sealed = CredentialCodec::new(Some("a")).encrypt("sk-test").unwrap();
        let err = CredentialCodec::new(Some("b")).decrypt(&sealed).unwrap_err();
        assert!(matches!(err, BaseError::Configuration(_)));
    }

    #[test]
    fn test_missing_secret_is_configuration_error() {
        let codec = CredentialCodec::new(None);
        assert!(!codec.is_configured());
        assert!(matches!(codec.encrypt("sk"), Err(BaseError::Configuration(_))));
        assert!(!CredentialCodec::new(Some("   ")).is_configured());
    }

    #[test]
    fn test_key_hint() {
        assert_eq!(key_hint(" sk-abcdef12 ").as_deref(), Some("ef12"));
        assert_eq!(key_hint("abcd").as_deref(), Some("abcd"));
        assert_eq!(key_hint("abc"), None);
    }
}
