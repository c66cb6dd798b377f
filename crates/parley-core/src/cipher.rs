//! At-rest encryption of message text.
//!
//! Messages are sealed with AES-256-GCM under a single server-held key
//! before they reach the message store. The sender and exchange ids are
//! bound in as associated data, so a record copied into another
//! conversation fails to open.
//!
//! This protects stored content against someone reading the store
//! directly. It is not end-to-end encryption: the relay holds the key and
//! decrypts every message it delivers.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parley_protocol::{ExchangeId, UserId};
use std::fmt;
use thiserror::Error;

/// Key length in bytes.
pub const KEY_LEN: usize = 32;

/// IV length in bytes.
pub const IV_LEN: usize = 12;

/// Authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Cipher errors.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Key has the wrong length.
    #[error("Invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Key is not valid base64.
    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(#[from] base64::DecodeError),

    /// Encryption failed.
    #[error("Encryption failed")]
    Encryption,

    /// Ciphertext did not authenticate under this key and context.
    #[error("Message integrity check failed: {0}")]
    Integrity(&'static str),
}

/// Conversation context bound to every ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssociatedData {
    pub sender_id: UserId,
    pub exchange_id: ExchangeId,
}

impl AssociatedData {
    #[must_use]
    pub fn new(sender_id: UserId, exchange_id: ExchangeId) -> Self {
        Self {
            sender_id,
            exchange_id,
        }
    }

    /// Big-endian `sender_id || exchange_id`.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.sender_id.to_be_bytes());
        out[8..].copy_from_slice(&self.exchange_id.to_be_bytes());
        out
    }
}

/// Output of [`MessageCipher::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedText {
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

/// AES-256-GCM cipher for message content.
#[derive(Clone)]
pub struct MessageCipher {
    cipher: Aes256Gcm,
}

impl MessageCipher {
    /// Create a cipher from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not exactly [`KEY_LEN`] bytes.
    pub fn new(key: &[u8]) -> Result<Self, CipherError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
        Ok(Self { cipher })
    }

    /// Create a cipher from a base64-encoded key.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails or the key has the wrong length.
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let key = STANDARD.decode(encoded.trim())?;
        Self::new(&key)
    }

    /// Create a cipher with a fresh random key.
    ///
    /// Anything sealed with it is unreadable once the process exits.
    #[must_use]
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    /// Encrypt `plaintext` under a fresh random IV.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying AEAD rejects the input.
    pub fn encrypt(
        &self,
        plaintext: &str,
        aad: &AssociatedData,
    ) -> Result<SealedText, CipherError> {
        let iv = Aes256Gcm::generate_nonce(&mut OsRng);
        let mut buffer = plaintext.as_bytes().to_vec();

        let tag = self
            .cipher
            .encrypt_in_place_detached(&iv, &aad.to_bytes(), &mut buffer)
            .map_err(|_| CipherError::Encryption)?;

        Ok(SealedText {
            ciphertext: buffer,
            iv: iv.to_vec(),
            auth_tag: tag.to_vec(),
        })
    }

    /// Decrypt and authenticate a sealed message.
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::Integrity`] if the record was tampered with,
    /// belongs to a different context, or was sealed under another key.
    pub fn decrypt(&self, sealed: &SealedText, aad: &AssociatedData) -> Result<String, CipherError> {
        if sealed.iv.len() != IV_LEN {
            return Err(CipherError::Integrity("malformed iv"));
        }
        if sealed.auth_tag.len() != TAG_LEN {
            return Err(CipherError::Integrity("malformed authentication tag"));
        }

        let mut buffer = sealed.ciphertext.clone();
        self.cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&sealed.iv),
                &aad.to_bytes(),
                &mut buffer,
                GenericArray::from_slice(&sealed.auth_tag),
            )
            .map_err(|_| CipherError::Integrity("authentication tag mismatch"))?;

        String::from_utf8(buffer).map_err(|_| CipherError::Integrity("plaintext is not UTF-8"))
    }
}

impl fmt::Debug for MessageCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> MessageCipher {
        MessageCipher::new(&[7u8; KEY_LEN]).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let cipher = cipher();
        let aad = AssociatedData::new(1, 42);
        let longest = "x".repeat(1000);

        for text in ["Hello", "ü🙂 Grüße", longest.as_str()] {
            let sealed = cipher.encrypt(text, &aad).unwrap();
            assert_eq!(sealed.iv.len(), IV_LEN);
            assert_eq!(sealed.auth_tag.len(), TAG_LEN);
            assert_eq!(cipher.decrypt(&sealed, &aad).unwrap(), text);
        }
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let cipher = cipher();
        let aad = AssociatedData::new(1, 42);

        let a = cipher.encrypt("same", &aad).unwrap();
        let b = cipher.encrypt("same", &aad).unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_wrong_context_fails() {
        let cipher = cipher();
        let sealed = cipher.encrypt("Hello", &AssociatedData::new(1, 42)).unwrap();

        assert!(matches!(
            cipher.decrypt(&sealed, &AssociatedData::new(2, 42)),
            Err(CipherError::Integrity(_))
        ));
        assert!(matches!(
            cipher.decrypt(&sealed, &AssociatedData::new(1, 43)),
            Err(CipherError::Integrity(_))
        ));
    }

    #[test]
    fn test_tampering_fails() {
        let cipher = cipher();
        let aad = AssociatedData::new(1, 42);
        let sealed = cipher.encrypt("Hello", &aad).unwrap();

        let mut flipped = sealed.clone();
        flipped.ciphertext[0] ^= 0x01;
        assert!(matches!(
            cipher.decrypt(&flipped, &aad),
            Err(CipherError::Integrity(_))
        ));

        let mut short_tag = sealed.clone();
        short_tag.auth_tag.pop();
        assert!(matches!(
            cipher.decrypt(&short_tag, &aad),
            Err(CipherError::Integrity(_))
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let aad = AssociatedData::new(1, 42);
        let sealed = cipher().encrypt("Hello", &aad).unwrap();

        let other = MessageCipher::generate();
        assert!(matches!(
            other.decrypt(&sealed, &aad),
            Err(CipherError::Integrity(_))
        ));
    }

    #[test]
    fn test_key_loading() {
        assert!(matches!(
            MessageCipher::new(&[0u8; 16]),
            Err(CipherError::InvalidKeyLength(16))
        ));

        let encoded = STANDARD.encode([7u8; KEY_LEN]);
        let from_b64 = MessageCipher::from_base64(&encoded).unwrap();
        let aad = AssociatedData::new(5, 6);
        let sealed = cipher().encrypt("shared key", &aad).unwrap();
        assert_eq!(from_b64.decrypt(&sealed, &aad).unwrap(), "shared key");

        assert!(matches!(
            MessageCipher::from_base64("not base64!"),
            Err(CipherError::InvalidKeyEncoding(_))
        ));
    }
}
