//! Credential vault: AES-256-GCM encryption of tokens at rest.
//!
//! Blob layout is `base64(nonce[12] || tag[16] || ciphertext)`, so a stored
//! value carries everything needed to decrypt it except the key.

use crate::{Error, Result};
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use sha2::{Digest, Sha256};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Build a vault from the configured secret. Missing secret is fatal.
    pub fn new(secret: Option<&str>) -> Result<Self> {
        let secret = secret
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::Config("ROADSYNC_ENCRYPTION_KEY is not set".to_string()))?;
        let key = derive_key(secret);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Config(format!("invalid encryption key: {e}")))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        // aes-gcm appends the tag; the stored layout puts it before the ciphertext.
        let sealed = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Crypto(format!("encrypt: {e}")))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(tag);
        out.extend_from_slice(ciphertext);
        Ok(STANDARD.encode(out))
    }

    pub fn decrypt(&self, blob: &str) -> Result<String> {
        let data = STANDARD
            .decode(blob.trim())
            .map_err(|e| Error::Crypto(format!("decode blob: {e}")))?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(Error::Crypto(
                "ciphertext too short (missing nonce or tag)".to_string(),
            ));
        }
        let (nonce_bytes, rest) = data.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let mut sealed = Vec::with_capacity(rest.len());
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), sealed.as_ref())
            .map_err(|e| Error::Crypto(format!("decrypt: {e}")))?;
        String::from_utf8(plaintext).map_err(|e| Error::Crypto(format!("decrypt: {e}")))
    }
}

/// Turn the configured secret into a 256-bit key.
///
/// A 64-char hex string or a 32-byte raw string is used as-is so data
/// encrypted under either encoding keeps decrypting. Anything else is hashed.
pub fn derive_key(secret: &str) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    if secret.len() == KEY_LEN * 2 {
        if let Ok(bytes) = hex::decode(secret) {
            key.copy_from_slice(&bytes);
            return key;
        }
    }
    if secret.len() == KEY_LEN {
        key.copy_from_slice(secret.as_bytes());
        return key;
    }
    key.copy_from_slice(&Sha256::digest(secret.as_bytes()));
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> CredentialVault {
        CredentialVault::new(Some("unit-test-secret")).unwrap()
    }

    #[test]
    fn roundtrip_including_empty_string() {
        let v = vault();
        for plaintext in ["", "pat-na1-0000", "ünïcødé token ✓"] {
            let blob = v.encrypt(plaintext).unwrap();
            assert_eq!(v.decrypt(&blob).unwrap(), plaintext);
        }
    }

    #[test]
    fn same_plaintext_encrypts_differently() {
        let v = vault();
        let a = v.encrypt("refresh-token").unwrap();
        let b = v.encrypt("refresh-token").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn blob_layout_is_nonce_tag_ciphertext() {
        let v = vault();
        let blob = v.encrypt("abcd").unwrap();
        let raw = STANDARD.decode(blob).unwrap();
        assert_eq!(raw.len(), NONCE_LEN + TAG_LEN + 4);
    }

    #[test]
    fn missing_secret_is_config_error() {
        assert!(matches!(CredentialVault::new(None), Err(Error::Config(_))));
        assert!(matches!(CredentialVault::new(Some("")), Err(Error::Config(_))));
    }

    #[test]
    fn wrong_key_and_tampering_fail() {
        let blob = vault().encrypt("secret").unwrap();
        let other = CredentialVault::new(Some("another-secret")).unwrap();
        assert!(matches!(other.decrypt(&blob), Err(Error::Crypto(_))));

        let mut raw = STANDARD.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(matches!(
            vault().decrypt(&STANDARD.encode(raw)),
            Err(Error::Crypto(_))
        ));
        assert!(matches!(vault().decrypt("AAAA"), Err(Error::Crypto(_))));
    }

    #[test]
    fn derive_key_accepts_hex_raw_and_hashes_the_rest() {
        let hex_secret = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let key = derive_key(hex_secret);
        assert_eq!(key[1], 0x11);
        assert_eq!(key[31], 0xff);

        let raw_secret = "0123456789abcdef0123456789abcdef";
        assert_eq!(&derive_key(raw_secret), raw_secret.as_bytes());

        let hashed = derive_key("short");
        assert_eq!(hashed.as_slice(), Sha256::digest(b"short").as_slice());
    }
}
