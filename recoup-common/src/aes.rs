//! Encryption-at-rest for merchant OAuth tokens.
//!
//! Tokens are encrypted with AES-256-GCM under a single process-wide key
//! loaded from `ENCRYPTION_KEY` (64 hex chars = 32 bytes). Each encryption
//! samples a fresh random 96-bit nonce; the stored framing is
//! `nonce || tag || ciphertext`, hex-encoded, so a row is self-contained.
//!
//! Decryption failure does not panic and does not bubble as a hard error at
//! the store layer: an unrecoverable row must not halt unrelated paths, so
//! callers fall back to surfacing the raw field (logged).

use std::fmt;

use ring::aead::{self, LessSafeKey, UnboundKey};
use thiserror::Error;

use crate::rng::SysRng;

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;
/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = aead::NONCE_LEN;
/// AES-256-GCM auth tag length in bytes.
const TAG_LEN: usize = 16;

/// Process-wide cipher for token fields at rest.
pub struct TokenCipher(LessSafeKey);

#[derive(Clone, Debug, Error)]
#[error("decrypt error: ciphertext or framing may be corrupted")]
pub struct DecryptError;

#[derive(Clone, Debug, Error)]
pub enum KeyError {
    #[error("ENCRYPTION_KEY must be valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("ENCRYPTION_KEY must be exactly {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

impl fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenCipher(..)")
    }
}

impl TokenCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        let unbound = UnboundKey::new(&aead::AES_256_GCM, key)
            .expect("AES_256_GCM accepts all 32-byte keys");
        Self(LessSafeKey::new(unbound))
    }

    /// Parse a 64-hex-char key, the `ENCRYPTION_KEY` wire format.
    pub fn from_hex(key_hex: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(key_hex)?;
        let key: [u8; KEY_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Length(bytes.len()))?;
        Ok(Self::new(&key))
    }

    /// A throwaway random key for dev runs without `ENCRYPTION_KEY` set.
    /// Tokens encrypted under it do not survive a process restart.
    pub fn ephemeral(rng: &SysRng) -> Self {
        Self::new(&rng.gen_bytes::<KEY_LEN>())
    }

    /// Encrypt a token, returning the hex `nonce || tag || ciphertext`.
    pub fn encrypt(&self, rng: &SysRng, plaintext: &str) -> String {
        let nonce_bytes: [u8; NONCE_LEN] = rng.gen_bytes();
        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        let tag = self
            .0
            .seal_in_place_separate_tag(nonce, aead::Aad::empty(), &mut in_out)
            .expect("Token plaintexts are far below the AES-GCM length cap");

        let mut framed =
            Vec::with_capacity(NONCE_LEN + TAG_LEN + in_out.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(tag.as_ref());
        framed.extend_from_slice(&in_out);
        hex::encode(framed)
    }

    /// Decrypt a hex `nonce || tag || ciphertext` frame produced by
    /// [`encrypt`](Self::encrypt). Fails on any tampering with the frame.
    pub fn decrypt(&self, data_hex: &str) -> Result<String, DecryptError> {
        let data = hex::decode(data_hex).map_err(|_| DecryptError)?;
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(DecryptError);
        }

        let (nonce_bytes, rest) = data.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);

        let nonce_bytes: [u8; NONCE_LEN] = nonce_bytes
            .try_into()
            .expect("split_at returned exactly NONCE_LEN bytes");
        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

        // ring expects `ciphertext || tag` contiguously.
        let mut in_out = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        in_out.extend_from_slice(ciphertext);
        in_out.extend_from_slice(tag);

        let plaintext = self
            .0
            .open_in_place(nonce, aead::Aad::empty(), &mut in_out)
            .map_err(|_| DecryptError)?;

        String::from_utf8(plaintext.to_vec()).map_err(|_| DecryptError)
    }
}

#[cfg(test)]
mod test {
    use proptest::{prelude::any, proptest};

    use super::*;

    #[test]
    fn key_parsing() {
        let key_hex = "11".repeat(KEY_LEN);
        TokenCipher::from_hex(&key_hex).unwrap();

        assert!(matches!(
            TokenCipher::from_hex("not hex"),
            Err(KeyError::Hex(_))
        ));
        assert!(matches!(
            TokenCipher::from_hex("aabb"),
            Err(KeyError::Length(2))
        ));
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let rng = SysRng::new();
        let cipher = TokenCipher::ephemeral(&rng);

        proptest!(|(plaintext in any::<String>())| {
            let encrypted = cipher.encrypt(&rng, &plaintext);
            let decrypted = cipher.decrypt(&encrypted).unwrap();
            assert_eq!(plaintext, decrypted);

            // Random nonces: same plaintext never encrypts identically.
            let encrypted2 = cipher.encrypt(&rng, &plaintext);
            assert_ne!(encrypted, encrypted2);
        });
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let rng = SysRng::new();
        let cipher = TokenCipher::ephemeral(&rng);
        let encrypted = cipher.encrypt(&rng, "sk_live_abc123");

        let mut bytes = hex::decode(&encrypted).unwrap();
        for index in [0, NONCE_LEN, NONCE_LEN + TAG_LEN] {
            bytes[index] ^= 0x01;
            assert!(cipher.decrypt(&hex::encode(&bytes)).is_err());
            bytes[index] ^= 0x01;
        }

        // Undamaged frame still decrypts.
        cipher.decrypt(&hex::encode(&bytes)).unwrap();
    }

    #[test]
    fn wrong_key_fails() {
        let rng = SysRng::new();
        let cipher = TokenCipher::ephemeral(&rng);
        let other = TokenCipher::ephemeral(&rng);
        let encrypted = cipher.encrypt(&rng, "rt_live_xyz");
        assert!(other.decrypt(&encrypted).is_err());
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let rng = SysRng::new();
        let cipher = TokenCipher::ephemeral(&rng);
        assert!(cipher.decrypt("").is_err());
        assert!(cipher.decrypt("aabbcc").is_err());
    }
}
