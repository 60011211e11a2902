//! The AEAD contract the framing layer consumes. Core code never branches on
//! a concrete cipher; it calls [`AeadCipher::seal`]/[`AeadCipher::open`] on
//! whatever [`SessionCipher`] the session negotiated during registration.
//! Block-cipher internals are out of scope here — this module only wires the
//! `aead`-crate contract to the two families the wire format can name.

use aead::{Aead, AeadCore, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;

use super::header::{MAGIC_AES_GCM, MAGIC_CHACHA20_POLY1305};
use crate::error::{Error, Result};

/// Byte length of the random nonce prefixed to every sealed body.
pub const NONCE_LEN: usize = 12;
/// Byte length of a session key, shared by both supported ciphers.
pub const KEY_LEN: usize = 32;

/// Seals and opens frame bodies. Implemented by [`SessionCipher`]; kept as a
/// trait so the rest of the crate depends on the contract, not on which AEAD
/// family backs a given session.
pub trait AeadCipher {
    /// The magic byte a sealed body carries in its [`super::header::FrameHeader`].
    fn magic(&self) -> u8;

    /// Seals `plaintext`, returning `nonce || ciphertext || tag`.
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Opens a body produced by [`AeadCipher::seal`], verifying the tag.
    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// The two AEAD families the wire format can select between, keyed by the
/// frame header's magic byte.
#[derive(Clone)]
pub enum SessionCipher {
    AesGcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

impl SessionCipher {
    pub fn aes_gcm(key: &[u8; KEY_LEN]) -> Self {
        SessionCipher::AesGcm(Aes256Gcm::new(key.into()))
    }

    pub fn chacha20poly1305(key: &[u8; KEY_LEN]) -> Self {
        SessionCipher::ChaCha20Poly1305(ChaCha20Poly1305::new(key.into()))
    }

    /// Picks the cipher family a frame header's magic byte names.
    pub fn for_magic(magic: u8, key: &[u8; KEY_LEN]) -> Result<Self> {
        match magic {
            MAGIC_AES_GCM => Ok(Self::aes_gcm(key)),
            MAGIC_CHACHA20_POLY1305 => Ok(Self::chacha20poly1305(key)),
            other => Err(Error::crypto(format!("unsupported cipher magic {other:#x}"))),
        }
    }
}

impl AeadCipher for SessionCipher {
    fn magic(&self) -> u8 {
        match self {
            SessionCipher::AesGcm(_) => MAGIC_AES_GCM,
            SessionCipher::ChaCha20Poly1305(_) => MAGIC_CHACHA20_POLY1305,
        }
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            SessionCipher::AesGcm(cipher) => seal_with(cipher, plaintext),
            SessionCipher::ChaCha20Poly1305(cipher) => seal_with(cipher, plaintext),
        }
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        match self {
            SessionCipher::AesGcm(cipher) => open_with(cipher, sealed),
            SessionCipher::ChaCha20Poly1305(cipher) => open_with(cipher, sealed),
        }
    }
}

fn seal_with<C>(cipher: &C, plaintext: &[u8]) -> Result<Vec<u8>>
where
    C: Aead + AeadCore,
{
    let nonce = C::generate_nonce(&mut aead::OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| Error::crypto("seal failed"))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_with<C>(cipher: &C, sealed: &[u8]) -> Result<Vec<u8>>
where
    C: Aead + AeadCore,
{
    if sealed.len() < NONCE_LEN {
        return Err(Error::crypto("sealed body shorter than nonce"));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = aead::Nonce::<C>::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| Error::crypto("open failed: authentication tag mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_gcm_round_trips() {
        let key = [7u8; KEY_LEN];
        let cipher = SessionCipher::aes_gcm(&key);
        let sealed = cipher.seal(b"registration payload").unwrap();
        let opened = cipher.open(&sealed).unwrap();
        assert_eq!(opened, b"registration payload");
    }

    #[test]
    fn chacha20poly1305_round_trips() {
        let key = [3u8; KEY_LEN];
        let cipher = SessionCipher::chacha20poly1305(&key);
        let sealed = cipher.seal(b"heartbeat").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), b"heartbeat");
    }

    #[test]
    fn tampered_body_fails_to_open() {
        let key = [1u8; KEY_LEN];
        let cipher = SessionCipher::aes_gcm(&key);
        let mut sealed = cipher.seal(b"task result").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(cipher.open(&sealed).is_err());
    }

    #[test]
    fn for_magic_rejects_unknown_byte() {
        let key = [0u8; KEY_LEN];
        assert!(SessionCipher::for_magic(0x99, &key).is_err());
    }
}
