//! Cryptographic primitives consumed by the key-material machinery.
//!
//! The transport only ever talks to the [`CryptoProvider`] trait; the
//! default implementation delegates to the RustCrypto crates. Key
//! lengths follow the passphrase-derived key size: 16, 24 or 32 bytes.

use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{AesGcm, Nonce};
use aes_kw::{KekAes128, KekAes192, KekAes256};
use ctr::cipher::{KeyIvInit, StreamCipher};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use thiserror::Error;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes192Ctr = ctr::Ctr128BE<Aes192>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

type Aes128Gcm = AesGcm<Aes128, aes_gcm::aead::consts::U12>;
type Aes192Gcm = AesGcm<Aes192, aes_gcm::aead::consts::U12>;
type Aes256Gcm = AesGcm<Aes256, aes_gcm::aead::consts::U12>;

/// Length of the GCM authentication tag appended to the payload.
pub const GCM_TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("unsupported key length {0}")]
    BadKeyLength(usize),
    #[error("key unwrap integrity check failed")]
    UnwrapIntegrity,
    #[error("aead authentication failed")]
    AeadAuth,
    #[error("malformed key material: {0}")]
    Malformed(String),
}

pub trait CryptoProvider: Send + Sync {
    /// PBKDF2-HMAC-SHA1 passphrase stretching.
    fn derive_kek(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        key_len: usize,
    ) -> Result<Vec<u8>, CryptoError>;

    /// RFC 3394 key wrap with the 8-byte integrity prefix.
    fn wrap_key(&self, kek: &[u8], sek: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Inverse of `wrap_key`; fails when the blob was altered or the KEK
    /// is wrong.
    fn unwrap_key(&self, kek: &[u8], blob: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// In-place AES-CTR keystream application (encrypts and decrypts).
    fn ctr_crypt(&self, key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError>;

    /// AES-GCM seal; returns ciphertext with the tag appended.
    fn gcm_seal(
        &self,
        key: &[u8],
        nonce: &[u8; 12],
        aad: &[u8],
        plain: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// AES-GCM open of a `ciphertext || tag` buffer.
    fn gcm_open(
        &self,
        key: &[u8],
        nonce: &[u8; 12],
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// Default provider backed by the RustCrypto crates.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdCrypto;

impl CryptoProvider for StdCrypto {
    fn derive_kek(
        &self,
        password: &[u8],
        salt: &[u8],
        iterations: u32,
        key_len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        if ![16, 20, 24, 32].contains(&key_len) {
            return Err(CryptoError::BadKeyLength(key_len));
        }
        let mut out = vec![0u8; key_len];
        pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut out);
        Ok(out)
    }

    fn wrap_key(&self, kek: &[u8], sek: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = vec![0u8; sek.len() + 8];
        let res = match kek.len() {
            16 => KekAes128::from(<[u8; 16]>::try_from(kek).unwrap()).wrap(sek, &mut out),
            24 => KekAes192::from(<[u8; 24]>::try_from(kek).unwrap()).wrap(sek, &mut out),
            32 => KekAes256::from(<[u8; 32]>::try_from(kek).unwrap()).wrap(sek, &mut out),
            n => return Err(CryptoError::BadKeyLength(n)),
        };
        res.map_err(|_| CryptoError::Malformed("key wrap failed".into()))?;
        Ok(out)
    }

    fn unwrap_key(&self, kek: &[u8], blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < 16 || blob.len() % 8 != 0 {
            return Err(CryptoError::Malformed(format!(
                "wrap blob of {} bytes",
                blob.len()
            )));
        }
        let mut out = vec![0u8; blob.len() - 8];
        let res = match kek.len() {
            16 => KekAes128::from(<[u8; 16]>::try_from(kek).unwrap()).unwrap(blob, &mut out),
            24 => KekAes192::from(<[u8; 24]>::try_from(kek).unwrap()).unwrap(blob, &mut out),
            32 => KekAes256::from(<[u8; 32]>::try_from(kek).unwrap()).unwrap(blob, &mut out),
            n => return Err(CryptoError::BadKeyLength(n)),
        };
        res.map_err(|_| CryptoError::UnwrapIntegrity)?;
        Ok(out)
    }

    fn ctr_crypt(&self, key: &[u8], iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
        match key.len() {
            16 => Aes128Ctr::new_from_slices(key, iv)
                .map_err(|_| CryptoError::BadKeyLength(key.len()))?
                .apply_keystream(data),
            24 => Aes192Ctr::new_from_slices(key, iv)
                .map_err(|_| CryptoError::BadKeyLength(key.len()))?
                .apply_keystream(data),
            32 => Aes256Ctr::new_from_slices(key, iv)
                .map_err(|_| CryptoError::BadKeyLength(key.len()))?
                .apply_keystream(data),
            n => return Err(CryptoError::BadKeyLength(n)),
        }
        Ok(())
    }

    fn gcm_seal(
        &self,
        key: &[u8],
        nonce: &[u8; 12],
        aad: &[u8],
        plain: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let payload = Payload { msg: plain, aad };
        let nonce = Nonce::from_slice(nonce);
        let sealed = match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::BadKeyLength(key.len()))?
                .encrypt(nonce, payload),
            24 => Aes192Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::BadKeyLength(key.len()))?
                .encrypt(nonce, payload),
            32 => Aes256Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::BadKeyLength(key.len()))?
                .encrypt(nonce, payload),
            n => return Err(CryptoError::BadKeyLength(n)),
        };
        sealed.map_err(|_| CryptoError::AeadAuth)
    }

    fn gcm_open(
        &self,
        key: &[u8],
        nonce: &[u8; 12],
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < GCM_TAG_LEN {
            return Err(CryptoError::Malformed("sealed data shorter than tag".into()));
        }
        let payload = Payload { msg: sealed, aad };
        let nonce = Nonce::from_slice(nonce);
        let plain = match key.len() {
            16 => Aes128Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::BadKeyLength(key.len()))?
                .decrypt(nonce, payload),
            24 => Aes192Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::BadKeyLength(key.len()))?
                .decrypt(nonce, payload),
            32 => Aes256Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::BadKeyLength(key.len()))?
                .decrypt(nonce, payload),
            n => return Err(CryptoError::BadKeyLength(n)),
        };
        plain.map_err(|_| CryptoError::AeadAuth)
    }
}
