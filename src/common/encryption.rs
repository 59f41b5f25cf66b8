//! Datagram encryption.
//!
//! Every datagram, whatever its type, goes through a [`PacketCipher`] on the way out and
//! on the way in.  With no key configured the [`Plaintext`] cipher passes bytes through.
//! [`AesCipher`] is AES-256-CBC with a random IV in front of each datagram.
use log::info;
use openssl::{
    base64,
    hash::{hash, MessageDigest},
    rand::rand_bytes,
    symm::{decrypt, encrypt, Cipher},
};
use simple_error::bail;
use std::{path::Path, sync::Arc};

use super::{box_error::BoxError, buffers_config::MAX_FRAME_SIZE};

const IV_SIZE: usize = 16;
const BLOCK_SIZE: usize = 16;

#[cfg_attr(test, mockall::automock)]
pub trait PacketCipher: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, BoxError>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, BoxError>;
}

/// No encryption at all
pub struct Plaintext;

impl PacketCipher for Plaintext {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, BoxError> {
        Ok(plain.to_vec())
    }
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, BoxError> {
        Ok(data.to_vec())
    }
}

pub struct AesCipher {
    key: [u8; 32],
}

impl AesCipher {
    /// key is the SHA-256 of whatever material you hand in
    pub fn from_key_material(material: &[u8]) -> Result<AesCipher, BoxError> {
        if material.is_empty() {
            bail!("empty key material");
        }
        let digest = hash(MessageDigest::sha256(), material)?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Ok(AesCipher { key })
    }
    /// `key` is either a path to a key file or the key itself as base64
    pub fn load(key: &str) -> Result<AesCipher, BoxError> {
        if Path::new(key).is_file() {
            info!("loading key from file {}", key);
            return AesCipher::from_key_material(&std::fs::read(key)?);
        }
        match base64::decode_block(key.trim()) {
            Ok(material) => AesCipher::from_key_material(&material),
            Err(_) => bail!("key is neither a readable file nor base64"),
        }
    }
}

impl PacketCipher for AesCipher {
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, BoxError> {
        let mut iv = [0u8; IV_SIZE];
        rand_bytes(&mut iv)?;
        let sealed = encrypt(Cipher::aes_256_cbc(), &self.key, Some(&iv), plain)?;
        if sealed.len() + IV_SIZE > MAX_FRAME_SIZE {
            bail!("encrypted datagram too large: {}", sealed.len() + IV_SIZE);
        }
        let mut out = Vec::with_capacity(IV_SIZE + sealed.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&sealed);
        Ok(out)
    }
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, BoxError> {
        if data.len() < IV_SIZE + BLOCK_SIZE {
            bail!("datagram too short to decrypt: {}", data.len());
        }
        let (iv, sealed) = data.split_at(IV_SIZE);
        Ok(decrypt(Cipher::aes_256_cbc(), &self.key, Some(iv), sealed)?)
    }
}

/// Pick the cipher for an optional key setting
pub fn cipher_from_key(key: Option<&str>) -> Result<Arc<dyn PacketCipher>, BoxError> {
    match key {
        Some(k) if !k.is_empty() => Ok(Arc::new(AesCipher::load(k)?)),
        _ => {
            info!("no key configured, traffic is not encrypted");
            Ok(Arc::new(Plaintext))
        }
    }
}
