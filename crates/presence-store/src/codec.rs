//! Embedding BLOB encoding.
//!
//! Plain blobs are the raw little-endian `f32` sequence. Encrypted blobs are
//! `MAGIC || nonce || AES-256-GCM ciphertext` of the plain encoding.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use presence_core::{CoreError, Embedding, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::Path;

const MAGIC: &[u8; 5] = b"PENC1";
const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for embeddings at rest.
#[derive(Clone)]
pub struct EmbeddingCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for EmbeddingCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EmbeddingCipher(..)")
    }
}

impl EmbeddingCipher {
    /// Derive the key as SHA-256 of `secret`.
    pub fn from_secret(secret: &[u8]) -> Self {
        let digest = Sha256::digest(secret);
        let key = Key::<Aes256Gcm>::from_slice(&digest);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Derive the key from the contents of a key file.
    pub fn from_key_file(path: &Path) -> Result<Self> {
        let secret = std::fs::read(path).map_err(|e| {
            CoreError::StorageUnavailable(format!("key file {}: {e}", path.display()))
        })?;
        if secret.is_empty() {
            return Err(CoreError::InvalidConfig(format!(
                "key file {} is empty",
                path.display()
            )));
        }
        Ok(Self::from_secret(&secret))
    }

    fn seal(&self, plain: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .map_err(|_| CoreError::StorageUnavailable("embedding encryption failed".into()))?;

        let mut blob = Vec::with_capacity(MAGIC.len() + NONCE_LEN + sealed.len());
        blob.extend_from_slice(MAGIC);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    fn open(&self, blob: &[u8]) -> Result<Vec<u8>> {
        let body = &blob[MAGIC.len()..];
        if body.len() < NONCE_LEN {
            return Err(CoreError::StorageUnavailable(
                "truncated encrypted embedding".into(),
            ));
        }
        let (nonce, sealed) = body.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| {
                CoreError::StorageUnavailable(
                    "embedding decryption failed (wrong key?)".into(),
                )
            })
    }
}

fn is_sealed(blob: &[u8]) -> bool {
    blob.starts_with(MAGIC)
}

pub fn encode(embedding: &Embedding, cipher: Option<&EmbeddingCipher>) -> Result<Vec<u8>> {
    let plain: Vec<u8> = embedding
        .as_slice()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    match cipher {
        Some(c) => c.seal(&plain),
        None => Ok(plain),
    }
}

pub fn decode(blob: &[u8], cipher: Option<&EmbeddingCipher>) -> Result<Embedding> {
    let plain = match (is_sealed(blob), cipher) {
        (true, Some(c)) => c.open(blob)?,
        (true, None) => {
            return Err(CoreError::StorageUnavailable(
                "embedding is encrypted but no key was configured".into(),
            ))
        }
        (false, _) => blob.to_vec(),
    };

    if plain.len() % 4 != 0 {
        return Err(CoreError::StorageUnavailable(format!(
            "embedding blob length {} is not a multiple of 4",
            plain.len()
        )));
    }
    let values = plain
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Embedding::new(values)
        .map_err(|e| CoreError::StorageUnavailable(format!("corrupt stored embedding: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb() -> Embedding {
        Embedding::new(vec![0.125, -0.5, 1.0e-7, 0.333_333_34]).unwrap()
    }

    #[test]
    fn test_plain_blob_is_little_endian_f32() {
        let blob = encode(&emb(), None).unwrap();
        assert_eq!(blob.len(), 16);
        assert_eq!(&blob[..4], &0.125f32.to_le_bytes());
        assert_eq!(decode(&blob, None).unwrap(), emb());
    }

    #[test]
    fn test_sealed_blob_roundtrip_bit_identical() {
        let cipher = EmbeddingCipher::from_secret(b"hunter2");
        let blob = encode(&emb(), Some(&cipher)).unwrap();
        assert!(is_sealed(&blob));
        let back = decode(&blob, Some(&cipher)).unwrap();
        for (a, b) in back.as_slice().iter().zip(emb().as_slice()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_sealed_blob_needs_right_key() {
        let blob = encode(&emb(), Some(&EmbeddingCipher::from_secret(b"a"))).unwrap();
        assert!(decode(&blob, None).unwrap_err().is_storage());
        assert!(decode(&blob, Some(&EmbeddingCipher::from_secret(b"b")))
            .unwrap_err()
            .is_storage());
    }

    #[test]
    fn test_nonce_differs_per_write() {
        let cipher = EmbeddingCipher::from_secret(b"k");
        let a = encode(&emb(), Some(&cipher)).unwrap();
        let b = encode(&emb(), Some(&cipher)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_truncated_blob_rejected() {
        assert!(decode(&[0, 0, 128], None).unwrap_err().is_storage());
    }
}
