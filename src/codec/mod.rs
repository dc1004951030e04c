//! Codec (C2): compress then authenticate-encrypt; decrypt then decompress.
//! Two operating modes share the same per-buffer transform: whole-buffer for
//! small files, and one independent transform per fixed-size chunk for large
//! ones (see `chunker`).

pub mod chunker;

use std::io::{Read, Write};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce as AesNonce};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::RngCore;

use crate::config::EncryptionAlgo;

const AES_NONCE_LEN: usize = 12;
const XCHACHA_NONCE_LEN: usize = 24;

/// Result of encoding one payload (a whole file or one chunk).
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    pub compressed_size: u64,
    pub encrypted_size: u64,
}

enum Cipher {
    Aes256Gcm(Aes256Gcm),
    XChaCha20Poly1305(XChaCha20Poly1305),
}

pub struct Codec {
    cipher: Cipher,
    level: Compression,
}

impl Codec {
    pub fn new(key_material: &str, algo: EncryptionAlgo, compression_level: u32) -> anyhow::Result<Self> {
        let key = parse_key(key_material)?;
        let cipher = match algo {
            EncryptionAlgo::Aes256Gcm => Cipher::Aes256Gcm(Aes256Gcm::new_from_slice(&key)?),
            EncryptionAlgo::XChaCha20Poly1305 => Cipher::XChaCha20Poly1305(XChaCha20Poly1305::new_from_slice(&key)?),
        };
        Ok(Self {
            cipher,
            level: Compression::new(compression_level.clamp(1, 9)),
        })
    }

    /// Compress then encrypt an entire buffer in memory.
    pub fn encode(&self, plaintext: &[u8]) -> anyhow::Result<EncodedPayload> {
        let compressed = compress(plaintext, self.level)?;
        let compressed_size = compressed.len() as u64;
        let bytes = self.encrypt(&compressed)?;
        let encrypted_size = bytes.len() as u64;
        Ok(EncodedPayload { bytes, compressed_size, encrypted_size })
    }

    /// Decrypt then decompress a payload produced by `encode`.
    pub fn decode(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        let compressed = self.decrypt(payload)?;
        decompress(&compressed)
    }

    fn encrypt(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        match &self.cipher {
            Cipher::Aes256Gcm(cipher) => {
                let mut nonce_bytes = [0u8; AES_NONCE_LEN];
                rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
                let nonce = AesNonce::from_slice(&nonce_bytes);
                let ct = cipher
                    .encrypt(nonce, data)
                    .map_err(|e| anyhow::anyhow!("aes-256-gcm encrypt failed: {e}"))?;
                let mut out = Vec::with_capacity(nonce_bytes.len() + ct.len());
                out.extend_from_slice(&nonce_bytes);
                out.extend_from_slice(&ct);
                Ok(out)
            }
            Cipher::XChaCha20Poly1305(cipher) => {
                let mut nonce_bytes = [0u8; XCHACHA_NONCE_LEN];
                rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
                let nonce = XNonce::from_slice(&nonce_bytes);
                let ct = cipher
                    .encrypt(nonce, data)
                    .map_err(|e| anyhow::anyhow!("xchacha20-poly1305 encrypt failed: {e}"))?;
                let mut out = Vec::with_capacity(nonce_bytes.len() + ct.len());
                out.extend_from_slice(&nonce_bytes);
                out.extend_from_slice(&ct);
                Ok(out)
            }
        }
    }

    fn decrypt(&self, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
        match &self.cipher {
            Cipher::Aes256Gcm(cipher) => {
                if payload.len() < AES_NONCE_LEN {
                    anyhow::bail!("payload too short for aes-256-gcm nonce");
                }
                let (nonce_bytes, ct) = payload.split_at(AES_NONCE_LEN);
                let nonce = AesNonce::from_slice(nonce_bytes);
                cipher.decrypt(nonce, ct).map_err(|e| anyhow::anyhow!("aes-256-gcm decrypt failed: {e}"))
            }
            Cipher::XChaCha20Poly1305(cipher) => {
                if payload.len() < XCHACHA_NONCE_LEN {
                    anyhow::bail!("payload too short for xchacha20-poly1305 nonce");
                }
                let (nonce_bytes, ct) = payload.split_at(XCHACHA_NONCE_LEN);
                let nonce = XNonce::from_slice(nonce_bytes);
                cipher
                    .decrypt(nonce, ct)
                    .map_err(|e| anyhow::anyhow!("xchacha20-poly1305 decrypt failed: {e}"))
            }
        }
    }
}

fn compress(data: &[u8], level: Compression) -> anyhow::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), level);
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Accepts 64-hex-character strings (preferred) or raw 32-byte strings.
fn parse_key(material: &str) -> anyhow::Result<[u8; 32]> {
    if material.len() == 64 && material.chars().all(|c| c.is_ascii_hexdigit()) {
        let bytes = hex::decode(material)?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    } else if material.as_bytes().len() == 32 {
        let mut key = [0u8; 32];
        key.copy_from_slice(material.as_bytes());
        Ok(key)
    } else {
        anyhow::bail!("encryption key must be 64 hex characters or 32 raw bytes, got {} bytes", material.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec(algo: EncryptionAlgo) -> Codec {
        Codec::new(&"a".repeat(64), algo, 6).unwrap()
    }

    #[test]
    fn round_trips_aes_gcm() {
        let codec = codec(EncryptionAlgo::Aes256Gcm);
        let plaintext = b"hello world, this is a test payload".to_vec();
        let encoded = codec.encode(&plaintext).unwrap();
        let decoded = codec.decode(&encoded.bytes).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn round_trips_xchacha20poly1305() {
        let codec = codec(EncryptionAlgo::XChaCha20Poly1305);
        let plaintext = vec![42u8; 4096];
        let encoded = codec.encode(&plaintext).unwrap();
        let decoded = codec.decode(&encoded.bytes).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn tampered_ciphertext_fails_to_decode() {
        let codec = codec(EncryptionAlgo::Aes256Gcm);
        let mut encoded = codec.encode(b"some secret bytes").unwrap();
        let last = encoded.bytes.len() - 1;
        encoded.bytes[last] ^= 0xff;
        assert!(codec.decode(&encoded.bytes).is_err());
    }

    #[test]
    fn two_encodes_of_same_plaintext_use_distinct_nonces() {
        let codec = codec(EncryptionAlgo::Aes256Gcm);
        let a = codec.encode(b"identical content").unwrap();
        let b = codec.encode(b"identical content").unwrap();
        assert_ne!(a.bytes, b.bytes);
    }
}
