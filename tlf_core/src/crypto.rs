//! Payload encryption and signatures.
//!
//! Encrypted payloads are `nonce (24 bytes) || ciphertext` under
//! XChaCha20-Poly1305. Signatures are ed25519 over the CBOR encoding of
//! the signed structure.

use crate::TlfResult;
use crate::block::KeyServerHalf;
use crate::keys::TlfCryptKey;
use anyhow::anyhow;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use minicbor::{Decode, Encode};

const NONCE_LEN: usize = 24;

/// Encrypts `plaintext` under `key`, prefixing a random nonce.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> TlfResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| anyhow!("encryption failed"))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Reverses [`encrypt`].
pub fn decrypt(key: &[u8; 32], data: &[u8]) -> TlfResult<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(anyhow!("ciphertext shorter than nonce"));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(&(*key).into());
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("decryption failed: invalid ciphertext or wrong key"))
}

/// Derives the per-block key from the folder key and the block's server half.
pub fn block_key(tlf_key: &TlfCryptKey, server_half: &KeyServerHalf) -> [u8; 32] {
    *blake3::keyed_hash(tlf_key.as_bytes(), server_half.as_bytes()).as_bytes()
}

/// A signature together with the key that made it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Encode, Decode)]
#[cbor(map)]
pub struct SignatureInfo {
    #[n(0)]
    #[cbor(with = "minicbor::bytes")]
    pub verifying_key: [u8; 32],
    #[n(1)]
    #[cbor(with = "minicbor::bytes")]
    pub signature: [u8; 64],
}

impl SignatureInfo {
    pub fn sign(key: &SigningKey, buf: &[u8]) -> Self {
        let signature = key.sign(buf);
        Self {
            verifying_key: key.verifying_key().to_bytes(),
            signature: signature.to_bytes(),
        }
    }

    pub fn verifying_key(&self) -> TlfResult<VerifyingKey> {
        Ok(VerifyingKey::from_bytes(&self.verifying_key)?)
    }

    pub fn verify(&self, buf: &[u8]) -> TlfResult<()> {
        let key = self.verifying_key()?;
        let signature = Signature::from_bytes(&self.signature);
        key.verify(buf, &signature)
            .map_err(|e| anyhow!("signature verification failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt() {
        let key = [7u8; 32];
        let sealed = encrypt(&key, b"secret").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 6 + 16);
        assert_eq!(decrypt(&key, &sealed).unwrap(), b"secret");
        assert!(decrypt(&[8u8; 32], &sealed).is_err());
    }

    #[test]
    fn signatures_bind_the_payload() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let sig = SignatureInfo::sign(&key, b"payload");
        assert!(sig.verify(b"payload").is_ok());
        assert!(sig.verify(b"tampered").is_err());
    }
}
