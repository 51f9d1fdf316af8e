//! PSK-based HMAC signing and AES-256-GCM payload encryption.
//!
//! Mirrors the teacher networking crate's shape for session crypto
//! (struct-free functions operating on raw key bytes, a dedicated error
//! per failure mode, inline test vectors) but with the primitives this
//! protocol actually specifies: HMAC-SHA256 for signing/enrollment and
//! AES-256-GCM for payload confidentiality, rather than Ed25519/ChaCha20.

use crate::error::{Error, Result};
use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Domain separator for deriving the per-device AES key from the raw PSK.
pub const ENCRYPT_KEY_CONTEXT: &[u8] = b"mesh-encrypt-v1";

/// `HMAC-SHA256(psk, canonical_bytes || nonce_utf8)`, returned as lowercase hex.
pub fn compute_hmac(canonical: &[u8], nonce: &str, psk: &[u8]) -> Result<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(psk)
        .map_err(|_| Error::InvalidKeyLength { expected: 32, actual: psk.len() })?;
    mac.update(canonical);
    mac.update(nonce.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time HMAC verification (the `hmac` crate's `verify_slice`
/// already runs in constant time for matching lengths).
pub fn verify_hmac(canonical: &[u8], nonce: &str, psk: &[u8], tag_hex: &str) -> bool {
    let Ok(tag) = hex::decode(tag_hex) else {
        return false;
    };
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(psk) else {
        return false;
    };
    mac.update(canonical);
    mac.update(nonce.as_bytes());
    mac.verify_slice(&tag).is_ok()
}

/// Derive the per-device AES-256 key from the raw PSK:
/// `HMAC-SHA256(psk, "mesh-encrypt-v1")`.
pub fn derive_encrypt_key(psk: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(psk)
        .map_err(|_| Error::InvalidKeyLength { expected: 32, actual: psk.len() })?;
    mac.update(ENCRYPT_KEY_CONTEXT);
    let out = mac.finalize().into_bytes();
    let mut key = [0u8; 32];
    key.copy_from_slice(&out);
    Ok(key)
}

/// Associated data binding ciphertext to envelope routing metadata:
/// `"{type}|{source}|{target}|{ts}"`.
pub fn build_aad(msg_type: &str, source: &str, target: &str, ts: f64) -> Vec<u8> {
    format!("{msg_type}|{source}|{target}|{ts}").into_bytes()
}

/// Encrypt with a fresh random 96-bit IV. Returns `(ciphertext_with_tag, iv)`.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<(Vec<u8>, [u8; 12])> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::EncryptFailed)?;
    let mut iv = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);
    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| Error::EncryptFailed)?;
    Ok((ciphertext, iv))
}

/// Decrypt; any key/AAD/ciphertext mismatch returns `Err`, never a partial
/// plaintext. Caller must drop the envelope on failure.
pub fn decrypt(key: &[u8; 32], ciphertext: &[u8], aad: &[u8], iv: &[u8; 12]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::DecryptFailed)?;
    let nonce = Nonce::from_slice(iv);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| Error::DecryptFailed)
}

/// `PBKDF2-HMAC-SHA256(pin, salt, 100_000 iters, 32-byte output)`, used to
/// derive the one-time-pad key that transports the PSK during enrollment.
pub fn derive_enrollment_key(pin: &str, salt: &[u8; 16]) -> [u8; 32] {
    let mut out = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(pin.as_bytes(), salt, 100_000, &mut out);
    out
}

/// XOR a 32-byte PSK with a 32-byte one-time-pad key (enrollment handoff).
pub fn xor32(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// `HMAC-SHA256(key=pin, msg=node_id)`, the proof-of-PIN a device sends
/// back to the hub during enrollment, as lowercase hex.
pub fn compute_pin_proof(pin: &str, node_id: &str) -> String {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(pin.as_bytes()).expect("HMAC accepts any key length");
    mac.update(node_id.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a device's claimed pin proof.
pub fn verify_pin_proof(pin: &str, node_id: &str, proof_hex: &str) -> bool {
    let Ok(tag) = hex::decode(proof_hex) else {
        return false;
    };
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(pin.as_bytes()) else {
        return false;
    };
    mac.update(node_id.as_bytes());
    mac.verify_slice(&tag).is_ok()
}
