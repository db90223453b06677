//! Cryptographic primitive surface.
//!
//! Everything above this module speaks in terms of a handful of
//! operations: Ed25519 signing, X25519 Diffie-Hellman, HKDF-SHA256,
//! AES-256-GCM, and OS randomness. The dalek and RustCrypto
//! implementations run in time independent of secret inputs.
//!
//! The Ed25519 identity key doubles as an X25519 key through the
//! Edwards→Montgomery map: the clamped signing scalar is reused as the
//! DH secret, and the verifying key converts to the matching Montgomery
//! point. Both directions of a DH agree regardless of which
//! representation each side started from.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

/// Sign a message under the Ed25519 identity key.
pub fn sign(key: &SigningKey, msg: &[u8]) -> [u8; 64] {
    key.sign(msg).to_bytes()
}

/// Verify an Ed25519 signature. Returns a bare boolean; callers never
/// learn why a signature failed.
pub fn verify(key: &VerifyingKey, msg: &[u8], sig: &[u8]) -> bool {
    let Ok(sig) = Signature::from_slice(sig) else {
        return false;
    };
    key.verify(msg, &sig).is_ok()
}

/// X25519 Diffie-Hellman.
pub fn dh(secret: &StaticSecret, public: &PublicKey) -> [u8; 32] {
    secret.diffie_hellman(public).to_bytes()
}

/// HKDF-SHA256 expand into `out`. Fails only for out-of-range output
/// lengths (> 255 * 32 bytes).
pub fn hkdf(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, out)
        .map_err(|_| CryptoError::KdfFailed)
}

/// AES-256-GCM seal. The tag is appended to the ciphertext.
pub fn aead_seal(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// AES-256-GCM open. Fails closed on any tag or AAD mismatch.
pub fn aead_open(
    key: &[u8; 32],
    nonce: &[u8; 12],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Fill `buf` from the OS CSPRNG.
pub fn rand_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}

/// Fixed-size random array from the OS CSPRNG.
pub fn rand_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Reuse an Ed25519 signing key as an X25519 secret (clamped scalar).
pub fn dh_secret_from_identity(key: &SigningKey) -> StaticSecret {
    StaticSecret::from(key.to_scalar_bytes())
}

/// Convert an Ed25519 verifying key to its X25519 counterpart.
pub fn dh_public_from_identity(key: &VerifyingKey) -> PublicKey {
    PublicKey::from(key.to_montgomery().to_bytes())
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("key derivation failed")]
    KdfFailed,
}
