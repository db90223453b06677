//! At-rest protection of the identity blob under a password-derived
//! key.
//!
//! ```text
//! locked = version(1) = 0x01 || salt(32) || iv(12) || ciphertext
//! ```
//!
//! The key is PBKDF2-HMAC-SHA256 over the password; the blob is sealed
//! with AES-256-GCM under a fixed AAD so a vault blob can never be
//! confused with some other ciphertext. The iteration count is a policy
//! knob carried by the version tag: a future version may raise it.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::crypto;

/// Version tag of locked vault blobs.
pub const VAULT_VERSION: u8 = 0x01;

/// PBKDF2 iteration count for version 0x01. Must never drop below this.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

const VAULT_AAD: &[u8] = b"chai/vault/v1";

const SALT_LEN: usize = 32;
const IV_LEN: usize = 12;

/// Encrypt `identity` under `password`.
pub fn lock(identity: &[u8], password: &str) -> Vec<u8> {
    let salt = crypto::rand_array::<SALT_LEN>();
    let iv = crypto::rand_array::<IV_LEN>();
    let mut key = derive_key(password, &salt);

    let ciphertext = crypto::aead_seal(&key, &iv, VAULT_AAD, identity)
        .expect("vault seal cannot fail with fixed-size key and nonce");
    key.zeroize();

    let mut out = Vec::with_capacity(1 + SALT_LEN + IV_LEN + ciphertext.len());
    out.push(VAULT_VERSION);
    out.extend_from_slice(&salt);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypt a locked blob. A wrong password and a corrupted blob are
/// indistinguishable on purpose.
pub fn unlock(locked: &[u8], password: &str) -> Result<Vec<u8>, VaultError> {
    if locked.len() < 1 + SALT_LEN + IV_LEN || locked[0] != VAULT_VERSION {
        return Err(VaultError::UnlockFailed);
    }
    let salt: [u8; SALT_LEN] = locked[1..1 + SALT_LEN].try_into().unwrap();
    let iv: [u8; IV_LEN] = locked[1 + SALT_LEN..1 + SALT_LEN + IV_LEN].try_into().unwrap();
    let ciphertext = &locked[1 + SALT_LEN + IV_LEN..];

    let mut key = derive_key(password, &salt);
    let result = crypto::aead_open(&key, &iv, VAULT_AAD, ciphertext);
    key.zeroize();
    result.map_err(|_| VaultError::UnlockFailed)
}

/// Whether a stored blob is a locked vault blob (versus a raw identity
/// blob, which carries a different version tag).
pub fn is_locked(blob: &[u8]) -> bool {
    blob.first() == Some(&VAULT_VERSION)
}

fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> [u8; 32] {
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum VaultError {
    #[error("vault unlock failed")]
    UnlockFailed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let identity = b"identity key material".to_vec();
        let locked = lock(&identity, "hunter2");
        assert!(is_locked(&locked));
        assert_eq!(unlock(&locked, "hunter2").unwrap(), identity);
    }

    #[test]
    fn wrong_password_fails() {
        let locked = lock(b"secret", "correct horse");
        assert_eq!(unlock(&locked, "battery staple").unwrap_err(), VaultError::UnlockFailed);
    }

    #[test]
    fn blob_layout() {
        let locked = lock(b"x", "pw");
        assert_eq!(locked[0], VAULT_VERSION);
        // version + salt + iv + 1 byte plaintext + 16 byte tag
        assert_eq!(locked.len(), 1 + 32 + 12 + 1 + 16);
    }

    #[test]
    fn tampered_blob_fails() {
        let mut locked = lock(b"secret", "pw");
        let last = locked.len() - 1;
        locked[last] ^= 1;
        assert_eq!(unlock(&locked, "pw").unwrap_err(), VaultError::UnlockFailed);
    }

    #[test]
    fn truncated_blob_fails() {
        let locked = lock(b"secret", "pw");
        assert_eq!(unlock(&locked[..10], "pw").unwrap_err(), VaultError::UnlockFailed);
        assert_eq!(unlock(&[], "pw").unwrap_err(), VaultError::UnlockFailed);
    }

    #[test]
    fn salts_differ_between_locks() {
        let a = lock(b"same", "pw");
        let b = lock(b"same", "pw");
        // Fresh salt and IV each time: ciphertexts never repeat.
        assert_ne!(a, b);
        assert_eq!(unlock(&a, "pw").unwrap(), unlock(&b, "pw").unwrap());
    }

    #[test]
    fn raw_identity_blob_is_not_locked() {
        let manager = crate::session::SessionManager::generate();
        assert!(!is_locked(&manager.export_identity()));
    }
}
