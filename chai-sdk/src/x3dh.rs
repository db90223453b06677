//! Extended Triple Diffie-Hellman (X3DH) key agreement.
//!
//! Establishes the shared secret that seeds a Double Ratchet session.
//! One party (the responder) publishes a prekey bundle; the other (the
//! initiator) uses it to derive the secret and send a first message
//! without the responder being online.
//!
//! # Key types
//!
//! - **Identity key (IK)**: long-term Ed25519 pair, converted to X25519
//!   for the DH computations. Lives for the lifetime of the account on
//!   this device.
//! - **Signed prekey (SPK)**: medium-term X25519 pair, signed by the
//!   identity key. Rotated periodically; old generations stay
//!   resolvable for in-flight sessions.
//! - **One-time prekey (OPK)**: X25519 pair consumed exactly once. Its
//!   job is to keep the initial secret unique even if the ephemeral
//!   key leaks.
//! - **Ephemeral key (EK)**: single-use X25519 pair generated per
//!   initiation.
//!
//! # Protocol
//!
//! The initiator fetches the responder's bundle and computes:
//!
//! ```text
//! DH1 = DH(IK_A, SPK_B)
//! DH2 = DH(EK_A, IK_B)
//! DH3 = DH(EK_A, SPK_B)
//! DH4 = DH(EK_A, OPK_B)        (when a one-time prekey was available)
//! SK  = HKDF(salt = 0^32, 0xFF^32 || DH1 || DH2 || DH3 [|| DH4])
//! ```
//!
//! The responder recomputes the same products from its private halves
//! when the initial envelope arrives.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto;

const X3DH_INFO: &[u8] = b"chai/x3dh/v1";

/// Domain-separation prefix mixed into the HKDF input keying material.
const X3DH_PREFIX: [u8; 32] = [0xFF; 32];

/// A user's long-term identity: an Ed25519 signing pair whose scalar is
/// reused for X25519 via the Edwards→Montgomery map.
#[derive(Debug, Clone)]
pub struct IdentityKeyPair {
    signing: SigningKey,
}

impl IdentityKeyPair {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self { signing: SigningKey::generate(&mut OsRng) }
    }

    /// Restore from a 32-byte seed.
    pub fn from_bytes(seed: [u8; 32]) -> Self {
        Self { signing: SigningKey::from_bytes(&seed) }
    }

    /// The 32-byte seed, for persistence. Never leaves the device
    /// except wrapped by the vault.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// The public identity as raw Ed25519 bytes.
    pub fn public(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The X25519 secret corresponding to the signing scalar.
    pub fn dh_secret(&self) -> StaticSecret {
        crypto::dh_secret_from_identity(&self.signing)
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        crypto::sign(&self.signing, msg)
    }
}

/// A signed prekey pair: X25519, with an Ed25519 signature over the
/// public half by the identity key.
#[derive(Clone)]
pub struct SignedPreKey {
    pub id: u32,
    pub secret: StaticSecret,
    pub public: PublicKey,
    pub signature: [u8; 64],
}

impl std::fmt::Debug for SignedPreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedPreKey")
            .field("id", &self.id)
            .field("public", &self.public)
            .field("signature", &self.signature)
            .finish_non_exhaustive() // avoids printing `secret`
    }
}

impl SignedPreKey {
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let signature = identity.sign(public.as_bytes());
        Self { id, secret, public, signature }
    }

    /// Restore from persisted parts.
    pub fn from_parts(id: u32, secret: [u8; 32], signature: [u8; 64]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Self { id, secret, public, signature }
    }
}

/// A one-time prekey pair. Consumed on first use; the private half is
/// destroyed the moment a session is established from it.
#[derive(Clone)]
pub struct OneTimePreKey {
    pub id: u32,
    pub secret: StaticSecret,
    pub public: PublicKey,
}

impl std::fmt::Debug for OneTimePreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneTimePreKey")
            .field("id", &self.id)
            .field("public", &self.public)
            .finish_non_exhaustive() // avoids printing `secret`
    }
}

impl OneTimePreKey {
    pub fn generate(id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { id, secret, public }
    }

    pub fn from_parts(id: u32, secret: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Self { id, secret, public }
    }
}

/// The public packet a server hands an initiator. Byte blobs serialize
/// as arrays of byte values on the JSON surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Ed25519 identity public key (32 bytes).
    pub identity_key: Vec<u8>,
    /// X25519 signed prekey public (32 bytes).
    pub signed_prekey: Vec<u8>,
    /// Ed25519 signature over `signed_prekey` (64 bytes).
    pub signed_prekey_signature: Vec<u8>,
    pub signed_prekey_id: u32,
    /// X25519 one-time prekey public (32 bytes), if one was available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_prekey: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_prekey_id: Option<u32>,
}

impl PreKeyBundle {
    /// Verify the bundle: shapes, non-degenerate keys, and the prekey
    /// signature under the identity key. Must pass before any DH runs.
    pub fn verify(&self) -> Result<(), X3dhError> {
        let identity = self.identity_verifying()?;
        let spk: [u8; 32] = self
            .signed_prekey
            .as_slice()
            .try_into()
            .map_err(|_| X3dhError::InvalidBundle)?;
        // An all-zero point can never come from honest key generation;
        // dev-mode marker bundles are refused here.
        if spk == [0u8; 32] {
            return Err(X3dhError::InvalidBundle);
        }
        if !crypto::verify(&identity, &spk, &self.signed_prekey_signature) {
            return Err(X3dhError::InvalidBundle);
        }
        match (&self.one_time_prekey, self.one_time_prekey_id) {
            (None, None) => Ok(()),
            (Some(opk), Some(_)) => {
                let bytes: [u8; 32] =
                    opk.as_slice().try_into().map_err(|_| X3dhError::InvalidBundle)?;
                if bytes == [0u8; 32] { Err(X3dhError::InvalidBundle) } else { Ok(()) }
            }
            _ => Err(X3dhError::InvalidBundle),
        }
    }

    pub fn identity_verifying(&self) -> Result<VerifyingKey, X3dhError> {
        let bytes: [u8; 32] = self
            .identity_key
            .as_slice()
            .try_into()
            .map_err(|_| X3dhError::InvalidBundle)?;
        if bytes == [0u8; 32] {
            return Err(X3dhError::InvalidBundle);
        }
        VerifyingKey::from_bytes(&bytes).map_err(|_| X3dhError::InvalidBundle)
    }

    pub fn signed_prekey_public(&self) -> Result<PublicKey, X3dhError> {
        let bytes: [u8; 32] = self
            .signed_prekey
            .as_slice()
            .try_into()
            .map_err(|_| X3dhError::InvalidBundle)?;
        Ok(PublicKey::from(bytes))
    }

    pub fn one_time_public(&self) -> Result<Option<PublicKey>, X3dhError> {
        match &self.one_time_prekey {
            None => Ok(None),
            Some(opk) => {
                let bytes: [u8; 32] =
                    opk.as_slice().try_into().map_err(|_| X3dhError::InvalidBundle)?;
                Ok(Some(PublicKey::from(bytes)))
            }
        }
    }
}

/// Result of X3DH on the initiator's side.
pub struct InitiatorResult {
    /// Shared secret seeding the Double Ratchet.
    pub shared_secret: [u8; 32],
    /// The ephemeral public to carry in the initial envelope.
    pub ephemeral_public: [u8; 32],
    /// The responder's signed prekey, which doubles as their initial
    /// ratchet public key.
    pub their_ratchet_key: [u8; 32],
    pub signed_prekey_id: u32,
    pub one_time_prekey_id: Option<u32>,
}

/// Initiator side: derive the shared secret from a verified bundle.
pub fn initiate(
    our_identity: &IdentityKeyPair,
    their_bundle: &PreKeyBundle,
) -> Result<InitiatorResult, X3dhError> {
    their_bundle.verify()?;

    let ik_b = crypto::dh_public_from_identity(&their_bundle.identity_verifying()?);
    let spk_b = their_bundle.signed_prekey_public()?;
    let opk_b = their_bundle.one_time_public()?;

    let ek_secret = StaticSecret::random_from_rng(OsRng);
    let ek_public = PublicKey::from(&ek_secret);

    let dh1 = crypto::dh(&our_identity.dh_secret(), &spk_b);
    let dh2 = crypto::dh(&ek_secret, &ik_b);
    let dh3 = crypto::dh(&ek_secret, &spk_b);
    let dh4 = opk_b.map(|opk| crypto::dh(&ek_secret, &opk));

    let shared_secret = derive_shared(&dh1, &dh2, &dh3, dh4.as_ref())?;

    Ok(InitiatorResult {
        shared_secret,
        ephemeral_public: ek_public.to_bytes(),
        their_ratchet_key: spk_b.to_bytes(),
        signed_prekey_id: their_bundle.signed_prekey_id,
        one_time_prekey_id: their_bundle.one_time_prekey_id,
    })
}

/// Responder side: recompute the shared secret from an initial
/// envelope's identity and ephemeral keys plus our private halves.
pub fn respond(
    our_identity: &IdentityKeyPair,
    our_signed_prekey: &StaticSecret,
    our_one_time_prekey: Option<&StaticSecret>,
    their_identity: &[u8; 32],
    their_ephemeral: &[u8; 32],
) -> Result<[u8; 32], X3dhError> {
    let ik_a_ed = VerifyingKey::from_bytes(their_identity).map_err(|_| X3dhError::InvalidBundle)?;
    let ik_a = crypto::dh_public_from_identity(&ik_a_ed);
    let ek_a = PublicKey::from(*their_ephemeral);

    let dh1 = crypto::dh(our_signed_prekey, &ik_a);
    let dh2 = crypto::dh(&our_identity.dh_secret(), &ek_a);
    let dh3 = crypto::dh(our_signed_prekey, &ek_a);
    let dh4 = our_one_time_prekey.map(|opk| crypto::dh(opk, &ek_a));

    derive_shared(&dh1, &dh2, &dh3, dh4.as_ref())
}

fn derive_shared(
    dh1: &[u8; 32],
    dh2: &[u8; 32],
    dh3: &[u8; 32],
    dh4: Option<&[u8; 32]>,
) -> Result<[u8; 32], X3dhError> {
    let mut ikm = Vec::with_capacity(160);
    ikm.extend_from_slice(&X3DH_PREFIX);
    ikm.extend_from_slice(dh1);
    ikm.extend_from_slice(dh2);
    ikm.extend_from_slice(dh3);
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4);
    }

    let mut shared = [0u8; 32];
    crypto::hkdf(Some(&[0u8; 32]), &ikm, X3DH_INFO, &mut shared)
        .map_err(|_| X3dhError::KdfFailed)?;
    Ok(shared)
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum X3dhError {
    #[error("invalid prekey bundle")]
    InvalidBundle,
    #[error("key derivation failed")]
    KdfFailed,
}
