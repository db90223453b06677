//! Session management: one Double Ratchet session per peer, envelope
//! encode/decode, prekey material, and versioned persistence blobs.
//!
//! The manager owns every session on this device. Callers serialize
//! access (the client wraps it in a mutex); no session is ever shared
//! across concurrent operations.
//!
//! An initiator keeps attaching the X3DH initial block to outgoing
//! envelopes until the first message from the peer decrypts, so the
//! responder can reconstruct the session even if the very first
//! envelope is lost or overtaken. The responder treats repeated initial
//! blocks for an already-established session as no-ops.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::envelope::{Envelope, EnvelopeError, InitialBlock};
use crate::ratchet::{self, RatchetError};
use crate::x3dh::{self, IdentityKeyPair, OneTimePreKey, PreKeyBundle, SignedPreKey, X3dhError};

/// Version tag of serialized session blobs.
const SESSION_BLOB_VERSION: u8 = 0x01;

/// Version tag of serialized identity blobs. Distinct from the vault
/// tag (0x01) so `vault::is_locked` can tell the two apart under the
/// same storage key.
const IDENTITY_BLOB_VERSION: u8 = 0x02;

/// Signed-prekey generations kept after rotation so in-flight initial
/// envelopes naming an older id still resolve.
const SIGNED_PREKEY_GENERATIONS: usize = 3;

/// When the signed prekey must be replaced: after `max_age_ms`, or
/// after `max_sessions` responder-side establishments against it,
/// whichever comes first.
#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    pub max_age_ms: i64,
    pub max_sessions: u32,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_age_ms: 7 * 24 * 60 * 60 * 1000,
            max_sessions: 100,
        }
    }
}

/// Per-peer session state: the ratchet plus establishment bookkeeping.
#[derive(Debug, Serialize, Deserialize)]
struct PeerSession {
    ratchet: ratchet::Session,
    /// Initial block re-attached to every send until the peer answers.
    pending_initial: Option<InitialBlock>,
    /// The ephemeral key this session was established from (responder
    /// side), used to recognize repeated initial blocks.
    origin_ephemeral: Option<[u8; 32]>,
    initiated_by_us: bool,
}

/// Owns the identity, the prekey store, and the `peer id → session`
/// map for this device.
#[derive(Debug)]
pub struct SessionManager {
    identity: IdentityKeyPair,
    signed_prekeys: Vec<SignedPreKey>,
    one_time_prekeys: HashMap<u32, OneTimePreKey>,
    next_signed_prekey_id: u32,
    next_one_time_prekey_id: u32,
    sessions: HashMap<String, PeerSession>,
    /// When the current signed prekey generation was minted (unix ms).
    /// Zero until the first rotation check stamps it.
    rotated_at_ms: i64,
    /// Responder-side establishments since the last rotation.
    sessions_since_rotation: u32,
}

impl SessionManager {
    /// Fresh identity with an initial signed prekey.
    pub fn generate() -> Self {
        let identity = IdentityKeyPair::generate();
        Self::with_identity(identity)
    }

    pub fn with_identity(identity: IdentityKeyPair) -> Self {
        let first_spk = SignedPreKey::generate(1, &identity);
        Self {
            identity,
            signed_prekeys: vec![first_spk],
            one_time_prekeys: HashMap::new(),
            next_signed_prekey_id: 2,
            next_one_time_prekey_id: 1,
            sessions: HashMap::new(),
            rotated_at_ms: 0,
            sessions_since_rotation: 0,
        }
    }

    /// Our public identity (Ed25519, 32 bytes).
    pub fn public_identity(&self) -> [u8; 32] {
        self.identity.public()
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// The public bundle to publish to the prekey directory. One-time
    /// prekeys are uploaded separately in batches.
    pub fn generate_prekey_bundle(&self) -> PreKeyBundle {
        let spk = &self.signed_prekeys[0];
        PreKeyBundle {
            identity_key: self.identity.public().to_vec(),
            signed_prekey: spk.public.as_bytes().to_vec(),
            signed_prekey_signature: spk.signature.to_vec(),
            signed_prekey_id: spk.id,
            one_time_prekey: None,
            one_time_prekey_id: None,
        }
    }

    /// Generate `n` one-time prekeys, retaining the private halves.
    /// Returns `(id, public)` pairs for upload.
    pub fn generate_one_time_prekeys(&mut self, n: u32) -> Vec<(u32, [u8; 32])> {
        (0..n)
            .map(|_| {
                let id = self.next_one_time_prekey_id;
                self.next_one_time_prekey_id += 1;
                let otp = OneTimePreKey::generate(id);
                let public = otp.public.to_bytes();
                self.one_time_prekeys.insert(id, otp);
                (id, public)
            })
            .collect()
    }

    /// Rotate the signed prekey. Older generations stay resolvable
    /// until they age out of the grace window.
    pub fn rotate_signed_prekey(&mut self) -> PreKeyBundle {
        let id = self.next_signed_prekey_id;
        self.next_signed_prekey_id += 1;
        self.signed_prekeys.insert(0, SignedPreKey::generate(id, &self.identity));
        self.signed_prekeys.truncate(SIGNED_PREKEY_GENERATIONS);
        self.sessions_since_rotation = 0;
        self.generate_prekey_bundle()
    }

    /// Rotate if the policy says the current generation is worn out.
    /// The very first call only stamps the age baseline. Returns the
    /// fresh bundle to re-publish when a rotation happened.
    pub fn maybe_rotate_signed_prekey(
        &mut self,
        now_ms: i64,
        policy: &RotationPolicy,
    ) -> Option<PreKeyBundle> {
        if self.rotated_at_ms == 0 {
            self.rotated_at_ms = now_ms;
            return None;
        }
        let aged = now_ms.saturating_sub(self.rotated_at_ms) >= policy.max_age_ms;
        let worn = self.sessions_since_rotation >= policy.max_sessions;
        if !aged && !worn {
            return None;
        }
        self.rotated_at_ms = now_ms;
        Some(self.rotate_signed_prekey())
    }

    /// Initiate a session from a fetched bundle and encrypt the first
    /// message. Returns the initial envelope to send. Replaces any
    /// existing session with the peer.
    pub fn init_session(
        &mut self,
        peer_id: &str,
        bundle: &PreKeyBundle,
        first_plaintext: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let result = x3dh::initiate(&self.identity, bundle)?;
        let peer_identity: [u8; 32] = bundle
            .identity_key
            .as_slice()
            .try_into()
            .map_err(|_| SessionError::X3dh(X3dhError::InvalidBundle))?;

        let mut session = ratchet::Session::init_initiator(
            result.shared_secret,
            result.their_ratchet_key,
            peer_identity,
        );
        let initial = InitialBlock {
            identity_pub: self.identity.public(),
            ephemeral_pub: result.ephemeral_public,
            signed_prekey_id: result.signed_prekey_id,
            one_time_prekey_id: result.one_time_prekey_id,
        };

        let (header, ciphertext) = session.encrypt(first_plaintext)?;
        let envelope = Envelope { initial: Some(initial), header, ciphertext };

        self.sessions.insert(
            peer_id.to_string(),
            PeerSession {
                ratchet: session,
                pending_initial: Some(initial),
                origin_ephemeral: None,
                initiated_by_us: true,
            },
        );
        Ok(envelope.encode())
    }

    /// Encrypt a message for an established session.
    pub fn encrypt(&mut self, peer_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let session = self.sessions.get_mut(peer_id).ok_or(SessionError::NoSession)?;
        let (header, ciphertext) = session.ratchet.encrypt(plaintext)?;
        let envelope = Envelope { initial: session.pending_initial, header, ciphertext };
        Ok(envelope.encode())
    }

    /// Establish the responder side of a session from an initial
    /// envelope, without decrypting its payload. The same bytes can
    /// then be passed to [`decrypt`](Self::decrypt).
    pub fn receive_session(&mut self, peer_id: &str, envelope_bytes: &[u8]) -> Result<(), SessionError> {
        let envelope = Envelope::decode(envelope_bytes)?;
        let initial = envelope.initial.ok_or(SessionError::NotAnInitialEnvelope)?;
        self.establish_from_initial(peer_id, &initial)
    }

    /// Decrypt an envelope from a peer, creating the session first if
    /// the envelope carries an initial block.
    pub fn decrypt(&mut self, peer_id: &str, envelope_bytes: &[u8]) -> Result<Vec<u8>, SessionError> {
        let envelope = Envelope::decode(envelope_bytes)?;
        if let Some(initial) = &envelope.initial {
            self.establish_from_initial(peer_id, initial)?;
        }

        let session = self.sessions.get_mut(peer_id).ok_or(SessionError::NoSession)?;
        match session.ratchet.decrypt(&envelope.header, &envelope.ciphertext) {
            Ok(plaintext) => {
                // The peer demonstrably holds the session now.
                session.pending_initial = None;
                Ok(plaintext)
            }
            Err(RatchetError::TooManySkipped) => {
                // Unrecoverable gap: drop the session so the caller can
                // force a re-initiation.
                self.sessions.remove(peer_id);
                Err(RatchetError::TooManySkipped.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn establish_from_initial(
        &mut self,
        peer_id: &str,
        initial: &InitialBlock,
    ) -> Result<(), SessionError> {
        if let Some(existing) = self.sessions.get(peer_id) {
            if existing.origin_ephemeral == Some(initial.ephemeral_pub) {
                // A repeat of the initial block we already processed.
                return Ok(());
            }
            if existing.initiated_by_us {
                // Simultaneous initiation. The byte-wise higher identity
                // key keeps the initiator role; the lower side discards
                // its session and adopts the responder view.
                if self.identity.public() > initial.identity_pub {
                    return Err(SessionError::SimultaneousInitiation);
                }
            }
            // Either we lost the tie-break or the peer reset the
            // session; fall through and re-establish as responder.
        }

        let spk = self
            .signed_prekeys
            .iter()
            .find(|spk| spk.id == initial.signed_prekey_id)
            .cloned()
            .ok_or(SessionError::UnknownSignedPrekey(initial.signed_prekey_id))?;

        // Consume the one-time prekey; it must never key two sessions.
        let otp = match initial.one_time_prekey_id {
            Some(id) => Some(
                self.one_time_prekeys
                    .remove(&id)
                    .ok_or(SessionError::OneTimePrekeyConsumed(id))?,
            ),
            None => None,
        };

        let shared_secret = x3dh::respond(
            &self.identity,
            &spk.secret,
            otp.as_ref().map(|o| &o.secret),
            &initial.identity_pub,
            &initial.ephemeral_pub,
        )?;

        let ratchet =
            ratchet::Session::init_responder(shared_secret, spk.secret.clone(), initial.identity_pub);
        self.sessions.insert(
            peer_id.to_string(),
            PeerSession {
                ratchet,
                pending_initial: None,
                origin_ephemeral: Some(initial.ephemeral_pub),
                initiated_by_us: false,
            },
        );
        self.sessions_since_rotation = self.sessions_since_rotation.saturating_add(1);
        Ok(())
    }

    /// Drop a session outright (logout or explicit reset).
    pub fn reset_session(&mut self, peer_id: &str) -> bool {
        self.sessions.remove(peer_id).is_some()
    }

    // ── Persistence ────────────────────────────────────────────────

    /// Serialize one session: version tag, then the full ratchet state,
    /// skipped cache, and establishment bookkeeping.
    pub fn export_session(&self, peer_id: &str) -> Result<Vec<u8>, SessionError> {
        let session = self.sessions.get(peer_id).ok_or(SessionError::NoSession)?;
        let mut out = vec![SESSION_BLOB_VERSION];
        serde_json::to_writer(&mut out, session).map_err(|_| SessionError::MalformedBlob)?;
        Ok(out)
    }

    pub fn import_session(&mut self, peer_id: &str, blob: &[u8]) -> Result<(), SessionError> {
        let (version, body) = blob.split_first().ok_or(SessionError::MalformedBlob)?;
        if *version != SESSION_BLOB_VERSION {
            return Err(SessionError::UnsupportedBlobVersion(*version));
        }
        let session: PeerSession =
            serde_json::from_slice(body).map_err(|_| SessionError::MalformedBlob)?;
        self.sessions.insert(peer_id.to_string(), session);
        Ok(())
    }

    /// Serialize the private identity and prekey store (not sessions).
    /// Wrap with the vault before letting it touch disk unprotected.
    pub fn export_identity(&self) -> Vec<u8> {
        let blob = IdentityBlob {
            identity_seed: self.identity.to_bytes(),
            signed_prekeys: self
                .signed_prekeys
                .iter()
                .map(|spk| SignedPreKeyBlob {
                    id: spk.id,
                    secret: spk.secret.to_bytes(),
                    signature: spk.signature.to_vec(),
                })
                .collect(),
            one_time_prekeys: self
                .one_time_prekeys
                .values()
                .map(|otp| OneTimePreKeyBlob { id: otp.id, secret: otp.secret.to_bytes() })
                .collect(),
            next_signed_prekey_id: self.next_signed_prekey_id,
            next_one_time_prekey_id: self.next_one_time_prekey_id,
            rotated_at_ms: self.rotated_at_ms,
            sessions_since_rotation: self.sessions_since_rotation,
        };
        let mut out = vec![IDENTITY_BLOB_VERSION];
        serde_json::to_writer(&mut out, &blob).expect("identity blob serializes");
        out
    }

    /// Restore a manager from an identity blob. Sessions are restored
    /// separately via [`import_session`](Self::import_session).
    pub fn from_bytes(blob_bytes: &[u8]) -> Result<Self, SessionError> {
        let (version, body) = blob_bytes.split_first().ok_or(SessionError::MalformedBlob)?;
        if *version != IDENTITY_BLOB_VERSION {
            return Err(SessionError::UnsupportedBlobVersion(*version));
        }
        let mut blob: IdentityBlob =
            serde_json::from_slice(body).map_err(|_| SessionError::MalformedBlob)?;

        let identity = IdentityKeyPair::from_bytes(blob.identity_seed);
        let signed_prekeys = blob
            .signed_prekeys
            .iter()
            .map(|spk| {
                let signature: [u8; 64] = spk
                    .signature
                    .as_slice()
                    .try_into()
                    .map_err(|_| SessionError::MalformedBlob)?;
                Ok(SignedPreKey::from_parts(spk.id, spk.secret, signature))
            })
            .collect::<Result<Vec<_>, SessionError>>()?;
        if signed_prekeys.is_empty() {
            return Err(SessionError::MalformedBlob);
        }
        let one_time_prekeys = blob
            .one_time_prekeys
            .iter()
            .map(|otp| (otp.id, OneTimePreKey::from_parts(otp.id, otp.secret)))
            .collect();

        let manager = Self {
            identity,
            signed_prekeys,
            one_time_prekeys,
            next_signed_prekey_id: blob.next_signed_prekey_id,
            next_one_time_prekey_id: blob.next_one_time_prekey_id,
            sessions: HashMap::new(),
            rotated_at_ms: blob.rotated_at_ms,
            sessions_since_rotation: blob.sessions_since_rotation,
        };
        blob.zeroize_secrets();
        Ok(manager)
    }

    /// Count of unconsumed one-time prekey private halves held locally.
    pub fn one_time_prekeys_held(&self) -> usize {
        self.one_time_prekeys.len()
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityBlob {
    identity_seed: [u8; 32],
    signed_prekeys: Vec<SignedPreKeyBlob>,
    one_time_prekeys: Vec<OneTimePreKeyBlob>,
    next_signed_prekey_id: u32,
    next_one_time_prekey_id: u32,
    #[serde(default)]
    rotated_at_ms: i64,
    #[serde(default)]
    sessions_since_rotation: u32,
}

impl IdentityBlob {
    fn zeroize_secrets(&mut self) {
        self.identity_seed.zeroize();
        for spk in &mut self.signed_prekeys {
            spk.secret.zeroize();
        }
        for otp in &mut self.one_time_prekeys {
            otp.secret.zeroize();
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SignedPreKeyBlob {
    id: u32,
    secret: [u8; 32],
    signature: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct OneTimePreKeyBlob {
    id: u32,
    secret: [u8; 32],
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no session with this peer")]
    NoSession,
    #[error("unknown signed prekey id {0}")]
    UnknownSignedPrekey(u32),
    #[error("one-time prekey {0} already consumed")]
    OneTimePrekeyConsumed(u32),
    #[error("envelope carries no initial block")]
    NotAnInitialEnvelope,
    #[error("simultaneous initiation resolved in our favor; peer must adopt responder role")]
    SimultaneousInitiation,
    #[error("unsupported blob version {0:#04x}")]
    UnsupportedBlobVersion(u8),
    #[error("malformed persistence blob")]
    MalformedBlob,
    #[error(transparent)]
    X3dh(#[from] X3dhError),
    #[error(transparent)]
    Ratchet(#[from] RatchetError),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A pair of managers with Bob's prekeys ready to hand to Alice.
    fn alice_and_bob() -> (SessionManager, SessionManager, PreKeyBundle) {
        let alice = SessionManager::generate();
        let mut bob = SessionManager::generate();
        let otps = bob.generate_one_time_prekeys(1);

        let mut bundle = bob.generate_prekey_bundle();
        bundle.one_time_prekey = Some(otps[0].1.to_vec());
        bundle.one_time_prekey_id = Some(otps[0].0);
        (alice, bob, bundle)
    }

    #[test]
    fn first_contact_roundtrip() {
        let (mut alice, mut bob, bundle) = alice_and_bob();

        let envelope = alice.init_session("bob", &bundle, b"hello").unwrap();
        assert!(alice.has_session("bob"));

        // The wire bytes name the consumed prekeys.
        let decoded = Envelope::decode(&envelope).unwrap();
        let initial = decoded.initial.unwrap();
        assert_eq!(initial.signed_prekey_id, 1);
        assert_eq!(initial.one_time_prekey_id, Some(1));

        assert_eq!(bob.decrypt("alice", &envelope).unwrap(), b"hello");
        assert!(bob.has_session("alice"));
        // The one-time prekey's private half is gone.
        assert_eq!(bob.one_time_prekeys_held(), 0);

        // Conversation continues both ways.
        let reply = bob.encrypt("alice", b"hi yourself").unwrap();
        assert_eq!(alice.decrypt("bob", &reply).unwrap(), b"hi yourself");
        let more = alice.encrypt("bob", b"ok").unwrap();
        assert_eq!(bob.decrypt("alice", &more).unwrap(), b"ok");
    }

    #[test]
    fn receive_session_then_decrypt() {
        let (mut alice, mut bob, bundle) = alice_and_bob();
        let envelope = alice.init_session("bob", &bundle, b"hello").unwrap();

        bob.receive_session("alice", &envelope).unwrap();
        assert!(bob.has_session("alice"));
        // The same bytes decrypt normally afterwards.
        assert_eq!(bob.decrypt("alice", &envelope).unwrap(), b"hello");
    }

    #[test]
    fn initial_block_repeats_until_reply() {
        let (mut alice, mut bob, bundle) = alice_and_bob();

        let m1 = alice.init_session("bob", &bundle, b"one").unwrap();
        let m2 = alice.encrypt("bob", b"two").unwrap();
        let m3 = alice.encrypt("bob", b"three").unwrap();

        // Every pre-reply message carries the same initial block.
        for bytes in [&m1, &m2, &m3] {
            assert!(Envelope::decode(bytes).unwrap().initial.is_some());
        }

        // Out-of-order first delivery still establishes the session.
        assert_eq!(bob.decrypt("alice", &m2).unwrap(), b"two");
        assert_eq!(bob.decrypt("alice", &m1).unwrap(), b"one");
        assert_eq!(bob.decrypt("alice", &m3).unwrap(), b"three");

        // Once Bob replies and Alice decrypts it, the block is dropped.
        let reply = bob.encrypt("alice", b"ack").unwrap();
        alice.decrypt("bob", &reply).unwrap();
        let m4 = alice.encrypt("bob", b"four").unwrap();
        assert!(Envelope::decode(&m4).unwrap().initial.is_none());
        assert_eq!(bob.decrypt("alice", &m4).unwrap(), b"four");
    }

    #[test]
    fn one_time_prekey_consumed_once() {
        let (mut alice, mut bob, bundle) = alice_and_bob();

        let envelope = alice.init_session("bob", &bundle, b"hello").unwrap();
        bob.decrypt("alice", &envelope).unwrap();

        // A second initiator handed the same (stale) bundle is refused.
        let mut carol = SessionManager::generate();
        let stale = carol.init_session("bob", &bundle, b"hi bob").unwrap();
        assert_eq!(
            bob.decrypt("carol", &stale).unwrap_err(),
            SessionError::OneTimePrekeyConsumed(1)
        );
    }

    #[test]
    fn unknown_signed_prekey_rejected() {
        let (mut alice, mut bob, mut bundle) = alice_and_bob();
        // The signature covers only the key bytes, so a bundle naming a
        // prekey id Bob never generated still initiates; the failure
        // surfaces on Bob's lookup.
        bundle.signed_prekey_id = 99;
        let envelope = alice.init_session("bob", &bundle, b"hello").unwrap();
        assert_eq!(
            bob.decrypt("alice", &envelope).unwrap_err(),
            SessionError::UnknownSignedPrekey(99)
        );
    }

    #[test]
    fn encrypt_without_session_fails() {
        let mut manager = SessionManager::generate();
        assert_eq!(manager.encrypt("nobody", b"x").unwrap_err(), SessionError::NoSession);
        assert_eq!(
            manager.decrypt("nobody", &[0x01, 0x00]).unwrap_err(),
            SessionError::Envelope(EnvelopeError::Truncated)
        );
    }

    #[test]
    fn decrypt_regular_envelope_without_session_fails() {
        let (mut alice, mut bob, bundle) = alice_and_bob();
        let first = alice.init_session("bob", &bundle, b"hello").unwrap();
        bob.decrypt("alice", &first).unwrap();
        let reply = bob.encrypt("alice", b"yo").unwrap();

        // A third party with no session gets NoSession, not a crash.
        let mut carol = SessionManager::generate();
        assert_eq!(carol.decrypt("bob", &reply).unwrap_err(), SessionError::NoSession);
    }

    #[test]
    fn session_export_import_continues_conversation() {
        let (mut alice, mut bob, bundle) = alice_and_bob();
        let first = alice.init_session("bob", &bundle, b"hello").unwrap();
        bob.decrypt("alice", &first).unwrap();

        // Bob restarts: identity and session both round-trip.
        let identity_blob = bob.export_identity();
        let session_blob = bob.export_session("alice").unwrap();
        let mut bob2 = SessionManager::from_bytes(&identity_blob).unwrap();
        bob2.import_session("alice", &session_blob).unwrap();

        let reply = bob2.encrypt("alice", b"back from the dead").unwrap();
        assert_eq!(alice.decrypt("bob", &reply).unwrap(), b"back from the dead");

        let more = alice.encrypt("bob", b"welcome").unwrap();
        assert_eq!(bob2.decrypt("alice", &more).unwrap(), b"welcome");
    }

    #[test]
    fn blob_version_checks() {
        let (_, bob, _) = alice_and_bob();
        let mut identity_blob = bob.export_identity();
        identity_blob[0] = 0x7F;
        assert_eq!(
            SessionManager::from_bytes(&identity_blob).unwrap_err(),
            SessionError::UnsupportedBlobVersion(0x7F)
        );

        let mut manager = SessionManager::generate();
        assert_eq!(
            manager.import_session("x", &[0x7F, b'{']).unwrap_err(),
            SessionError::UnsupportedBlobVersion(0x7F)
        );
        assert_eq!(
            manager.import_session("x", &[]).unwrap_err(),
            SessionError::MalformedBlob
        );
    }

    #[test]
    fn rotation_keeps_grace_generations() {
        let (mut alice, mut bob, bundle) = alice_and_bob();

        // Alice initiates against Bob's generation-1 prekey...
        let envelope = alice.init_session("bob", &bundle, b"hello").unwrap();

        // ...while Bob rotates before the envelope arrives.
        let rotated = bob.rotate_signed_prekey();
        assert_eq!(rotated.signed_prekey_id, 2);

        // The old generation still resolves.
        assert_eq!(bob.decrypt("alice", &envelope).unwrap(), b"hello");

        // After enough rotations the old id ages out.
        let mut late_bob = SessionManager::generate();
        let late_otps = late_bob.generate_one_time_prekeys(1);
        let mut late_bundle = late_bob.generate_prekey_bundle();
        late_bundle.one_time_prekey = Some(late_otps[0].1.to_vec());
        late_bundle.one_time_prekey_id = Some(late_otps[0].0);

        let mut dana = SessionManager::generate();
        let stale = dana.init_session("late-bob", &late_bundle, b"hi").unwrap();
        for _ in 0..SIGNED_PREKEY_GENERATIONS {
            late_bob.rotate_signed_prekey();
        }
        assert_eq!(
            late_bob.decrypt("dana", &stale).unwrap_err(),
            SessionError::UnknownSignedPrekey(1)
        );
    }

    #[test]
    fn simultaneous_initiation_tie_break() {
        let mut a = SessionManager::generate();
        let mut b = SessionManager::generate();

        let bundle_a = a.generate_prekey_bundle();
        let bundle_b = b.generate_prekey_bundle();

        // Both initiate toward each other before either hears back.
        // Each side keys the session under its own name for the peer.
        let from_a = a.init_session("peer", &bundle_b, b"from a").unwrap();
        let from_b = b.init_session("peer", &bundle_a, b"from b").unwrap();

        let a_wins = a.public_identity() > b.public_identity();
        let (winner, loser, winner_envelope, loser_envelope, winner_body) = if a_wins {
            (&mut a, &mut b, from_a, from_b, b"from a".to_vec())
        } else {
            (&mut b, &mut a, from_b, from_a, b"from b".to_vec())
        };

        // The higher identity keeps its initiator session and drops the
        // peer's competing initial envelope.
        assert_eq!(
            winner.decrypt("peer", &loser_envelope).unwrap_err(),
            SessionError::SimultaneousInitiation
        );

        // The lower identity adopts the responder view and decrypts.
        assert_eq!(loser.decrypt("peer", &winner_envelope).unwrap(), winner_body);

        // From here the pair converges: the loser replies on the
        // winner's session and both settle onto one ratchet.
        let reply = loser.encrypt("peer", b"converged").unwrap();
        assert_eq!(winner.decrypt("peer", &reply).unwrap(), b"converged");
    }

    #[test]
    fn too_many_skipped_closes_session() {
        let (mut alice, mut bob, bundle) = alice_and_bob();
        let first = alice.init_session("bob", &bundle, b"hello").unwrap();
        bob.decrypt("alice", &first).unwrap();

        for _ in 0..(ratchet::MAX_SKIP + 1) {
            let _ = alice.encrypt("bob", b"dropped on the floor").unwrap();
        }
        let far = alice.encrypt("bob", b"too far ahead").unwrap();

        assert_eq!(
            bob.decrypt("alice", &far).unwrap_err(),
            SessionError::Ratchet(RatchetError::TooManySkipped)
        );
        // The session is gone; a fresh X3DH is required.
        assert!(!bob.has_session("alice"));
    }

    #[test]
    fn rotation_policy_by_age_and_by_wear() {
        let policy = RotationPolicy { max_age_ms: 1000, max_sessions: 2 };
        let mut manager = SessionManager::generate();

        // First check only stamps the baseline.
        assert!(manager.maybe_rotate_signed_prekey(10_000, &policy).is_none());
        assert!(manager.maybe_rotate_signed_prekey(10_500, &policy).is_none());

        // Age alone forces a new generation.
        let rotated = manager.maybe_rotate_signed_prekey(11_000, &policy).unwrap();
        assert_eq!(rotated.signed_prekey_id, 2);
        assert!(manager.maybe_rotate_signed_prekey(11_100, &policy).is_none());

        // Wear alone does too: two responder establishments against the
        // current generation.
        for peer in ["p1", "p2"] {
            let mut initiator = SessionManager::generate();
            let envelope = initiator
                .init_session(peer, &manager.generate_prekey_bundle(), b"hi")
                .unwrap();
            manager.decrypt(peer, &envelope).unwrap();
        }
        let rotated = manager.maybe_rotate_signed_prekey(11_200, &policy).unwrap();
        assert_eq!(rotated.signed_prekey_id, 3);

        // The counters survive an identity export.
        let restored = SessionManager::from_bytes(&manager.export_identity()).unwrap();
        assert_eq!(restored.rotated_at_ms, 11_200);
        assert_eq!(restored.sessions_since_rotation, 0);
    }

    #[test]
    fn reset_session_drops_state() {
        let (mut alice, mut bob, bundle) = alice_and_bob();
        let first = alice.init_session("bob", &bundle, b"hello").unwrap();
        bob.decrypt("alice", &first).unwrap();

        assert!(bob.reset_session("alice"));
        assert!(!bob.has_session("alice"));
        assert!(!bob.reset_session("alice"));
        assert_eq!(bob.encrypt("alice", b"x").unwrap_err(), SessionError::NoSession);
    }
}
