//! Double Ratchet engine: one fresh authenticated encryption key per
//! message, forward secrecy from the symmetric ratchet, post-compromise
//! security from the DH ratchet.
//!
//! Built from:
//! - X25519 for the Diffie-Hellman ratchet
//! - HKDF-SHA256 for the root chain
//! - HMAC-SHA256 for the symmetric chains
//! - AES-256-GCM for message encryption, header as AAD
//!
//! The envelope carries no nonce: it is derived from the message key
//! and the message counter, and every message key is used at most once.
//!
//! Decryption is transactional. All work happens on a scratch copy of
//! the session; state is committed only when the AEAD opens. A failed
//! decrypt therefore never advances chains, consumes skipped keys, or
//! turns the DH ratchet.

use std::collections::{HashMap, VecDeque};

use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::crypto::{self, CryptoError};

/// Maximum skipped message keys derived in one catch-up on a single
/// receiving chain. A gap larger than this closes the session.
pub const MAX_SKIP: u32 = 1000;

/// Maximum skipped keys retained per session across all chains. The
/// oldest entry is evicted silently once the cap is reached.
pub const MAX_SKIP_TOTAL: usize = 5000;

/// How many retired receiving-chain keys to remember. A message on a
/// remembered-but-retired chain whose key is gone fails as
/// `LateBeyondWindow` instead of looking like a brand-new chain.
const RETIRED_CHAIN_WINDOW: usize = 4;

const ROOT_INFO: &[u8] = b"chai/ratchet/root";
const NONCE_INFO: &[u8] = b"chai/ratchet/nonce";

// ── KDF functions ──────────────────────────────────────────────────

/// Root chain KDF: current root key + DH output → (new root, chain key).
fn kdf_root(root_key: &[u8; 32], dh_out: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut okm = [0u8; 64];
    crypto::hkdf(Some(root_key), dh_out, ROOT_INFO, &mut okm)
        .expect("64 bytes is a valid HKDF-SHA256 output length");
    let mut new_root = [0u8; 32];
    let mut chain_key = [0u8; 32];
    new_root.copy_from_slice(&okm[..32]);
    chain_key.copy_from_slice(&okm[32..]);
    okm.zeroize();
    (new_root, chain_key)
}

/// Symmetric chain KDF: advance the chain key, emit a message key.
fn kdf_chain(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    use hmac::digest::KeyInit;
    use hmac::Mac;
    type HmacSha256 = hmac::Hmac<sha2::Sha256>;

    // Next chain key = HMAC(ck, 0x02)
    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(chain_key)
        .expect("HMAC accepts 32-byte keys");
    Mac::update(&mut mac, &[0x02]);
    let next_chain: [u8; 32] = mac.finalize().into_bytes().into();

    // Message key = HMAC(ck, 0x01)
    let mut mac = <HmacSha256 as KeyInit>::new_from_slice(chain_key)
        .expect("HMAC accepts 32-byte keys");
    Mac::update(&mut mac, &[0x01]);
    let message_key: [u8; 32] = mac.finalize().into_bytes().into();

    (next_chain, message_key)
}

/// Counter-derived AEAD nonce. Each message key encrypts exactly one
/// message, so the (key, nonce) pair never repeats.
fn derive_nonce(message_key: &[u8; 32], msg_num: u32) -> [u8; 12] {
    let mut info = Vec::with_capacity(NONCE_INFO.len() + 4);
    info.extend_from_slice(NONCE_INFO);
    info.extend_from_slice(&msg_num.to_be_bytes());
    let mut nonce = [0u8; 12];
    crypto::hkdf(None, message_key, &info, &mut nonce)
        .expect("12 bytes is a valid HKDF-SHA256 output length");
    nonce
}

// ── Message header ─────────────────────────────────────────────────

/// Unencrypted but authenticated header sent with every message. It is
/// the AAD of the AEAD, so it cannot be tampered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Sender's current ratchet public key.
    pub ratchet_key: [u8; 32],
    /// Length of the sender's previous sending chain (`pn`).
    pub prev_chain_len: u32,
    /// Message number in the current sending chain (`n`).
    pub msg_num: u32,
}

impl Header {
    pub const LEN: usize = 40;

    /// Fixed 40-byte big-endian encoding.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..32].copy_from_slice(&self.ratchet_key);
        out[32..36].copy_from_slice(&self.prev_chain_len.to_be_bytes());
        out[36..40].copy_from_slice(&self.msg_num.to_be_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RatchetError> {
        if data.len() != Self::LEN {
            return Err(RatchetError::MalformedHeader);
        }
        let mut ratchet_key = [0u8; 32];
        ratchet_key.copy_from_slice(&data[..32]);
        let prev_chain_len = u32::from_be_bytes(data[32..36].try_into().unwrap());
        let msg_num = u32::from_be_bytes(data[36..40].try_into().unwrap());
        Ok(Self { ratchet_key, prev_chain_len, msg_num })
    }
}

// ── Skipped-key cache ──────────────────────────────────────────────

type SkippedSlot = ([u8; 32], u32);

/// Bounded cache of message keys for out-of-order deliveries. Insertion
/// order is tracked separately so oldest-first eviction is O(1).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<SkippedEntry>", into = "Vec<SkippedEntry>")]
struct SkippedKeys {
    map: HashMap<SkippedSlot, [u8; 32]>,
    order: VecDeque<SkippedSlot>,
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedEntry {
    chain: [u8; 32],
    n: u32,
    key: [u8; 32],
}

impl SkippedKeys {
    /// Insert a key, evicting the oldest entries past `MAX_SKIP_TOTAL`.
    /// Returns how many live keys were evicted.
    fn insert(&mut self, slot: SkippedSlot, key: [u8; 32]) -> u64 {
        let mut evicted = 0;
        while self.map.len() >= MAX_SKIP_TOTAL {
            match self.order.pop_front() {
                // Consumed slots leave stale order entries behind;
                // only count evictions that dropped a live key.
                Some(old) => {
                    if let Some(mut dropped) = self.map.remove(&old) {
                        dropped.zeroize();
                        evicted += 1;
                    }
                }
                None => break,
            }
        }
        if self.map.insert(slot, key).is_none() {
            self.order.push_back(slot);
        }
        evicted
    }

    /// Consume the key for a slot, if present.
    fn take(&mut self, slot: &SkippedSlot) -> Option<[u8; 32]> {
        self.map.remove(slot)
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

impl From<Vec<SkippedEntry>> for SkippedKeys {
    fn from(entries: Vec<SkippedEntry>) -> Self {
        let mut skipped = SkippedKeys::default();
        for e in entries {
            skipped.insert((e.chain, e.n), e.key);
        }
        skipped
    }
}

impl From<SkippedKeys> for Vec<SkippedEntry> {
    fn from(skipped: SkippedKeys) -> Self {
        skipped
            .order
            .iter()
            .filter_map(|slot| {
                skipped.map.get(slot).map(|key| SkippedEntry {
                    chain: slot.0,
                    n: slot.1,
                    key: *key,
                })
            })
            .collect()
    }
}

// ── Session state ──────────────────────────────────────────────────

/// A Double Ratchet session with one peer.
///
/// Serializable for persistence across restarts; key material is wiped
/// on drop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    dh_self_secret: [u8; 32],
    dh_self_public: [u8; 32],
    /// Peer's current ratchet public key. `None` until the first
    /// inbound message on the responder side.
    dh_remote: Option<[u8; 32]>,

    root_key: [u8; 32],

    send_chain_key: Option<[u8; 32]>,
    send_msg_num: u32,
    recv_chain_key: Option<[u8; 32]>,
    recv_msg_num: u32,
    prev_send_chain_len: u32,

    skipped: SkippedKeys,
    /// Recently superseded receiving-chain keys, oldest first.
    retired_chains: VecDeque<[u8; 32]>,

    /// Peer identity (Ed25519 public), bound at X3DH time.
    peer_identity: [u8; 32],
    /// Lifetime count of skipped keys silently evicted at the cap.
    evicted: u64,
}

impl Session {
    /// Initiator side, after X3DH. `their_ratchet_key` is the peer's
    /// signed prekey, which serves as their initial ratchet public.
    pub fn init_initiator(
        shared_secret: [u8; 32],
        their_ratchet_key: [u8; 32],
        peer_identity: [u8; 32],
    ) -> Self {
        let our_secret = StaticSecret::random_from_rng(OsRng);
        let our_public = PublicKey::from(&our_secret);

        let dh_out = crypto::dh(&our_secret, &PublicKey::from(their_ratchet_key));
        let (root_key, send_chain_key) = kdf_root(&shared_secret, &dh_out);

        Session {
            dh_self_secret: our_secret.to_bytes(),
            dh_self_public: our_public.to_bytes(),
            dh_remote: Some(their_ratchet_key),
            root_key,
            send_chain_key: Some(send_chain_key),
            send_msg_num: 0,
            recv_chain_key: None,
            recv_msg_num: 0,
            prev_send_chain_len: 0,
            skipped: SkippedKeys::default(),
            retired_chains: VecDeque::new(),
            peer_identity,
            evicted: 0,
        }
    }

    /// Responder side, after X3DH. `our_ratchet_secret` is our signed
    /// prekey secret; the first inbound message turns the DH ratchet.
    pub fn init_responder(
        shared_secret: [u8; 32],
        our_ratchet_secret: StaticSecret,
        peer_identity: [u8; 32],
    ) -> Self {
        let our_public = PublicKey::from(&our_ratchet_secret);

        Session {
            dh_self_secret: our_ratchet_secret.to_bytes(),
            dh_self_public: our_public.to_bytes(),
            dh_remote: None,
            root_key: shared_secret,
            send_chain_key: None,
            send_msg_num: 0,
            recv_chain_key: None,
            recv_msg_num: 0,
            prev_send_chain_len: 0,
            skipped: SkippedKeys::default(),
            retired_chains: VecDeque::new(),
            peer_identity,
            evicted: 0,
        }
    }

    /// Encrypt one message, advancing the sending chain.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<(Header, Vec<u8>), RatchetError> {
        let chain_key = self.send_chain_key.ok_or(RatchetError::NoSendChain)?;
        let (next_chain, message_key) = kdf_chain(&chain_key);

        let header = Header {
            ratchet_key: self.dh_self_public,
            prev_chain_len: self.prev_send_chain_len,
            msg_num: self.send_msg_num,
        };
        let nonce = derive_nonce(&message_key, header.msg_num);
        let ciphertext = crypto::aead_seal(&message_key, &nonce, &header.to_bytes(), plaintext)
            .map_err(|_| RatchetError::CryptoFailure)?;

        self.send_chain_key = Some(next_chain);
        self.send_msg_num += 1;
        Ok((header, ciphertext))
    }

    /// Decrypt one message. On any error the session is left exactly as
    /// it was before the call.
    pub fn decrypt(&mut self, header: &Header, ciphertext: &[u8]) -> Result<Vec<u8>, RatchetError> {
        let mut trial = self.clone();
        let plaintext = trial.decrypt_inner(header, ciphertext)?;
        *self = trial;
        Ok(plaintext)
    }

    fn decrypt_inner(&mut self, header: &Header, ciphertext: &[u8]) -> Result<Vec<u8>, RatchetError> {
        // Out-of-order delivery: a previously skipped slot.
        if let Some(message_key) = self.skipped.take(&(header.ratchet_key, header.msg_num)) {
            return open_with_key(&message_key, header, ciphertext);
        }

        let on_current_chain = self.dh_remote == Some(header.ratchet_key);
        if !on_current_chain {
            if self.retired_chains.contains(&header.ratchet_key) {
                // The chain is known but its window has passed.
                return Err(RatchetError::LateBeyondWindow);
            }
            // A DH ratchet turn is due: close out the current receiving
            // chain first so its remaining keys stay decryptable.
            self.skip_message_keys(header.prev_chain_len)?;
            self.dh_ratchet(&header.ratchet_key);
        } else if header.msg_num < self.recv_msg_num {
            // The key for this slot was already consumed: replay.
            return Err(RatchetError::DecryptionFailed);
        }

        self.skip_message_keys(header.msg_num)?;

        let chain_key = self.recv_chain_key.ok_or(RatchetError::NoReceiveChain)?;
        let (next_chain, message_key) = kdf_chain(&chain_key);
        self.recv_chain_key = Some(next_chain);
        self.recv_msg_num = header.msg_num + 1;

        open_with_key(&message_key, header, ciphertext)
    }

    /// Advance the receiving chain to `until`, caching the skipped keys.
    fn skip_message_keys(&mut self, until: u32) -> Result<(), RatchetError> {
        if until <= self.recv_msg_num {
            return Ok(());
        }
        let Some(mut chain_key) = self.recv_chain_key else {
            // No receiving chain yet; nothing to skip.
            return Ok(());
        };
        if until - self.recv_msg_num > MAX_SKIP {
            return Err(RatchetError::TooManySkipped);
        }
        let chain = self.dh_remote.ok_or(RatchetError::NoReceiveChain)?;
        while self.recv_msg_num < until {
            let (next_chain, message_key) = kdf_chain(&chain_key);
            self.evicted += self.skipped.insert((chain, self.recv_msg_num), message_key);
            chain_key = next_chain;
            self.recv_msg_num += 1;
        }
        self.recv_chain_key = Some(chain_key);
        Ok(())
    }

    /// One DH ratchet turn: new receiving chain from the peer's key,
    /// fresh sending keypair and chain on top of it.
    fn dh_ratchet(&mut self, their_key: &[u8; 32]) {
        if let Some(old) = self.dh_remote.replace(*their_key) {
            self.retired_chains.push_back(old);
            while self.retired_chains.len() > RETIRED_CHAIN_WINDOW {
                self.retired_chains.pop_front();
            }
        }

        let their_public = PublicKey::from(*their_key);
        let our_secret = StaticSecret::from(self.dh_self_secret);
        let (root_key, recv_chain_key) =
            kdf_root(&self.root_key, &crypto::dh(&our_secret, &their_public));
        self.root_key = root_key;
        self.recv_chain_key = Some(recv_chain_key);
        self.recv_msg_num = 0;

        self.prev_send_chain_len = self.send_msg_num;
        self.send_msg_num = 0;
        let new_secret = StaticSecret::random_from_rng(OsRng);
        self.dh_self_public = PublicKey::from(&new_secret).to_bytes();
        let (root_key, send_chain_key) =
            kdf_root(&self.root_key, &crypto::dh(&new_secret, &their_public));
        self.dh_self_secret = new_secret.to_bytes();
        self.root_key = root_key;
        self.send_chain_key = Some(send_chain_key);
    }

    /// Our current ratchet public key.
    pub fn ratchet_public(&self) -> [u8; 32] {
        self.dh_self_public
    }

    /// The peer identity this session was bound to at X3DH time.
    pub fn peer_identity(&self) -> [u8; 32] {
        self.peer_identity
    }

    /// Skipped keys currently cached.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Lifetime count of skipped keys silently dropped at the cap.
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dh_self_secret.zeroize();
        self.root_key.zeroize();
        if let Some(mut key) = self.send_chain_key.take() {
            key.zeroize();
        }
        if let Some(mut key) = self.recv_chain_key.take() {
            key.zeroize();
        }
        for key in self.skipped.map.values_mut() {
            key.zeroize();
        }
    }
}

fn open_with_key(
    message_key: &[u8; 32],
    header: &Header,
    ciphertext: &[u8],
) -> Result<Vec<u8>, RatchetError> {
    let nonce = derive_nonce(message_key, header.msg_num);
    crypto::aead_open(message_key, &nonce, &header.to_bytes(), ciphertext).map_err(|e| match e {
        CryptoError::DecryptionFailed => RatchetError::DecryptionFailed,
        _ => RatchetError::CryptoFailure,
    })
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RatchetError {
    #[error("malformed message header")]
    MalformedHeader,
    #[error("no sending chain yet")]
    NoSendChain,
    #[error("no receiving chain yet")]
    NoReceiveChain,
    #[error("too many skipped messages")]
    TooManySkipped,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("message arrived after its key window passed")]
    LateBeyondWindow,
    #[error("crypto failure")]
    CryptoFailure,
}

// ── Tests ──────────────────────────────────────────────────────────
