//! Client SDK for the chai end-to-end encrypted messenger.
//!
//! The relay in the middle is untrusted: it sees sender, recipient, and
//! opaque ciphertext, nothing else. This crate holds everything that
//! runs on the endpoint:
//!
//! - [`crypto`] — the narrow primitive surface (Ed25519, X25519,
//!   HKDF-SHA256, AES-256-GCM, OS randomness)
//! - [`x3dh`] — identity/prekey material and the initial key agreement
//! - [`ratchet`] — the Double Ratchet engine
//! - [`envelope`] — the bit-exact wire format of one encrypted message
//! - [`session`] — the per-peer session manager and persistence blobs
//! - [`vault`] — password protection of the identity blob at rest
//! - [`frame`] — the JSON frame protocol spoken with the relay
//! - [`store`] — keyed-blob client persistence
//! - [`client`] — the connection state machine with reconnect and drain
//! - [`event`] — events surfaced to the UI layer

pub mod client;
pub mod crypto;
pub mod envelope;
pub mod event;
pub mod frame;
pub mod ratchet;
pub mod session;
pub mod store;
pub mod vault;
pub mod x3dh;

pub use client::{Client, ClientConfig, ClientHandle, Command, ConnState, load_or_create_identity};
pub use event::Event;
pub use session::{RotationPolicy, SessionError, SessionManager};
pub use x3dh::{IdentityKeyPair, PreKeyBundle};
