//! Events emitted by the client for the UI layer to consume.

/// Events that the SDK emits to the consumer (TUI, GUI, bot, etc.).
#[derive(Debug, Clone)]
pub enum Event {
    /// Transport connected; attach is in flight.
    Connected,

    /// Attach accepted. `user_id` is our relay-confirmed identity.
    Attached { user_id: String },

    /// A message decrypted successfully.
    MessageReceived {
        sender_id: String,
        message_id: i64,
        plaintext: Vec<u8>,
    },

    /// A message arrived but could not be decrypted. Shown as a
    /// placeholder bound to the envelope id, never silently dropped;
    /// the UI may ask the peer to re-send.
    MessageFailed {
        sender_id: String,
        message_id: i64,
        reason: String,
    },

    /// The relay persisted an outbound message.
    MessageSent { message_id: i64 },

    /// A session with a peer was created (either role).
    SessionEstablished { peer_id: String },

    /// The relay reports our one-time prekey pool is low. The client
    /// replenishes automatically; the count is informational.
    LowPrekeys { remaining: u32 },

    /// A non-fatal problem (failed session restore, rejected send, ...).
    Warning { message: String },

    /// Connection closed. The client reconnects with backoff unless the
    /// relay replaced this device.
    Disconnected { reason: String },
}
