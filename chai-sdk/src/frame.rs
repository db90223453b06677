//! The relay frame protocol: newline-delimited JSON documents of the
//! form `{"type": <string>, "payload": <object|null>}` over a
//! bidirectional byte stream (TCP, TLS, or a bridged WebSocket).
//!
//! Binary payloads (public keys, ciphertext) travel as arrays of byte
//! values. Frames above [`MAX_FRAME_BYTES`] are rejected on both ends.
//!
//! The relay never inspects ciphertext; the only content field it reads
//! is `message_type`, a small routing class (normal vs. control).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::x3dh::PreKeyBundle;

/// Hard cap on a single frame, delimiter included.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Routing class for ordinary chat envelopes.
pub const MESSAGE_TYPE_NORMAL: u8 = 0;
/// Routing class for protocol control messages.
pub const MESSAGE_TYPE_CONTROL: u8 = 1;

/// Frames the client sends to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientFrame {
    /// Connection handshake; must be the first frame on a connection.
    /// The token comes from the out-of-scope authentication component.
    Attach { token: String },
    Ping,
    SendMessage {
        recipient_id: String,
        ciphertext: Vec<u8>,
        message_type: u8,
    },
    GetPrekeyBundle { user_id: String },
    AckMessages { message_ids: Vec<i64> },
    UploadPrekeys {
        bundle: PreKeyBundle,
        #[serde(default)]
        one_time_prekeys: Vec<OneTimePrekeyUpload>,
    },
}

/// A one-time prekey public half, as uploaded to the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyUpload {
    pub prekey_id: u32,
    pub prekey: Vec<u8>,
}

/// Frames the relay sends to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerFrame {
    /// Handshake accepted; the connection now belongs to `user_id`.
    Attached { user_id: String },
    Pong,
    /// A stored envelope delivered to its recipient.
    Message {
        message_id: i64,
        sender_id: String,
        ciphertext: Vec<u8>,
        message_type: u8,
        /// Relay arrival time, unix milliseconds.
        created_at: i64,
    },
    /// The relay has persisted an outbound message (not: delivered it).
    MessageSent { message_id: i64 },
    PrekeyBundle {
        user_id: String,
        bundle: Option<PreKeyBundle>,
    },
    /// The recipient's unused one-time prekey pool is running low.
    LowPrekeys { remaining: u32 },
    Error { kind: ErrorKind, message: String },
}

/// Closed set of relay error kinds. Adding one is a protocol change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Unauthorized,
    BadSignature,
    Backpressure,
    Replaced,
    FrameTooLarge,
    BadRequest,
    Internal,
}

/// Read one frame. `Ok(None)` means a clean EOF before any bytes of a
/// new frame arrived.
pub async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    // Cap the read so an oversized frame cannot balloon memory.
    let n = reader
        .take(MAX_FRAME_BYTES as u64 + 1)
        .read_line(&mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if n > MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::FileTooLarge,
            "frame exceeds 1 MiB",
        ));
    }
    let frame = serde_json::from_str(line.trim_end())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(frame))
}

/// Write one frame, newline-delimited.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if bytes.len() >= MAX_FRAME_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::FileTooLarge,
            "frame exceeds 1 MiB",
        ));
    }
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}
