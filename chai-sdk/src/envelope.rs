//! Envelope wire format: the bytes one encrypted message occupies on
//! the wire. Hand-rolled and bit-exact; all integers big-endian.
//!
//! ```text
//! envelope = version(1) || flags(1) || [initial] || header || body
//! initial  = identity_pub(32) || ephemeral_pub(32) || spk_id(u32)
//!            || otp_flag(1) || otp_id(u32, only when otp_flag = 1)
//! header   = dh_send_pub(32) || pn(u32) || n(u32)
//! body     = ciphertext_len(u32) || ciphertext
//! ```
//!
//! Flags bit 0 marks an initial envelope: the first message(s) from a
//! new initiator carry the X3DH material the responder needs to
//! reconstruct the shared secret.

use serde::{Deserialize, Serialize};

use crate::ratchet::Header;

pub const ENVELOPE_VERSION: u8 = 0x01;

const FLAG_INITIAL: u8 = 0b0000_0001;
const KNOWN_FLAGS: u8 = FLAG_INITIAL;

/// Ciphertext length sanity cap; anything larger than a frame can carry
/// is malformed.
const MAX_CIPHERTEXT: usize = 1024 * 1024;

/// X3DH material carried alongside the first message(s) of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialBlock {
    /// Sender's Ed25519 identity public key.
    pub identity_pub: [u8; 32],
    /// Sender's X25519 ephemeral public key.
    pub ephemeral_pub: [u8; 32],
    /// Which of the recipient's signed prekeys was used.
    pub signed_prekey_id: u32,
    /// Which one-time prekey was consumed, if any.
    pub one_time_prekey_id: Option<u32>,
}

/// One encrypted message: an optional initial block, the ratchet
/// header, and the AEAD ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub initial: Option<InitialBlock>,
    pub header: Header,
    pub ciphertext: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        let initial_len = match &self.initial {
            None => 0,
            Some(b) => 32 + 32 + 4 + 1 + if b.one_time_prekey_id.is_some() { 4 } else { 0 },
        };
        let mut out = Vec::with_capacity(2 + initial_len + Header::LEN + 4 + self.ciphertext.len());

        out.push(ENVELOPE_VERSION);
        out.push(if self.initial.is_some() { FLAG_INITIAL } else { 0 });

        if let Some(initial) = &self.initial {
            out.extend_from_slice(&initial.identity_pub);
            out.extend_from_slice(&initial.ephemeral_pub);
            out.extend_from_slice(&initial.signed_prekey_id.to_be_bytes());
            match initial.one_time_prekey_id {
                Some(id) => {
                    out.push(1);
                    out.extend_from_slice(&id.to_be_bytes());
                }
                None => out.push(0),
            }
        }

        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&(self.ciphertext.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let mut r = Reader::new(bytes);

        let version = r.u8()?;
        if version != ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(version));
        }
        let flags = r.u8()?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(EnvelopeError::UnknownFlags(flags));
        }

        let initial = if flags & FLAG_INITIAL != 0 {
            let identity_pub = r.array::<32>()?;
            let ephemeral_pub = r.array::<32>()?;
            let signed_prekey_id = r.u32()?;
            let one_time_prekey_id = match r.u8()? {
                0 => None,
                1 => Some(r.u32()?),
                _ => return Err(EnvelopeError::Malformed),
            };
            Some(InitialBlock { identity_pub, ephemeral_pub, signed_prekey_id, one_time_prekey_id })
        } else {
            None
        };

        let header_bytes = r.bytes(Header::LEN)?;
        let header = Header::from_bytes(header_bytes).map_err(|_| EnvelopeError::Malformed)?;

        let ciphertext_len = r.u32()? as usize;
        if ciphertext_len > MAX_CIPHERTEXT {
            return Err(EnvelopeError::Malformed);
        }
        let ciphertext = r.bytes(ciphertext_len)?.to_vec();

        if !r.is_empty() {
            return Err(EnvelopeError::TrailingBytes);
        }

        Ok(Envelope { initial, header, ciphertext })
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], EnvelopeError> {
        let end = self.pos.checked_add(n).ok_or(EnvelopeError::Truncated)?;
        if end > self.data.len() {
            return Err(EnvelopeError::Truncated);
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, EnvelopeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, EnvelopeError> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], EnvelopeError> {
        Ok(self.bytes(N)?.try_into().unwrap())
    }

    fn is_empty(&self) -> bool {
        self.pos == self.data.len()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unsupported envelope version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("unknown envelope flags {0:#010b}")]
    UnknownFlags(u8),
    #[error("envelope truncated")]
    Truncated,
    #[error("trailing bytes after envelope")]
    TrailingBytes,
    #[error("malformed envelope")]
    Malformed,
}
