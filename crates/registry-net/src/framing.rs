//! Message framing for the gossip transport
//!
//! Provides length-prefixed framing with optional secret-key sealing of
//! every payload.

use crate::crypto::{CryptoError, SecretKey};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Bytes of framing around each payload (length prefix and type byte)
pub const FRAME_OVERHEAD: usize = 5;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unknown frame type: {0}")]
    UnknownType(u8),
    #[error("Empty frame")]
    Empty,
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Ping for keepalive
    Ping = 0,
    /// Pong response
    Pong = 1,
    /// Sender introduction (name and advertised address)
    Hello = 2,
    /// Gossiped change fragment
    Broadcast = 10,
    /// Push/pull: sender's full state
    PushPullRequest = 20,
    /// Push/pull: responder's full state
    PushPullResponse = 21,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ping),
            1 => Ok(Self::Pong),
            2 => Ok(Self::Hello),
            10 => Ok(Self::Broadcast),
            20 => Ok(Self::PushPullRequest),
            21 => Ok(Self::PushPullResponse),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload (sealed when a secret key is set)
#[derive(Clone, Default)]
pub struct FrameCodec {
    secret_key: Option<SecretKey>,
}

impl FrameCodec {
    /// Create a plaintext codec
    pub fn new() -> Self {
        Self { secret_key: None }
    }

    /// Create a codec sealing every payload with `key`
    pub fn with_secret_key(key: SecretKey) -> Self {
        Self {
            secret_key: Some(key),
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.secret_key.is_some()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < FRAME_OVERHEAD {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if length == 0 {
            return Err(FrameError::Empty);
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        let body = src.split_to(length - 1);
        let payload = match &self.secret_key {
            Some(key) => key.open(frame_type as u8, &body)?,
            None => body.to_vec(),
        };

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = match &self.secret_key {
            Some(key) => key.seal(item.frame_type as u8, &item.payload)?,
            None => item.payload,
        };

        let length = 1 + payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    pub fn ping() -> Self {
        Self::new(FrameType::Ping, vec![])
    }

    pub fn pong() -> Self {
        Self::new(FrameType::Pong, vec![])
    }
}
