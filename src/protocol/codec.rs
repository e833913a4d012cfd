//! Protocol codec for encoding/decoding messages
//!
//! Handles framing of protocol messages: a fixed header (kind, body length)
//! in host byte order, followed by the raw body.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use super::{Message, MessageKind, DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE};

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Unknown message kind: {0}")]
    UnknownKind(u32),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// What to do with a message whose body exceeds the configured maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OversizePolicy {
    /// Refuse the message; on the read side this disconnects the peer
    #[default]
    Reject,
    /// Log a warning and process the message anyway
    Warn,
}

/// Size limits applied while framing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Largest body accepted without triggering the policy
    pub max_message_size: usize,
    /// Policy for bodies above `max_message_size`
    pub oversize_policy: OversizePolicy,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            oversize_policy: OversizePolicy::default(),
        }
    }
}

impl FrameLimits {
    fn check(&self, length: usize) -> Result<(), CodecError> {
        if length <= self.max_message_size {
            return Ok(());
        }
        match self.oversize_policy {
            OversizePolicy::Reject => {
                Err(CodecError::MessageTooLarge(length, self.max_message_size))
            }
            OversizePolicy::Warn => {
                tracing::warn!(
                    "Message of {} bytes exceeds the {} byte limit, processing anyway",
                    length,
                    self.max_message_size
                );
                Ok(())
            }
        }
    }
}

/// Encodes messages into the wire format
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    limits: FrameLimits,
}

impl Encoder {
    pub fn new(limits: FrameLimits) -> Self {
        Self { limits }
    }

    /// Encode a message into a buffer
    pub fn encode<T: MessageKind>(
        &self,
        message: &Message<T>,
        buf: &mut BytesMut,
    ) -> Result<(), CodecError> {
        let body = message.body();
        let length = u32::try_from(body.len())
            .map_err(|_| CodecError::MessageTooLarge(body.len(), u32::MAX as usize))?;
        self.limits.check(body.len())?;

        buf.reserve(HEADER_SIZE + body.len());
        buf.put_slice(&message.kind().ordinal().to_ne_bytes());
        buf.put_slice(&length.to_ne_bytes());
        buf.put_slice(body);

        Ok(())
    }
}

/// Decodes messages from the wire format
pub struct Decoder<T> {
    state: DecodeState<T>,
    limits: FrameLimits,
}

enum DecodeState<T> {
    Header,
    Body { kind: T, length: usize },
}

impl<T: MessageKind> Decoder<T> {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            state: DecodeState::Header,
            limits,
        }
    }

    /// Attempt to decode a message from the buffer
    /// Returns Ok(None) if more data is needed
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message<T>>, CodecError> {
        loop {
            match &self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    let raw_kind = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
                    let length = u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;

                    let kind = T::from_ordinal(raw_kind).ok_or(CodecError::UnknownKind(raw_kind))?;
                    self.limits.check(length)?;

                    buf.advance(HEADER_SIZE);
                    // The peer controls `length`; past the limit the buffer
                    // only grows as bytes arrive
                    let expected = length.min(self.limits.max_message_size);
                    buf.reserve(expected.saturating_sub(buf.len()));

                    self.state = DecodeState::Body { kind, length };
                }
                DecodeState::Body { kind, length } => {
                    let (kind, length) = (*kind, *length);
                    if buf.len() < length {
                        return Ok(None);
                    }

                    let body = buf.split_to(length).to_vec();

                    self.state = DecodeState::Header;

                    let message = Message::from_parts(kind, body)
                        .map_err(|_| CodecError::MessageTooLarge(length, u32::MAX as usize))?;
                    return Ok(Some(message));
                }
            }
        }
    }
}

impl<T: MessageKind> Default for Decoder<T> {
    fn default() -> Self {
        Self::new(FrameLimits::default())
    }
}
