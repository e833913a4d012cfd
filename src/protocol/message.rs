//! Protocol message definitions
//!
//! A [`Message`] is a typed header plus a growable byte body. Values are
//! appended and extracted with a strict stack discipline: the last value
//! pushed is the first one popped, so both peers must agree on push order.

use bytemuck::Pod;
use std::fmt;
use std::hash::Hash;
use thiserror::Error;

use super::HEADER_SIZE;

/// Tag type carried in the message header.
///
/// Any small, totally ordered value that maps onto a `u32` ordinal works.
/// `u32` itself qualifies; application enums implement `From<Kind> for u32`
/// and `TryFrom<u32> for Kind`.
pub trait MessageKind:
    Copy + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static + Into<u32> + TryFrom<u32>
{
    /// Wire ordinal of this kind
    fn ordinal(self) -> u32 {
        self.into()
    }

    /// Map a wire ordinal back onto a kind
    fn from_ordinal(raw: u32) -> Option<Self> {
        Self::try_from(raw).ok()
    }
}

impl<K> MessageKind for K where
    K: Copy + Eq + Ord + Hash + fmt::Debug + Send + Sync + 'static + Into<u32> + TryFrom<u32>
{
}

/// Message errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Body underflow: requested {requested} bytes, {available} available")]
    Underflow { requested: usize, available: usize },

    #[error("Body too large for a u32 length field: {0} bytes")]
    BodyTooLarge(usize),
}

pub type MessageResult<T> = Result<T, MessageError>;

/// Message header: kind tag and body length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader<T> {
    /// Message kind
    pub kind: T,
    /// Body length in bytes
    pub size: u32,
}

/// A framed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message<T> {
    header: MessageHeader<T>,
    body: Vec<u8>,
}

impl<T: MessageKind> Message<T> {
    /// Create an empty message of the given kind
    pub fn new(kind: T) -> Self {
        Self {
            header: MessageHeader { kind, size: 0 },
            body: Vec::new(),
        }
    }

    /// Build a message from a kind and an already-serialized body
    pub fn from_parts(kind: T, body: Vec<u8>) -> MessageResult<Self> {
        let size = u32::try_from(body.len()).map_err(|_| MessageError::BodyTooLarge(body.len()))?;
        Ok(Self {
            header: MessageHeader { kind, size },
            body,
        })
    }

    pub fn header(&self) -> &MessageHeader<T> {
        &self.header
    }

    pub fn kind(&self) -> T {
        self.header.kind
    }

    /// Retag the message; the body is left untouched
    pub fn set_kind(&mut self, kind: T) {
        self.header.kind = kind;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Total framed size (header + body)
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Append a fixed-layout value to the end of the body
    pub fn push<V: Pod>(&mut self, value: &V) -> &mut Self {
        self.body.extend_from_slice(bytemuck::bytes_of(value));
        self.sync_size();
        self
    }

    /// Remove a fixed-layout value from the end of the body
    ///
    /// Values come back in reverse push order. On underflow the message is
    /// left unchanged.
    pub fn pop<V: Pod>(&mut self) -> MessageResult<V> {
        let start = self.split_point(std::mem::size_of::<V>())?;
        let value = bytemuck::pod_read_unaligned(&self.body[start..]);
        self.body.truncate(start);
        self.sync_size();
        Ok(value)
    }

    /// Append raw bytes to the end of the body
    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.body.extend_from_slice(bytes);
        self.sync_size();
        self
    }

    /// Remove `len` raw bytes from the end of the body
    pub fn pop_bytes(&mut self, len: usize) -> MessageResult<Vec<u8>> {
        let start = self.split_point(len)?;
        let bytes = self.body.split_off(start);
        self.sync_size();
        Ok(bytes)
    }

    /// Empty the body; the kind is kept
    pub fn clear(&mut self) {
        self.body.clear();
        self.sync_size();
    }

    fn split_point(&self, requested: usize) -> MessageResult<usize> {
        self.body
            .len()
            .checked_sub(requested)
            .ok_or(MessageError::Underflow {
                requested,
                available: self.body.len(),
            })
    }

    // Body growth past u32::MAX is caught by the encoder, which refuses the frame.
    fn sync_size(&mut self) {
        self.header.size = u32::try_from(self.body.len()).unwrap_or(u32::MAX);
    }
}

impl<T: MessageKind> fmt::Display for Message<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Kind: {:?} Size: {}", self.header.kind, self.header.size)
    }
}
