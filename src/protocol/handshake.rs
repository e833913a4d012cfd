//! Challenge/response screening performed before any message flows
//!
//! The server sends an 8-byte challenge, the client answers with
//! [`transform`] of it, and the server compares byte for byte. This filters
//! out peers that do not speak the protocol. It is not cryptography.

use std::time::{SystemTime, UNIX_EPOCH};

/// Length of the challenge and of the response
pub const CHALLENGE_LEN: usize = 8;

pub type Challenge = [u8; CHALLENGE_LEN];

/// Generate a fresh challenge from the high-resolution wall clock
pub fn generate_challenge() -> Challenge {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default();
    nanos.to_ne_bytes()
}

/// Response transform applied to a single challenge byte
///
/// Must stay bit-identical with existing peers.
#[inline]
pub fn transform_byte(byte: u8) -> u8 {
    (!(byte.rotate_left(3) ^ 0xAF)).wrapping_add(1)
}

/// Compute the expected response for a challenge
pub fn transform(challenge: &Challenge) -> Challenge {
    challenge.map(transform_byte)
}

/// Check a peer's response against the challenge it was sent
pub fn verify(challenge: &Challenge, response: &Challenge) -> bool {
    transform(challenge) == *response
}
