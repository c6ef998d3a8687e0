//! Traffic obfuscation codec
//!
//! Transforms forwarded bodies into authenticated, padded wire frames so a
//! passive on-path observer sees neither plaintext content nor stable
//! message lengths, and restores them losslessly on the receiving side.
//!
//! Frame format:
//! ```text
//! +----------------+------------------+----------------+------------------+
//! | Length (4B BE) |  Jitter (var.)   |  HMAC (32B)    |  Sealed payload  |
//! +----------------+------------------+----------------+------------------+
//! ```
//!
//! - The length field records the size of the HMAC + sealed-payload segment;
//!   jitter is excluded, so its size is recovered as
//!   `frame_len - 4 - length`.
//! - Jitter is a block of random bytes whose length is drawn uniformly from
//!   a configured range on every encode.
//! - The HMAC-SHA256 tag covers the sealed payload and is verified in
//!   constant time before any decryption is attempted.
//! - The sealed payload is `nonce (12B) || ChaCha20-Poly1305 ciphertext` of
//!   `timestamp (8B BE) || body`; the nonce is random per call.
//!
//! Request and response directions use independent encryption keys; the MAC
//! key is shared. Apart from randomness draws every encode/decode pair is
//! pure — no session state is carried across calls.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Length of the big-endian frame length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Length of the HMAC-SHA256 integrity tag
pub const MAC_LEN: usize = 32;

/// Length of the AEAD nonce
pub const NONCE_LEN: usize = 12;

/// Length of the AEAD authentication tag
pub const TAG_LEN: usize = 16;

/// Length of the timestamp prefixed to every plaintext body
pub const TIMESTAMP_LEN: usize = 8;

/// Length of each encryption key
pub const ENC_KEY_LEN: usize = 32;

/// Length of the MAC key
pub const MAC_KEY_LEN: usize = 64;

/// Smallest frame that can possibly decode: length prefix, tag, nonce and
/// AEAD tag with an empty timestamp-only plaintext
pub const MIN_FRAME_LEN: usize = LENGTH_PREFIX_LEN + MAC_LEN + NONCE_LEN + TAG_LEN;

/// Obfuscation errors
#[derive(Debug, Error)]
pub enum ObfuscationError {
    #[error("frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("integrity check failed")]
    Integrity,

    #[error("decryption failed")]
    Decrypt,

    #[error("random source failure")]
    Rand,
}

impl From<ring::error::Unspecified> for ObfuscationError {
    fn from(_: ring::error::Unspecified) -> Self {
        ObfuscationError::Rand
    }
}

/// Which traffic direction a frame belongs to
///
/// Each direction encrypts under its own key; a frame encoded for one
/// direction never decodes under the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client-to-upstream bodies
    Request,
    /// Upstream-to-client bodies
    Response,
}

/// Bounds for the random jitter block, in bytes
#[derive(Debug, Clone, Copy)]
pub struct JitterRange {
    /// Minimum jitter length
    pub min: usize,
    /// Maximum jitter length (exclusive)
    pub max: usize,
}

impl Default for JitterRange {
    fn default() -> Self {
        Self { min: 100, max: 500 }
    }
}

/// Symmetric codec turning plaintext bodies into obfuscated wire frames
pub struct Obfuscator {
    request_key: LessSafeKey,
    response_key: LessSafeKey,
    mac_key: hmac::Key,
    jitter: JitterRange,
    rng: SystemRandom,
}

impl std::fmt::Debug for Obfuscator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Obfuscator")
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl Obfuscator {
    /// Create an obfuscator with freshly generated random keys
    pub fn new() -> Result<Self, ObfuscationError> {
        let rng = SystemRandom::new();

        let mut request_key = [0u8; ENC_KEY_LEN];
        let mut response_key = [0u8; ENC_KEY_LEN];
        let mut mac_key = [0u8; MAC_KEY_LEN];
        rng.fill(&mut request_key)?;
        rng.fill(&mut response_key)?;
        rng.fill(&mut mac_key)?;

        Self::from_keys(&request_key, &response_key, &mac_key, JitterRange::default())
    }

    /// Create an obfuscator from existing key material
    ///
    /// Two proxy instances that should understand each other's frames must
    /// be constructed from the same keys.
    pub fn from_keys(
        request_key: &[u8; ENC_KEY_LEN],
        response_key: &[u8; ENC_KEY_LEN],
        mac_key: &[u8; MAC_KEY_LEN],
        jitter: JitterRange,
    ) -> Result<Self, ObfuscationError> {
        let request_key = UnboundKey::new(&CHACHA20_POLY1305, request_key)
            .map_err(|_| ObfuscationError::Rand)?;
        let response_key = UnboundKey::new(&CHACHA20_POLY1305, response_key)
            .map_err(|_| ObfuscationError::Rand)?;

        Ok(Self {
            request_key: LessSafeKey::new(request_key),
            response_key: LessSafeKey::new(response_key),
            mac_key: hmac::Key::new(hmac::HMAC_SHA256, mac_key),
            jitter,
            rng: SystemRandom::new(),
        })
    }

    /// Override the jitter range
    pub fn with_jitter(mut self, jitter: JitterRange) -> Self {
        self.jitter = jitter;
        self
    }

    fn key_for(&self, direction: Direction) -> &LessSafeKey {
        match direction {
            Direction::Request => &self.request_key,
            Direction::Response => &self.response_key,
        }
    }

    /// Encode a body into an obfuscated frame
    ///
    /// A zero-length body is valid and produces a decodable frame.
    pub fn encode(&self, direction: Direction, body: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        // Timestamp prefix, then seal
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        let mut plaintext = Vec::with_capacity(TIMESTAMP_LEN + body.len());
        plaintext.extend_from_slice(&timestamp.to_be_bytes());
        plaintext.extend_from_slice(body);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        self.key_for(direction)
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut plaintext)
            .map_err(|_| ObfuscationError::Rand)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + plaintext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&plaintext);

        let tag = hmac::sign(&self.mac_key, &sealed);

        // Length counts tag + sealed payload; jitter sits between the
        // length field and the tag and is excluded from it.
        let payload_len = MAC_LEN + sealed.len();
        let jitter_len = self.draw_jitter_len()?;

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + jitter_len + payload_len);
        frame.extend_from_slice(&(payload_len as u32).to_be_bytes());

        let mut jitter = vec![0u8; jitter_len];
        self.rng.fill(&mut jitter)?;
        frame.extend_from_slice(&jitter);

        frame.extend_from_slice(tag.as_ref());
        frame.extend_from_slice(&sealed);

        Ok(frame)
    }

    /// Decode an obfuscated frame back into the original body
    ///
    /// The tag is verified in constant time before decryption; frames that
    /// are undersized, tampered with, or sealed under a different key are
    /// rejected without ever treating unauthenticated bytes as body content.
    pub fn decode(&self, direction: Direction, frame: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(ObfuscationError::FrameTooShort(frame.len()));
        }

        let declared = u32::from_be_bytes(
            frame[..LENGTH_PREFIX_LEN]
                .try_into()
                .map_err(|_| ObfuscationError::FrameTooShort(frame.len()))?,
        ) as usize;

        if declared < MAC_LEN + NONCE_LEN + TAG_LEN
            || frame.len() < LENGTH_PREFIX_LEN + declared
        {
            return Err(ObfuscationError::FrameTooShort(frame.len()));
        }

        // Payload starts after the length prefix and the jitter block
        let jitter_len = frame.len() - LENGTH_PREFIX_LEN - declared;
        let payload = &frame[LENGTH_PREFIX_LEN + jitter_len..];

        let (tag, sealed) = payload.split_at(MAC_LEN);
        hmac::verify(&self.mac_key, sealed, tag).map_err(|_| ObfuscationError::Integrity)?;

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| ObfuscationError::Decrypt)?;

        let mut buf = ciphertext.to_vec();
        let plaintext = self
            .key_for(direction)
            .open_in_place(nonce, Aad::empty(), &mut buf)
            .map_err(|_| ObfuscationError::Decrypt)?;

        if plaintext.len() < TIMESTAMP_LEN {
            return Err(ObfuscationError::Decrypt);
        }

        Ok(plaintext[TIMESTAMP_LEN..].to_vec())
    }

    /// Draw a jitter length uniformly from the configured range
    fn draw_jitter_len(&self) -> Result<usize, ObfuscationError> {
        let span = self.jitter.max.saturating_sub(self.jitter.min);
        if span == 0 {
            return Ok(self.jitter.min);
        }
        let mut buf = [0u8; 4];
        self.rng.fill(&mut buf)?;
        Ok(self.jitter.min + (u32::from_be_bytes(buf) as usize) % span)
    }
}

/// Fill a buffer with cryptographically secure random bytes
pub(crate) fn random_bytes(buf: &mut [u8]) -> Result<(), ObfuscationError> {
    SystemRandom::new().fill(buf)?;
    Ok(())
}

/// Generate a random alphanumeric string of the given length
pub(crate) fn random_alphanumeric(len: usize) -> Result<String, ObfuscationError> {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

    let mut buf = vec![0u8; len];
    random_bytes(&mut buf)?;
    Ok(buf
        .into_iter()
        .map(|b| CHARSET[b as usize % CHARSET.len()] as char)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> JitterRange {
        JitterRange { min: 0, max: 0 }
    }

    #[test]
    fn test_round_trip() {
        let obf = Obfuscator::new().unwrap();
        let body = b"The quick brown fox jumps over the lazy dog";

        for direction in [Direction::Request, Direction::Response] {
            let frame = obf.encode(direction, body).unwrap();
            let decoded = obf.decode(direction, &frame).unwrap();
            assert_eq!(decoded, body);
        }
    }

    #[test]
    fn test_empty_body_round_trip() {
        let obf = Obfuscator::new().unwrap();
        let frame = obf.encode(Direction::Request, b"").unwrap();
        let decoded = obf.decode(Direction::Request, &frame).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_directions_are_independent() {
        let obf = Obfuscator::new().unwrap();
        let frame = obf.encode(Direction::Request, b"payload").unwrap();
        let result = obf.decode(Direction::Response, &frame);
        assert!(matches!(result, Err(ObfuscationError::Decrypt)));
    }

    #[test]
    fn test_tampered_tag_rejected() {
        let obf = Obfuscator::new().unwrap().with_jitter(no_jitter());
        let mut frame = obf.encode(Direction::Request, b"payload").unwrap();

        // With zero jitter the tag starts right after the length prefix
        frame[LENGTH_PREFIX_LEN] ^= 0xFF;
        let result = obf.decode(Direction::Request, &frame);
        assert!(matches!(result, Err(ObfuscationError::Integrity)));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let obf = Obfuscator::new().unwrap().with_jitter(no_jitter());
        let mut frame = obf.encode(Direction::Request, b"payload").unwrap();

        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let result = obf.decode(Direction::Request, &frame);
        // The MAC covers the sealed payload, so corruption anywhere past the
        // tag surfaces as an integrity failure first
        assert!(matches!(result, Err(ObfuscationError::Integrity)));
    }

    #[test]
    fn test_undersized_frame_rejected() {
        let obf = Obfuscator::new().unwrap();
        for len in [0, 1, LENGTH_PREFIX_LEN, MIN_FRAME_LEN - 1] {
            let frame = vec![0u8; len];
            assert!(matches!(
                obf.decode(Direction::Request, &frame),
                Err(ObfuscationError::FrameTooShort(_))
            ));
        }
    }

    #[test]
    fn test_declared_length_exceeding_frame_rejected() {
        let obf = Obfuscator::new().unwrap().with_jitter(no_jitter());
        let mut frame = obf.encode(Direction::Request, b"payload").unwrap();
        let huge = (frame.len() as u32).to_be_bytes();
        frame[..LENGTH_PREFIX_LEN].copy_from_slice(&huge);
        assert!(matches!(
            obf.decode(Direction::Request, &frame),
            Err(ObfuscationError::FrameTooShort(_))
        ));
    }

    #[test]
    fn test_jitter_length_varies() {
        let obf = Obfuscator::new().unwrap();
        let body = b"constant body";

        let lengths: std::collections::HashSet<usize> = (0..16)
            .map(|_| obf.encode(Direction::Request, body).unwrap().len())
            .collect();

        assert!(lengths.len() > 1, "padding should vary across encodes");
    }

    #[test]
    fn test_jitter_within_bounds() {
        let jitter = JitterRange { min: 10, max: 20 };
        let obf = Obfuscator::new().unwrap().with_jitter(jitter);

        for _ in 0..32 {
            let frame = obf.encode(Direction::Request, b"x").unwrap();
            let declared = u32::from_be_bytes(frame[..4].try_into().unwrap()) as usize;
            let jitter_len = frame.len() - LENGTH_PREFIX_LEN - declared;
            assert!((10..20).contains(&jitter_len));
        }
    }

    #[test]
    fn test_random_alphanumeric() {
        let s = random_alphanumeric(32).unwrap();
        assert_eq!(s.len(), 32);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
