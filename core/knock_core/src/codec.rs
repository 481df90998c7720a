//! Authenticated encryption of handshake payloads
//!
//! The cipher key is the SHA-256 digest of the shared secret, so secrets of
//! any length are accepted. Payloads are sealed with AES-256-GCM under a
//! fresh random 96-bit nonce per message and a fixed associated-data string.
//!
//! # Wire format
//!
//! ```text
//! +----------------------+------------------------------+----------------+
//! | AEAD nonce (12 bytes)| ciphertext (len of plaintext)| tag (16 bytes) |
//! +----------------------+------------------------------+----------------+
//! ```

use std::fmt;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest::{digest, SHA256};
use ring::rand::{SecureRandom, SystemRandom};

use crate::request::{unix_now, HandshakeRequest};

// ============================================================================
// Constants (MUST match on client and server)
// ============================================================================

/// Associated data bound into every authentication tag
pub const ASSOCIATED_DATA: &[u8] = b"knock-handshake-v1";

/// Size of the AEAD nonce prepended to every datagram
pub const WIRE_NONCE_LEN: usize = NONCE_LEN;

// ============================================================================
// Errors
// ============================================================================

/// Errors while sealing or opening a handshake payload
#[derive(Debug)]
pub enum CodecError {
    /// Shared secret was empty
    EmptySecret,
    /// Datagram was empty
    EmptyCiphertext,
    /// Datagram shorter than the AEAD nonce
    Truncated(usize),
    /// Tag verification failed (tampered data or wrong key)
    Authentication,
    /// Cipher rejected the derived key or the plaintext
    Cipher,
    /// System randomness unavailable
    Random,
    /// Request could not be serialized
    Serialize(serde_json::Error),
    /// Decrypted bytes are not a handshake request
    Malformed(serde_json::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::EmptySecret => write!(f, "shared secret cannot be empty"),
            CodecError::EmptyCiphertext => write!(f, "ciphertext is empty"),
            CodecError::Truncated(len) => {
                write!(f, "ciphertext too short: {} bytes (nonce is {})", len, WIRE_NONCE_LEN)
            }
            CodecError::Authentication => write!(f, "authentication failed"),
            CodecError::Cipher => write!(f, "cipher operation failed"),
            CodecError::Random => write!(f, "failed to generate nonce"),
            CodecError::Serialize(e) => write!(f, "marshal request failed: {}", e),
            CodecError::Malformed(e) => write!(f, "malformed request: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Serialize(e) | CodecError::Malformed(e) => Some(e),
            _ => None,
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Seals and opens handshake datagrams under one shared secret
pub struct AuthCodec {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl AuthCodec {
    /// Derive the cipher key from `secret`
    pub fn new(secret: &[u8]) -> Result<Self, CodecError> {
        if secret.is_empty() {
            return Err(CodecError::EmptySecret);
        }
        let cipher_key = digest(&SHA256, secret);
        let unbound =
            UnboundKey::new(&AES_256_GCM, cipher_key.as_ref()).map_err(|_| CodecError::Cipher)?;
        Ok(AuthCodec {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Encrypt arbitrary plaintext under a fresh random nonce
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
        let nonce = self.fresh_nonce()?;
        self.seal_with_nonce(nonce, plaintext)
    }

    /// Stamp `request` with the current time and a fresh nonce, then seal it.
    ///
    /// The generated nonce doubles as the AEAD nonce and the logical nonce, so
    /// two calls never produce the same datagram.
    pub fn seal_request(&self, request: &mut HandshakeRequest) -> Result<Vec<u8>, CodecError> {
        let nonce = self.fresh_nonce()?;
        request.timestamp = unix_now();
        request.nonce = nonce.to_vec();
        let plaintext = request.to_bytes().map_err(CodecError::Serialize)?;
        self.seal_with_nonce(nonce, &plaintext)
    }

    /// Verify and decrypt a datagram
    pub fn open(&self, datagram: &[u8]) -> Result<Vec<u8>, CodecError> {
        if datagram.is_empty() {
            return Err(CodecError::EmptyCiphertext);
        }
        if datagram.len() < WIRE_NONCE_LEN {
            return Err(CodecError::Truncated(datagram.len()));
        }

        let (nonce, sealed) = datagram.split_at(WIRE_NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| CodecError::Truncated(datagram.len()))?;

        let mut in_out = sealed.to_vec();
        let plain_len = self
            .key
            .open_in_place(nonce, Aad::from(ASSOCIATED_DATA), &mut in_out)
            .map_err(|_| CodecError::Authentication)?
            .len();
        in_out.truncate(plain_len);
        Ok(in_out)
    }

    /// Verify, decrypt and parse a datagram into a request
    pub fn open_request(&self, datagram: &[u8]) -> Result<HandshakeRequest, CodecError> {
        let plaintext = self.open(datagram)?;
        HandshakeRequest::from_bytes(&plaintext).map_err(CodecError::Malformed)
    }

    fn fresh_nonce(&self) -> Result<[u8; WIRE_NONCE_LEN], CodecError> {
        let mut nonce = [0u8; WIRE_NONCE_LEN];
        self.rng.fill(&mut nonce).map_err(|_| CodecError::Random)?;
        Ok(nonce)
    }

    fn seal_with_nonce(
        &self,
        nonce: [u8; WIRE_NONCE_LEN],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(ASSOCIATED_DATA),
                &mut in_out,
            )
            .map_err(|_| CodecError::Cipher)?;

        let mut datagram = Vec::with_capacity(WIRE_NONCE_LEN + in_out.len());
        datagram.extend_from_slice(&nonce);
        datagram.extend_from_slice(&in_out);
        Ok(datagram)
    }
}

/// One-shot seal with a shared secret
pub fn seal(plaintext: &[u8], secret: &[u8]) -> Result<Vec<u8>, CodecError> {
    AuthCodec::new(secret)?.seal(plaintext)
}

/// One-shot open with a shared secret
pub fn open(datagram: &[u8], secret: &[u8]) -> Result<Vec<u8>, CodecError> {
    AuthCodec::new(secret)?.open(datagram)
}
