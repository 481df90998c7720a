//! Handshake request carried inside the encrypted UDP datagram
//!
//! The plaintext is JSON with the field names `Token`, `Port`, `Timestamp`
//! and `Nonce`. `Nonce` is the logical nonce used for replay detection; it
//! is independent of the AEAD nonce even when the client reuses the value.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================================================
// Request
// ============================================================================

/// A single proof of token possession for one forwarding port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HandshakeRequest {
    /// Shared token matched against allow patterns
    pub token: String,
    /// Bind port of the forwarding rule being unlocked
    pub port: u16,
    /// Unix seconds at send time
    pub timestamp: i64,
    /// Logical nonce for replay detection
    #[serde(default)]
    pub nonce: Vec<u8>,
}

impl HandshakeRequest {
    /// Create a request stamped with the current time and an empty nonce.
    ///
    /// The nonce (and a fresh timestamp) is filled in when the request is
    /// sealed by [`crate::codec::AuthCodec::seal_request`].
    pub fn new(token: impl Into<String>, port: u16) -> Self {
        HandshakeRequest {
            token: token.into(),
            port,
            timestamp: unix_now(),
            nonce: Vec::new(),
        }
    }

    /// A request is only meaningful with a token and a non-zero port
    pub fn is_valid(&self) -> bool {
        !self.token.is_empty() && self.port != 0
    }

    /// Serialize to the JSON plaintext sent on the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse the JSON plaintext received from the wire
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

/// Current wall-clock time in unix seconds
pub fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
