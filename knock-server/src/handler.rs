//! Handshake processing
//!
//! Each datagram runs through the same checks, stopping at the first
//! failure:
//! 1. decrypt with the shared secret
//! 2. parse the request
//! 3. require a token and a non-zero port
//! 4. timestamp within [now - 300s, now + 60s]
//! 5. nonce not seen before (replay cache)
//! 6. a rule on the requested port accepts the token → grant the sender
//!
//! Nothing is ever sent back to the peer.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use knock_core::request::unix_now;
use knock_core::{AuthCodec, AuthorizationStore, HandshakeRequest, Observation, ReplayCache, RuleId};

use crate::metrics::Metrics;

// ============================================================================
// Constants
// ============================================================================

/// Oldest accepted timestamp, seconds before now
pub const MAX_PAST_SKEW_SECS: i64 = 300;

/// Newest accepted timestamp, seconds after now
pub const MAX_FUTURE_SKEW_SECS: i64 = 60;

// ============================================================================
// Outcome
// ============================================================================

/// Why a handshake was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Datagram did not decrypt under the shared secret
    Decrypt,
    /// Decrypted bytes were not a request
    Malformed,
    /// Empty token or zero port
    Invalid,
    /// Timestamp older than the freshness window
    Stale { timestamp: i64, now: i64 },
    /// Timestamp too far in the future
    Future { timestamp: i64, now: i64 },
    /// Nonce already consumed
    Replay,
    /// No rule on the port accepts the token
    NoMatchingRule { port: u16 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Decrypt => write!(f, "decrypt failed"),
            Rejection::Malformed => write!(f, "malformed request"),
            Rejection::Invalid => write!(f, "request invalid"),
            Rejection::Stale { timestamp, now } => {
                write!(f, "timestamp {} too old (now {})", timestamp, now)
            }
            Rejection::Future { timestamp, now } => {
                write!(f, "timestamp {} in the future (now {})", timestamp, now)
            }
            Rejection::Replay => write!(f, "duplicate nonce"),
            Rejection::NoMatchingRule { port } => write!(f, "no rule on port {} accepts token", port),
        }
    }
}

/// Terminal state of one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Accepted(RuleId),
    Rejected(Rejection),
}

// ============================================================================
// Handler
// ============================================================================

/// Validates handshakes and records grants
pub struct AuthHandler {
    codec: AuthCodec,
    replay: Arc<ReplayCache>,
    store: Arc<AuthorizationStore>,
    metrics: Arc<Metrics>,
}

impl AuthHandler {
    pub fn new(
        codec: AuthCodec,
        replay: Arc<ReplayCache>,
        store: Arc<AuthorizationStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        AuthHandler {
            codec,
            replay,
            store,
            metrics,
        }
    }

    /// Process one datagram received from `peer`
    pub fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) -> Outcome {
        self.handle_datagram_at(datagram, peer, unix_now())
    }

    /// [`handle_datagram`](Self::handle_datagram) with an explicit unix time
    pub fn handle_datagram_at(&self, datagram: &[u8], peer: SocketAddr, now: i64) -> Outcome {
        let outcome = self.evaluate(datagram, peer, now);
        let counter = match &outcome {
            Outcome::Accepted(_) => &self.metrics.handshakes_accepted_total,
            Outcome::Rejected(_) => &self.metrics.handshakes_rejected_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    fn evaluate(&self, datagram: &[u8], peer: SocketAddr, now: i64) -> Outcome {
        let plaintext = match self.codec.open(datagram) {
            Ok(p) => p,
            Err(e) => {
                log::info!("decrypt data from {} failed: {}", peer, e);
                self.metrics.decrypt_failures_total.fetch_add(1, Ordering::Relaxed);
                return Outcome::Rejected(Rejection::Decrypt);
            }
        };

        let request = match HandshakeRequest::from_bytes(&plaintext) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("unmarshal request from {} failed: {}", peer, e);
                return Outcome::Rejected(Rejection::Malformed);
            }
        };

        if !request.is_valid() {
            log::warn!("request invalid from {}", peer);
            return Outcome::Rejected(Rejection::Invalid);
        }

        if request.timestamp < now - MAX_PAST_SKEW_SECS {
            let rejection = Rejection::Stale {
                timestamp: request.timestamp,
                now,
            };
            log::warn!("timestamp of client {} was error: {}", peer, rejection);
            return Outcome::Rejected(rejection);
        }
        if request.timestamp > now + MAX_FUTURE_SKEW_SECS {
            let rejection = Rejection::Future {
                timestamp: request.timestamp,
                now,
            };
            log::warn!("timestamp of client {} was error: {}", peer, rejection);
            return Outcome::Rejected(rejection);
        }

        if self.replay.observe(&request.nonce) == Observation::Duplicate {
            log::error!("[ATTACK] duplicate nonce from {}", peer);
            self.metrics.replays_detected_total.fetch_add(1, Ordering::Relaxed);
            return Outcome::Rejected(Rejection::Replay);
        }

        match self.store.authorize(&request.token, request.port, peer.ip()) {
            Some(rule) => {
                log::info!("Auth IP {} to port {}", peer.ip(), request.port);
                Outcome::Accepted(rule)
            }
            None => {
                log::warn!("Auth IP {} failed: port {} token rejected", peer.ip(), request.port);
                Outcome::Rejected(Rejection::NoMatchingRule { port: request.port })
            }
        }
    }
}
