//! Replay cache for logical handshake nonces
//!
//! A nonce is accepted at most once while it is retained. Entries are kept
//! for [`DEFAULT_RETENTION`] after first sighting and removed by a periodic
//! purge, so a duplicate arriving after the purge horizon is not caught.
//! The nonce space is process-wide, shared by every forwarding rule.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

// ============================================================================
// Constants
// ============================================================================

/// How long a nonce is remembered after first sighting
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

/// How often the janitor purges expired nonces
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Cache
// ============================================================================

/// Result of observing a nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting within the retention window
    Fresh,
    /// Already seen within the retention window
    Duplicate,
}

/// Concurrent set of recently seen nonces
pub struct ReplayCache {
    /// Map from nonce bytes to first-seen time
    seen: Mutex<HashMap<Vec<u8>, Instant>>,
    /// Retention window
    retention: Duration,
}

impl ReplayCache {
    pub fn new(retention: Duration) -> Self {
        ReplayCache {
            seen: Mutex::new(HashMap::new()),
            retention,
        }
    }

    /// Atomically check and record `nonce`
    pub fn observe(&self, nonce: &[u8]) -> Observation {
        self.observe_at(nonce, Instant::now())
    }

    /// [`observe`](Self::observe) with an explicit clock
    pub fn observe_at(&self, nonce: &[u8], now: Instant) -> Observation {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.contains_key(nonce) {
            return Observation::Duplicate;
        }
        seen.insert(nonce.to_vec(), now);
        Observation::Fresh
    }

    /// Remove every nonce first seen more than the retention window ago.
    ///
    /// Returns the number of entries removed.
    pub fn purge(&self) -> usize {
        self.purge_at(Instant::now())
    }

    /// [`purge`](Self::purge) with an explicit clock
    pub fn purge_at(&self, now: Instant) -> usize {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let before = seen.len();
        seen.retain(|_, first_seen| now.saturating_duration_since(*first_seen) <= self.retention);
        before - seen.len()
    }

    /// Number of retained nonces
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}
