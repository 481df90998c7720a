//! Authorization store
//!
//! Turns accepted handshakes into time-bounded per-rule grants and answers
//! admission questions for the forwarding gates. Each rule owns a disjoint
//! partition of grants behind its own lock: a grant under one rule confers
//! nothing under another.
//!
//! Admission order for `(rule, ip)`, first match wins:
//! 1. global deny IP rules → refused
//! 2. global allow IP rules → admitted
//! 3. rule allow IP rules → admitted
//! 4. unexpired dynamic grant → admitted
//! 5. otherwise refused

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::pattern::{any_ip_matches, any_token_matches, IpRule, TokenPattern};
use crate::rule::{ForwardRule, GlobalPolicy};

/// How often each rule's expired grants are swept
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// ============================================================================
// Types
// ============================================================================

/// Index of a rule within the store, in configuration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(pub usize);

/// Why a source was admitted or refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Matched a global deny rule
    Denied,
    /// Matched a global allow rule
    GlobalAllow,
    /// Matched the rule's permanent allow list
    RuleAllow,
    /// Holds an unexpired grant
    Granted,
    /// Nothing matched
    Unknown,
}

impl Decision {
    pub fn is_admitted(self) -> bool {
        matches!(self, Decision::GlobalAllow | Decision::RuleAllow | Decision::Granted)
    }
}

/// One rule's policy and its grant table
struct Partition {
    port: u16,
    allow_tokens: Vec<TokenPattern>,
    allow_ips: Vec<IpRule>,
    grant_lifetime: Duration,
    /// Map from source IP to grant expiry
    grants: Mutex<HashMap<IpAddr, Instant>>,
}

// ============================================================================
// Store
// ============================================================================

/// Per-rule grant tables plus the global policy
pub struct AuthorizationStore {
    global: GlobalPolicy,
    partitions: Vec<Partition>,
}

impl AuthorizationStore {
    /// Create one empty partition per rule, in order
    pub fn new(global: GlobalPolicy, rules: &[ForwardRule]) -> Self {
        let partitions = rules
            .iter()
            .map(|rule| Partition {
                port: rule.port(),
                allow_tokens: rule.allow_tokens.clone(),
                allow_ips: rule.allow_ips.clone(),
                grant_lifetime: rule.grant_lifetime,
                grants: Mutex::new(HashMap::new()),
            })
            .collect();

        AuthorizationStore { global, partitions }
    }

    /// Ids of every rule partition
    pub fn rule_ids(&self) -> impl Iterator<Item = RuleId> {
        (0..self.partitions.len()).map(RuleId)
    }

    /// Bind port of a rule
    pub fn port(&self, rule: RuleId) -> Option<u16> {
        self.partitions.get(rule.0).map(|p| p.port)
    }

    /// Grant `ip` access to `rule` for `lifetime` from now.
    ///
    /// A second grant for the same source replaces the expiry.
    pub fn grant(&self, rule: RuleId, ip: IpAddr, lifetime: Duration) {
        self.grant_at(rule, ip, lifetime, Instant::now());
    }

    /// [`grant`](Self::grant) with an explicit clock
    pub fn grant_at(&self, rule: RuleId, ip: IpAddr, lifetime: Duration, now: Instant) {
        let Some(partition) = self.partitions.get(rule.0) else {
            return;
        };
        let mut grants = partition.grants.lock().unwrap_or_else(PoisonError::into_inner);
        grants.insert(ip.to_canonical(), now + lifetime);
    }

    /// Find the first rule on `port` whose patterns (or the global patterns)
    /// accept `token`, and grant `ip` under it for the rule's lifetime.
    pub fn authorize(&self, token: &str, port: u16, ip: IpAddr) -> Option<RuleId> {
        self.authorize_at(token, port, ip, Instant::now())
    }

    /// [`authorize`](Self::authorize) with an explicit clock
    pub fn authorize_at(&self, token: &str, port: u16, ip: IpAddr, now: Instant) -> Option<RuleId> {
        let global_match = any_token_matches(&self.global.allow_tokens, token);

        let (idx, partition) = self.partitions.iter().enumerate().find(|(_, p)| {
            p.port == port && (global_match || any_token_matches(&p.allow_tokens, token))
        })?;

        let rule = RuleId(idx);
        self.grant_at(rule, ip, partition.grant_lifetime, now);
        Some(rule)
    }

    /// Decide whether `ip` may connect through `rule` right now
    pub fn is_authorized(&self, rule: RuleId, ip: IpAddr) -> bool {
        self.decide(rule, ip).is_admitted()
    }

    /// Full admission decision for `ip` on `rule`
    pub fn decide(&self, rule: RuleId, ip: IpAddr) -> Decision {
        self.decide_at(rule, ip, Instant::now())
    }

    /// [`decide`](Self::decide) with an explicit clock
    pub fn decide_at(&self, rule: RuleId, ip: IpAddr, now: Instant) -> Decision {
        let ip = ip.to_canonical();

        if any_ip_matches(&self.global.deny_ips, ip) {
            return Decision::Denied;
        }
        if any_ip_matches(&self.global.allow_ips, ip) {
            return Decision::GlobalAllow;
        }

        let Some(partition) = self.partitions.get(rule.0) else {
            return Decision::Unknown;
        };
        if any_ip_matches(&partition.allow_ips, ip) {
            return Decision::RuleAllow;
        }

        let grants = partition.grants.lock().unwrap_or_else(PoisonError::into_inner);
        match grants.get(&ip) {
            Some(expires_at) if *expires_at > now => Decision::Granted,
            _ => Decision::Unknown,
        }
    }

    /// Delete expired grants for `rule`, returning the removed source IPs
    pub fn sweep(&self, rule: RuleId) -> Vec<IpAddr> {
        self.sweep_at(rule, Instant::now())
    }

    /// [`sweep`](Self::sweep) with an explicit clock
    pub fn sweep_at(&self, rule: RuleId, now: Instant) -> Vec<IpAddr> {
        let Some(partition) = self.partitions.get(rule.0) else {
            return Vec::new();
        };

        let mut grants = partition.grants.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<IpAddr> = grants
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(ip, _)| *ip)
            .collect();
        for ip in &expired {
            grants.remove(ip);
        }
        expired
    }

    /// Number of grants currently held by `rule` (expired or not)
    pub fn grant_count(&self, rule: RuleId) -> usize {
        self.partitions
            .get(rule.0)
            .map(|p| p.grants.lock().unwrap_or_else(PoisonError::into_inner).len())
            .unwrap_or(0)
    }
}
