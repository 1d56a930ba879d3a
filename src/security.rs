// src/security.rs
//! Security primitives for the manual trigger
//!
//! Includes:
//! - Abuse guard (sliding-window failure counting with temporary blocks)
//! - Client identity resolution behind trusted proxies
//! - Constant-time secret comparison
//!
//! Records live in the shared [`KvStore`] so every process serving the
//! trigger sees the same counts.

use crate::clock::Clock;
use crate::error::Result;
use crate::store::KvStore;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Key prefix for rate-limit records
pub const RATE_LIMIT_PREFIX: &str = "rate_limit:";

/// Chance that a lookup also purges expired records
const DEFAULT_PURGE_CHANCE: f64 = 0.1;

/// Failure history for one client identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Unix seconds of failures inside the current window
    #[serde(default)]
    pub attempts: Vec<i64>,
    /// Unix seconds until which the identity is refused (0 = not blocked)
    #[serde(default)]
    pub blocked_until: i64,
}

impl RateLimitRecord {
    fn is_expired(&self, now: i64, window: i64) -> bool {
        self.blocked_until <= now && self.attempts.iter().all(|t| now - t >= window)
    }
}

/// Limits for the abuse guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbuseLimits {
    /// Failures within the window that trigger a block
    pub max_attempts: u32,
    pub window: Duration,
    pub block_duration: Duration,
}

impl Default for AbuseLimits {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window: Duration::from_secs(300),
            block_duration: Duration::from_secs(900),
        }
    }
}

/// Blocks identities that keep presenting the wrong secret
pub struct AbuseGuard {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    limits: AbuseLimits,
    purge_chance: f64,
}

impl AbuseGuard {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>, limits: AbuseLimits) -> Self {
        Self {
            store,
            clock,
            limits,
            purge_chance: DEFAULT_PURGE_CHANCE,
        }
    }

    /// Override how often lookups purge expired records (0.0 to 1.0)
    pub fn with_purge_chance(mut self, chance: f64) -> Self {
        self.purge_chance = chance.clamp(0.0, 1.0);
        self
    }

    pub fn limits(&self) -> AbuseLimits {
        self.limits
    }

    /// When the identity's block ends, if it is blocked now
    pub fn blocked_until(&self, identity: &str) -> Result<Option<i64>> {
        if self.purge_chance > 0.0 && rand::thread_rng().gen_bool(self.purge_chance) {
            if let Err(e) = self.purge_expired() {
                warn!("Rate-limit purge failed: {}", e);
            }
        }

        let now = self.clock.unix_now();
        let record = self.load(identity)?;
        Ok((record.blocked_until > now).then_some(record.blocked_until))
    }

    /// Count a failed attempt; returns true if the identity is now blocked
    pub fn record_failure(&self, identity: &str) -> Result<bool> {
        let now = self.clock.unix_now();
        let window = self.limits.window.as_secs() as i64;
        let block = self.limits.block_duration.as_secs() as i64;
        let max_attempts = self.limits.max_attempts as usize;
        let mut blocked = false;

        self.store.update(&record_key(identity), &mut |current| {
            let mut record = decode(current.as_deref());
            if record.blocked_until > now {
                blocked = true;
                return Ok(Some(serde_json::to_string(&record)?));
            }

            record.attempts.retain(|t| now - t < window);
            record.attempts.push(now);

            blocked = record.attempts.len() >= max_attempts;
            if blocked {
                record.blocked_until = now + block;
                record.attempts.clear();
            }
            Ok(Some(serde_json::to_string(&record)?))
        })?;

        if blocked {
            warn!(client = identity, "Client blocked for {} seconds", block);
        } else {
            debug!(client = identity, "Recorded failed trigger attempt");
        }
        Ok(blocked)
    }

    /// Forget the identity's history
    pub fn clear(&self, identity: &str) -> Result<()> {
        self.store.delete(&record_key(identity))
    }

    /// Current record, for inspection
    pub fn record(&self, identity: &str) -> Result<RateLimitRecord> {
        self.load(identity)
    }

    /// Delete records with no active block and no recent failures
    ///
    /// Returns the number of records removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.unix_now();
        let window = self.limits.window.as_secs() as i64;
        let mut removed = 0;

        for (key, value) in self.store.scan_prefix(RATE_LIMIT_PREFIX)? {
            if !decode(Some(&value)).is_expired(now, window) {
                continue;
            }
            // Re-check under the write lock; a failure may have landed since the scan
            let mut deleted = false;
            self.store.update(&key, &mut |current| {
                let Some(raw) = current else {
                    return Ok(None);
                };
                deleted = decode(Some(&raw)).is_expired(now, window);
                Ok((!deleted).then_some(raw))
            })?;
            if deleted {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Purged {} expired rate-limit records", removed);
        }
        Ok(removed)
    }

    fn load(&self, identity: &str) -> Result<RateLimitRecord> {
        Ok(decode(self.store.get(&record_key(identity))?.as_deref()))
    }
}

fn record_key(identity: &str) -> String {
    format!("{RATE_LIMIT_PREFIX}{identity}")
}

fn decode(raw: Option<&str>) -> RateLimitRecord {
    raw.and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_default()
}

/// Identity used for rate limiting
///
/// The forwarded-for header is believed only when the direct peer is a
/// trusted proxy; its leftmost address is the original client. Anything
/// else is keyed on the peer address.
pub fn client_identity(peer: IpAddr, forwarded_for: Option<&str>, trusted: &[IpAddr]) -> String {
    if trusted.contains(&peer) {
        let forwarded = forwarded_for
            .and_then(|header| header.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(client) = forwarded {
            return client.to_string();
        }
    }
    peer.to_string()
}

/// Compare a presented secret without leaking where it differs
pub fn verify_secret(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    if provided.len() != expected.len() {
        // Keep timing independent of whether the lengths matched
        let _ = expected.ct_eq(expected);
        return false;
    }
    provided.ct_eq(expected).into()
}
