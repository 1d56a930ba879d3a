// src/state.rs

//! Persisted synchronization state
//!
//! [`SyncState`] records when the remote was last consulted, when the
//! artifact was last replaced, and which remote version it came from.
//! A missing or unreadable record yields zeroed defaults, so a corrupt
//! state file never blocks synchronization.

use crate::error::Result;
use crate::store::KvStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Key under which the sync state is stored
pub const SYNC_STATE_KEY: &str = "sync_state";

/// Durable sync bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Unix seconds of the last remote version check (0 = never)
    #[serde(default)]
    pub last_check: i64,
    /// Unix seconds of the last successful replace (0 = never)
    #[serde(default)]
    pub last_update: i64,
    /// Remote version the live artifact came from (empty = unknown)
    #[serde(default)]
    pub current_version: String,
    /// Check interval in effect when the record was written, in seconds
    #[serde(default)]
    pub check_interval: u64,
}

impl SyncState {
    pub fn new(check_interval: u64) -> Self {
        Self {
            last_check: 0,
            last_update: 0,
            current_version: String::new(),
            check_interval,
        }
    }

    /// Whether a check is due at `now`; a state never checked always is
    pub fn check_due(&self, now: i64, interval_secs: u64) -> bool {
        self.last_check == 0 || now.saturating_sub(self.last_check) >= interval_secs as i64
    }

    /// First seven characters of the version identifier
    pub fn short_version(&self) -> &str {
        short_version(&self.current_version)
    }
}

/// First seven characters of a version identifier
pub fn short_version(version: &str) -> &str {
    match version.char_indices().nth(7) {
        Some((idx, _)) => &version[..idx],
        None => version,
    }
}

/// Reads and writes [`SyncState`] through a [`KvStore`]
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn KvStore>,
    check_interval: u64,
}

impl StateStore {
    pub fn new(store: Arc<dyn KvStore>, check_interval: u64) -> Self {
        Self {
            store,
            check_interval,
        }
    }

    /// Current state, or defaults if absent or unreadable
    pub fn load(&self) -> Result<SyncState> {
        Ok(self.decode(self.store.get(SYNC_STATE_KEY)?))
    }

    /// Replace the stored state
    pub fn save(&self, state: &SyncState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        self.store.put(SYNC_STATE_KEY, &json)
    }

    /// Atomically modify the stored state
    pub fn modify<F>(&self, mut f: F) -> Result<SyncState>
    where
        F: FnMut(&mut SyncState),
    {
        let mut result = SyncState::new(self.check_interval);
        self.store.update(SYNC_STATE_KEY, &mut |current| {
            let mut state = self.decode(current);
            f(&mut state);
            result = state.clone();
            Ok(Some(serde_json::to_string_pretty(&state)?))
        })?;
        Ok(result)
    }

    /// Record a check at `now` if one is due
    ///
    /// Returns the state as it was before the claim, or `None` when the
    /// interval has not elapsed. Concurrent callers cannot both claim the
    /// same slot.
    pub fn claim_check(&self, now: i64) -> Result<Option<SyncState>> {
        let mut claimed = None;
        self.store.update(SYNC_STATE_KEY, &mut |current| {
            let mut state = self.decode(current);
            if !state.check_due(now, self.check_interval) {
                claimed = None;
                return Ok(Some(serde_json::to_string_pretty(&state)?));
            }
            claimed = Some(state.clone());
            state.last_check = now;
            Ok(Some(serde_json::to_string_pretty(&state)?))
        })?;
        Ok(claimed)
    }

    fn decode(&self, raw: Option<String>) -> SyncState {
        let mut state = match raw {
            None => SyncState::new(self.check_interval),
            Some(json) => match serde_json::from_str::<SyncState>(&json) {
                Ok(state) => state,
                Err(e) => {
                    warn!("Discarding unreadable sync state: {}", e);
                    SyncState::new(self.check_interval)
                }
            },
        };
        state.check_interval = self.check_interval;
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn state_store() -> (Arc<MemoryStore>, StateStore) {
        let kv = Arc::new(MemoryStore::new());
        let states = StateStore::new(kv.clone(), 3600);
        (kv, states)
    }

    #[test]
    fn test_defaults_when_absent() {
        let (_kv, states) = state_store();
        let state = states.load().unwrap();
        assert_eq!(state, SyncState::new(3600));
    }

    #[test]
    fn test_defaults_when_corrupt() {
        let (kv, states) = state_store();
        kv.put(SYNC_STATE_KEY, "{not json").unwrap();
        assert_eq!(states.load().unwrap(), SyncState::new(3600));
    }

    #[test]
    fn test_save_and_modify() {
        let (_kv, states) = state_store();
        let mut state = states.load().unwrap();
        state.current_version = "abc1234def".to_string();
        states.save(&state).unwrap();

        let updated = states.modify(|s| s.last_check = 42).unwrap();
        assert_eq!(updated.last_check, 42);
        assert_eq!(updated.current_version, "abc1234def");
        assert_eq!(states.load().unwrap(), updated);
    }

    #[test]
    fn test_claim_check_once_per_interval() {
        let (_kv, states) = state_store();

        let first = states.claim_check(10_000).unwrap();
        assert_eq!(first.unwrap().last_check, 0);
        assert_eq!(states.load().unwrap().last_check, 10_000);

        // Same slot cannot be claimed twice
        assert!(states.claim_check(10_001).unwrap().is_none());
        assert_eq!(states.load().unwrap().last_check, 10_000);

        assert!(states.claim_check(10_000 + 3600).unwrap().is_some());
    }

    #[test]
    fn test_check_due() {
        let mut state = SyncState::new(3600);
        assert!(state.check_due(100, 3600));

        state.last_check = 1_000;
        assert!(!state.check_due(1_000 + 3599, 3600));
        assert!(state.check_due(1_000 + 3600, 3600));
    }

    #[test]
    fn test_short_version() {
        assert_eq!(short_version("0123456789abcdef"), "0123456");
        assert_eq!(short_version("abc"), "abc");
        assert_eq!(short_version(""), "");
    }
}
