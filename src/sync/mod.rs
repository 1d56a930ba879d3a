// src/sync/mod.rs

//! Update orchestration
//!
//! [`Orchestrator`] decides whether a sync cycle is needed and runs it:
//!
//! 1. skip if another cycle holds the update lock
//! 2. skip if the check interval has not elapsed
//! 3. ask the version oracle for the latest version
//! 4. skip if it matches the version the live artifact came from
//! 5. take the lock, download, validate, and atomically replace
//!
//! A missing artifact bypasses steps 2 to 4. Failures never escape as
//! panics or errors; they come back as [`SyncOutcome::Failed`] with the
//! live artifact and the recorded version untouched.

mod replace;

pub use replace::{backup_path, stage_and_swap};

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::lock::{FileLockProvider, LockProvider, UPDATE_LOCK_TOKEN};
use crate::remote::{ArtifactFetcher, GithubOracle, HttpSettings, MirrorDownloader, VersionOracle};
use crate::state::{short_version, StateStore, SyncState};
use crate::store::{KvStore, SqliteStore};
use crate::validate::{IntegrityValidator, ValidationRules};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Why a cycle did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The check interval has not elapsed
    NotDue,
    /// Another cycle holds the update lock
    LockHeld,
    /// The live artifact already matches the remote version
    AlreadyCurrent,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotDue => write!(f, "check not due yet"),
            SkipReason::LockHeld => write!(f, "another update is in progress"),
            SkipReason::AlreadyCurrent => write!(f, "artifact is already current"),
        }
    }
}

/// Result of one evaluation or forced sync
#[derive(Debug)]
pub enum SyncOutcome {
    NoAction(SkipReason),
    Updated {
        /// Version recorded for the new artifact, if the oracle answered
        version: Option<String>,
        size: u64,
    },
    Failed(Error),
}

impl SyncOutcome {
    pub fn is_updated(&self) -> bool {
        matches!(self, SyncOutcome::Updated { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SyncOutcome::Failed(_))
    }

    /// Short human-readable summary
    pub fn message(&self) -> String {
        match self {
            SyncOutcome::NoAction(reason) => format!("no update needed: {reason}"),
            SyncOutcome::Updated { version, size } => match version {
                Some(v) => format!("updated to {} ({} bytes)", short_version(v), size),
                None => format!("updated ({size} bytes)"),
            },
            SyncOutcome::Failed(e) => format!("update failed: {e}"),
        }
    }
}

/// Snapshot of the artifact and sync bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub artifact_exists: bool,
    pub artifact_size: u64,
    /// Unix seconds of the artifact's last modification
    pub artifact_modified: Option<i64>,
    pub last_check: i64,
    pub last_update: i64,
    /// Unix seconds at which the next check becomes due
    pub next_check: i64,
    pub current_version: String,
    pub current_version_short: String,
    pub is_updating: bool,
}

/// Paths and timings the orchestrator works with
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub artifact_path: PathBuf,
    pub mirrors: Vec<String>,
    pub check_interval: Duration,
    pub lock_timeout: Duration,
}

/// Collaborators behind the orchestrator's seams
pub struct SyncBackends {
    pub store: Arc<dyn KvStore>,
    pub locks: Arc<dyn LockProvider>,
    pub oracle: Arc<dyn VersionOracle>,
    pub fetcher: Arc<dyn ArtifactFetcher>,
    pub clock: Arc<dyn Clock>,
}

/// Decides when to sync and performs the download-validate-replace cycle
pub struct Orchestrator {
    settings: SyncSettings,
    states: StateStore,
    locks: Arc<dyn LockProvider>,
    oracle: Arc<dyn VersionOracle>,
    fetcher: Arc<dyn ArtifactFetcher>,
    clock: Arc<dyn Clock>,
    validator: IntegrityValidator,
}

impl Orchestrator {
    pub fn new(settings: SyncSettings, backends: SyncBackends, validator: IntegrityValidator) -> Self {
        let states = StateStore::new(backends.store, settings.check_interval.as_secs());
        Self {
            settings,
            states,
            locks: backends.locks,
            oracle: backends.oracle,
            fetcher: backends.fetcher,
            clock: backends.clock,
            validator,
        }
    }

    /// Production wiring: SQLite state, file locks, HTTP oracle and mirrors
    ///
    /// Returns the state store too so other components (the abuse guard)
    /// can share it.
    pub fn from_config(config: &SyncConfig) -> anyhow::Result<(Self, Arc<dyn KvStore>)> {
        let store: Arc<dyn KvStore> = Arc::new(SqliteStore::open(&config.sync.state_db)?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let oracle_http = HttpSettings {
            user_agent: config.remote.user_agent.clone(),
            connect_timeout: config.connect_timeout()?,
            timeout: config.oracle_timeout()?,
            max_redirects: config.remote.max_redirects,
        };
        let download_http = HttpSettings {
            timeout: config.download_timeout()?,
            ..oracle_http.clone()
        };

        let oracle = GithubOracle::new(
            &config.remote.api_base,
            &config.remote.repository,
            &config.remote.branch,
            &config.remote.tracked_path,
            &oracle_http,
        )?;

        let backends = SyncBackends {
            store: store.clone(),
            locks: Arc::new(FileLockProvider::new(&config.sync.lock_dir, clock.clone())),
            oracle: Arc::new(oracle),
            fetcher: Arc::new(MirrorDownloader::new(&download_http)?),
            clock,
        };
        let settings = SyncSettings {
            artifact_path: config.artifact.path.clone(),
            mirrors: config.remote.mirrors.clone(),
            check_interval: config.check_interval()?,
            lock_timeout: config.lock_timeout()?,
        };
        let validator = IntegrityValidator::new(ValidationRules::from(&config.artifact));

        Ok((Self::new(settings, backends, validator), store))
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn validator(&self) -> &IntegrityValidator {
        &self.validator
    }

    /// Current persisted state
    pub fn state(&self) -> Result<SyncState> {
        self.states.load()
    }

    /// Run a cycle if one is needed
    pub fn evaluate_and_sync(&self) -> SyncOutcome {
        let outcome = self.try_evaluate().unwrap_or_else(SyncOutcome::Failed);
        log_outcome("Scheduled check", &outcome);
        outcome
    }

    /// Run a cycle regardless of the check interval
    ///
    /// Still refuses to run while another cycle holds the lock.
    pub fn force_sync(&self) -> SyncOutcome {
        let outcome = self.try_force().unwrap_or_else(SyncOutcome::Failed);
        log_outcome("Forced sync", &outcome);
        outcome
    }

    /// Snapshot for status reporting; never touches the network
    pub fn status(&self) -> Result<SyncStatus> {
        let state = self.states.load()?;
        let (artifact_exists, artifact_size, artifact_modified) =
            match std::fs::metadata(&self.settings.artifact_path) {
                Ok(meta) => {
                    let modified = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64);
                    (true, meta.len(), modified)
                }
                Err(_) => (false, 0, None),
            };

        Ok(SyncStatus {
            artifact_exists,
            artifact_size,
            artifact_modified,
            last_check: state.last_check,
            last_update: state.last_update,
            next_check: state.last_check + self.settings.check_interval.as_secs() as i64,
            current_version_short: state.short_version().to_string(),
            current_version: state.current_version,
            is_updating: self.locks.is_held(UPDATE_LOCK_TOKEN, self.settings.lock_timeout),
        })
    }

    fn try_evaluate(&self) -> Result<SyncOutcome> {
        if !self.artifact_exists() {
            info!(
                "Artifact {} is missing, synchronizing now",
                self.settings.artifact_path.display()
            );
            return self.bootstrap();
        }

        if self.lock_busy()? {
            return Ok(SyncOutcome::NoAction(SkipReason::LockHeld));
        }

        let now = self.clock.unix_now();
        let Some(previous) = self.states.claim_check(now)? else {
            debug!("Check not due yet");
            return Ok(SyncOutcome::NoAction(SkipReason::NotDue));
        };

        let latest = self.oracle.latest_version()?;
        if latest == previous.current_version {
            debug!("Remote version {} unchanged", short_version(&latest));
            return Ok(SyncOutcome::NoAction(SkipReason::AlreadyCurrent));
        }

        info!(
            "Remote version changed: {} -> {}",
            display_version(&previous.current_version),
            short_version(&latest)
        );
        self.run_cycle(Some(latest))
    }

    fn try_force(&self) -> Result<SyncOutcome> {
        if self.lock_busy()? {
            return Ok(SyncOutcome::NoAction(SkipReason::LockHeld));
        }

        let latest = self.oracle.latest_version()?;
        let state = self.states.load()?;
        if latest == state.current_version && self.artifact_exists() {
            let now = self.clock.unix_now();
            self.states.modify(|s| s.last_check = now)?;
            return Ok(SyncOutcome::NoAction(SkipReason::AlreadyCurrent));
        }

        self.run_cycle(Some(latest))
    }

    /// First sync for a missing artifact; the version is best-effort
    fn bootstrap(&self) -> Result<SyncOutcome> {
        if self.lock_busy()? {
            return Ok(SyncOutcome::NoAction(SkipReason::LockHeld));
        }

        let version = match self.oracle.latest_version() {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Version lookup failed, downloading without it: {}", e);
                None
            }
        };
        let now = self.clock.unix_now();
        self.states.modify(|s| s.last_check = now)?;

        self.run_cycle(version)
    }

    /// Lock, download, validate, replace, record
    fn run_cycle(&self, version: Option<String>) -> Result<SyncOutcome> {
        let Some(_held) = self
            .locks
            .try_acquire(UPDATE_LOCK_TOKEN, self.settings.lock_timeout)?
        else {
            return Ok(SyncOutcome::NoAction(SkipReason::LockHeld));
        };

        let fetched = self.fetcher.fetch(&self.settings.mirrors)?;
        debug!("Fetched {} bytes from {}", fetched.bytes.len(), fetched.source_url);

        let report = stage_and_swap(&self.settings.artifact_path, &fetched.bytes, &self.validator)?;

        let now = self.clock.unix_now();
        let recorded = version.clone().unwrap_or_default();
        self.states.modify(|s| {
            s.current_version = recorded.clone();
            s.last_update = now;
            s.last_check = now;
        })?;

        Ok(SyncOutcome::Updated {
            version,
            size: report.size,
        })
    }

    /// True if a live holder has the lock; clears a stale one
    fn lock_busy(&self) -> Result<bool> {
        let timeout = self.settings.lock_timeout;
        if self.locks.is_held(UPDATE_LOCK_TOKEN, timeout) {
            debug!("Update lock is held, skipping");
            return Ok(true);
        }
        self.locks.reclaim_stale(UPDATE_LOCK_TOKEN, timeout)?;
        Ok(false)
    }

    fn artifact_exists(&self) -> bool {
        self.settings.artifact_path.is_file()
    }
}

fn display_version(version: &str) -> &str {
    if version.is_empty() {
        "(unknown)"
    } else {
        short_version(version)
    }
}

fn log_outcome(what: &str, outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::NoAction(reason) => debug!("{}: {}", what, reason),
        SyncOutcome::Updated { .. } => info!("{}: {}", what, outcome.message()),
        SyncOutcome::Failed(e) => warn!("{} failed ({}): {}", what, e.kind(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_messages() {
        let updated = SyncOutcome::Updated {
            version: Some("0123456789abcdef".to_string()),
            size: 2048,
        };
        assert!(updated.is_updated());
        assert_eq!(updated.message(), "updated to 0123456 (2048 bytes)");

        let skipped = SyncOutcome::NoAction(SkipReason::NotDue);
        assert_eq!(skipped.message(), "no update needed: check not due yet");

        let failed = SyncOutcome::Failed(Error::NetworkFailure("timeout".to_string()));
        assert!(failed.is_failed());
        assert!(failed.message().starts_with("update failed"));
    }

    #[test]
    fn test_skip_reason_serializes_snake_case() {
        let json = serde_json::to_string(&SkipReason::AlreadyCurrent).unwrap();
        assert_eq!(json, "\"already_current\"");
    }
}
