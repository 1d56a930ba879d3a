// src/lib.rs

//! catalog-sync
//!
//! Keeps a local SQLite catalog file in sync with a remote, versioned
//! source.
//!
//! # Architecture
//!
//! - Freshness: a version oracle is consulted at most once per check interval
//! - Mirrors: the artifact is fetched from an ordered fallback list
//! - Integrity: candidates are validated before they may go live
//! - Atomicity: a validated candidate replaces the live file with one rename
//! - Exclusion: a non-blocking file lock keeps cycles from overlapping
//! - Manual trigger: a secret-protected endpoint with brute-force blocking

pub mod clock;
pub mod config;
mod error;
pub mod lock;
pub mod logging;
pub mod remote;
pub mod security;
pub mod state;
pub mod store;
pub mod sync;
pub mod validate;

#[cfg(feature = "server")]
pub mod server;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use error::{Error, Result, ValidationError};
pub use lock::{FileLockProvider, HeldLock, LockProvider, UPDATE_LOCK_TOKEN};
pub use remote::{ArtifactFetcher, FetchedArtifact, GithubOracle, MirrorDownloader, VersionOracle};
pub use security::{client_identity, verify_secret, AbuseGuard, AbuseLimits};
pub use state::{StateStore, SyncState};
pub use store::{KvStore, MemoryStore, SqliteStore};
pub use sync::{Orchestrator, SkipReason, SyncBackends, SyncOutcome, SyncSettings, SyncStatus};
pub use validate::{IntegrityValidator, ValidationReport, ValidationRules};
