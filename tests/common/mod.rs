// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use catalog_sync::clock::ManualClock;
use catalog_sync::Error;
use catalog_sync::lock::FileLockProvider;
use catalog_sync::remote::{ArtifactFetcher, FetchedArtifact, VersionOracle};
use catalog_sync::store::{KvStore, SqliteStore};
use catalog_sync::sync::{Orchestrator, SyncBackends, SyncSettings};
use catalog_sync::validate::IntegrityValidator;
use catalog_sync::Result;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tempfile::TempDir;

pub const CHECK_INTERVAL: Duration = Duration::from_secs(3600);
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Bytes of a well-formed catalog database whose contents include `tag`.
pub fn catalog_bytes(tag: &str) -> Vec<u8> {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("catalog.cdb");
    write_catalog(&path, tag);
    std::fs::read(&path).unwrap()
}

/// Create a catalog database with the `datas` and `texts` tables.
pub fn write_catalog(path: &Path, tag: &str) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE datas (
            id INTEGER PRIMARY KEY, ot INTEGER, alias INTEGER, setcode INTEGER,
            type INTEGER, atk INTEGER, def INTEGER, level INTEGER,
            race INTEGER, attribute INTEGER, category INTEGER
         );
         CREATE TABLE texts (id INTEGER PRIMARY KEY, name TEXT, desc TEXT);",
    )
    .unwrap();
    for id in 1..=20 {
        conn.execute(
            "INSERT INTO datas (id, ot, alias, setcode, type, atk, def, level, race, attribute, category)
             VALUES (?1, 1, 0, 0, 17, 1800, 1200, 4, 1, 16, 0)",
            [id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO texts (id, name, desc) VALUES (?1, ?2, ?3)",
            rusqlite::params![id, format!("Card {id}"), format!("{tag} card text {id}")],
        )
        .unwrap();
    }
}

/// Version oracle with a scripted answer.
#[derive(Default)]
pub struct FakeOracle {
    answer: Mutex<Option<String>>,
    calls: AtomicUsize,
}

impl FakeOracle {
    pub fn answering(version: &str) -> Self {
        let oracle = Self::default();
        oracle.set_version(version);
        oracle
    }

    pub fn set_version(&self, version: &str) {
        *self.answer.lock() = Some(version.to_string());
    }

    /// Make every query fail as if the remote were unreachable
    pub fn set_unreachable(&self) {
        *self.answer.lock() = None;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl VersionOracle for FakeOracle {
    fn latest_version(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .lock()
            .clone()
            .ok_or_else(|| Error::NetworkFailure("connection refused".to_string()))
    }
}

/// Artifact fetcher serving scripted bytes, optionally pausing its first call.
#[derive(Default)]
pub struct FakeFetcher {
    payload: Mutex<Option<Vec<u8>>>,
    calls: AtomicUsize,
    gate: Mutex<Option<Arc<Barrier>>>,
    gated_once: AtomicBool,
}

impl FakeFetcher {
    pub fn serving(bytes: Vec<u8>) -> Self {
        let fetcher = Self::default();
        fetcher.set_payload(bytes);
        fetcher
    }

    pub fn set_payload(&self, bytes: Vec<u8>) {
        *self.payload.lock() = Some(bytes);
    }

    pub fn set_unreachable(&self) {
        *self.payload.lock() = None;
    }

    /// The first fetch waits on `gate` twice: once on entry, once before returning
    pub fn pause_first_fetch(&self, gate: Arc<Barrier>) {
        *self.gate.lock() = Some(gate);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ArtifactFetcher for FakeFetcher {
    fn fetch(&self, urls: &[String]) -> Result<FetchedArtifact> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            if !self.gated_once.swap(true, Ordering::SeqCst) {
                gate.wait();
                gate.wait();
            }
        }

        match self.payload.lock().clone() {
            Some(bytes) => Ok(FetchedArtifact {
                bytes,
                source_url: urls.first().cloned().unwrap_or_default(),
            }),
            None => Err(Error::NetworkFailure(format!("All {} mirrors failed", urls.len()))),
        }
    }
}

/// A temp directory wired with fakes, a manual clock and a SQLite state store.
pub struct Harness {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub store: Arc<SqliteStore>,
    pub oracle: Arc<FakeOracle>,
    pub fetcher: Arc<FakeFetcher>,
    pub artifact: PathBuf,
}

impl Harness {
    pub fn new(version: &str, payload: Vec<u8>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("state/sync-state.db")).unwrap());
        let artifact = dir.path().join("data/cards.cdb");

        Self {
            // Lock staleness compares file mtimes with the clock, so start at real time
            clock: Arc::new(ManualClock::new(chrono::Utc::now())),
            store,
            oracle: Arc::new(FakeOracle::answering(version)),
            fetcher: Arc::new(FakeFetcher::serving(payload)),
            artifact,
            dir,
        }
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.dir.path().join("locks")
    }

    pub fn locks(&self) -> FileLockProvider {
        FileLockProvider::new(self.lock_dir(), self.clock.clone())
    }

    pub fn kv(&self) -> Arc<dyn KvStore> {
        self.store.clone()
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let settings = SyncSettings {
            artifact_path: self.artifact.clone(),
            mirrors: vec![
                "https://mirror-a.invalid/cards.cdb".to_string(),
                "https://mirror-b.invalid/cards.cdb".to_string(),
            ],
            check_interval: CHECK_INTERVAL,
            lock_timeout: LOCK_TIMEOUT,
        };
        let backends = SyncBackends {
            store: self.kv(),
            locks: Arc::new(self.locks()),
            oracle: self.oracle.clone(),
            fetcher: self.fetcher.clone(),
            clock: self.clock.clone(),
        };
        Orchestrator::new(settings, backends, IntegrityValidator::default())
    }

    pub fn artifact_bytes(&self) -> Vec<u8> {
        std::fs::read(&self.artifact).unwrap()
    }

    /// Names of stray candidate or backup files next to the artifact
    pub fn leftovers(&self) -> Vec<String> {
        let Some(dir) = self.artifact.parent() else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".candidate-") || n.ends_with(".backup"))
            .collect()
    }
}
