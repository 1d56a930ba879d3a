// src/lock.rs

//! Exclusive, non-blocking update lock
//!
//! At most one download-validate-replace cycle runs at a time. The lock is
//! a named marker file held with `flock(LOCK_EX | LOCK_NB)`; the marker's
//! presence is what status reporting sees as "update in progress".
//!
//! # Staleness
//!
//! A marker older than the staleness timeout belongs to a holder that
//! crashed or hung. It is deleted and the lock is taken over. The timeout
//! is measured against the injected [`Clock`], so it is independent of
//! any single request's lifetime. New markers are stamped with the clock's
//! time as their mtime.
//!
//! Each marker carries a unique stamp. A holder only ever unlinks the
//! marker bearing its own stamp, so a holder whose lock was reclaimed
//! cannot release its successor's lock on the way out.
//!
//! # Example
//!
//! ```ignore
//! let locks = FileLockProvider::new("/var/lib/catalog", clock);
//! if let Some(_held) = locks.try_acquire("update", Duration::from_secs(300))? {
//!     // ... fetch, validate, replace ...
//! } // released here, on every exit path
//! ```

use crate::clock::Clock;
use crate::error::{Error, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Well-known token for the artifact update lock
pub const UPDATE_LOCK_TOKEN: &str = "update";

/// A held lock; dropping it releases the lock
pub trait HeldLock: Send {
    fn token(&self) -> &str;
}

/// Capability to take a named exclusive lock without waiting
pub trait LockProvider: Send + Sync {
    /// Take the lock if it is free or stale
    ///
    /// Returns:
    /// - `Ok(Some(guard))` if the lock was acquired
    /// - `Ok(None)` if another holder has it
    /// - `Err` on I/O errors
    fn try_acquire(&self, token: &str, stale_after: Duration) -> Result<Option<Box<dyn HeldLock>>>;

    /// Whether a live (non-stale) holder exists
    fn is_held(&self, token: &str, stale_after: Duration) -> bool;

    /// Delete the marker if it is stale; returns true if one was removed
    fn reclaim_stale(&self, token: &str, stale_after: Duration) -> Result<bool>;
}

/// Lock markers as files in a directory
pub struct FileLockProvider {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FileLockProvider {
    pub fn new<P: AsRef<Path>>(dir: P, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            clock,
        }
    }

    /// Marker path for a token
    pub fn marker_path(&self, token: &str) -> PathBuf {
        self.dir.join(format!("{token}.lock"))
    }

    /// Age of the marker according to the injected clock, if it exists
    fn marker_age(&self, path: &Path) -> Option<Duration> {
        let modified = fs::metadata(path).ok()?.modified().ok()?;
        let modified_secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs() as i64;
        let age = self.clock.unix_now().saturating_sub(modified_secs);
        Some(Duration::from_secs(age.max(0) as u64))
    }

    /// Unique name to move a stale marker aside before deleting it
    fn aside_path(&self, token: &str) -> PathBuf {
        self.dir.join(format!("{token}.lock.stale-{:016x}", rand::random::<u64>()))
    }
}

/// Whether the marker at `path` still carries `stamp`
fn marker_has_stamp(path: &Path, stamp: &str) -> bool {
    fs::read_to_string(path).is_ok_and(|content| content == stamp)
}

impl LockProvider for FileLockProvider {
    fn try_acquire(&self, token: &str, stale_after: Duration) -> Result<Option<Box<dyn HeldLock>>> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::IoError(format!(
                "Failed to create lock directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let path = self.marker_path(token);

        if path.exists() && !self.reclaim_stale(token, stale_after)? {
            debug!("Lock '{}' is held, skipping", token);
            return Ok(None);
        }

        // create_new makes the marker itself the tiebreaker between racers
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Lock '{}' was taken concurrently", token);
                return Ok(None);
            }
            Err(e) => {
                return Err(Error::IoError(format!(
                    "Failed to create lock marker {}: {e}",
                    path.display()
                )));
            }
        };

        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("Lock '{}' is held by another process", token);
                return Ok(None);
            }
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(Error::IoError(format!(
                    "Failed to try-acquire lock '{}': {e}",
                    token
                )));
            }
        }

        // pid and time for operators, nonce for ownership checks on release
        let stamp = format!(
            "{} {} {:016x}\n",
            std::process::id(),
            self.clock.unix_now(),
            rand::random::<u64>()
        );
        if let Err(e) = file.write_all(stamp.as_bytes()) {
            let _ = fs::remove_file(&path);
            return Err(Error::IoError(format!(
                "Failed to write lock marker {}: {e}",
                path.display()
            )));
        }
        if let Err(e) = file.set_modified(SystemTime::from(self.clock.now())) {
            debug!("Could not stamp lock marker mtime: {}", e);
        }

        info!("Acquired lock '{}' at {}", token, path.display());
        Ok(Some(Box::new(FileLock {
            file,
            path,
            token: token.to_string(),
            stamp,
        })))
    }

    fn is_held(&self, token: &str, stale_after: Duration) -> bool {
        let path = self.marker_path(token);
        match self.marker_age(&path) {
            Some(age) => age <= stale_after,
            None => false,
        }
    }

    fn reclaim_stale(&self, token: &str, stale_after: Duration) -> Result<bool> {
        let path = self.marker_path(token);
        match self.marker_age(&path) {
            Some(age) if age > stale_after => {
                warn!(
                    "Removing stale lock '{}' ({}s old, limit {}s)",
                    token,
                    age.as_secs(),
                    stale_after.as_secs()
                );

                // Rename first: a fresh marker created after the age check must survive
                let aside = self.aside_path(token);
                match fs::rename(&path, &aside) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
                    Err(e) => {
                        return Err(Error::IoError(format!(
                            "Failed to move stale lock {}: {e}",
                            path.display()
                        )));
                    }
                }

                let still_stale = self.marker_age(&aside).is_none_or(|age| age > stale_after);
                if !still_stale {
                    debug!("Lock '{}' was renewed during reclaim, restoring it", token);
                    if let Err(e) = fs::hard_link(&aside, &path) {
                        warn!("Failed to restore lock '{}': {}", token, e);
                    }
                    let _ = fs::remove_file(&aside);
                    return Ok(false);
                }

                match fs::remove_file(&aside) {
                    Ok(()) => Ok(true),
                    Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
                    Err(e) => Err(Error::IoError(format!(
                        "Failed to remove stale lock {}: {e}",
                        aside.display()
                    ))),
                }
            }
            Some(_) => Ok(false),
            None => Ok(true),
        }
    }
}

/// Held file lock; the marker is removed on drop
struct FileLock {
    file: File,
    path: PathBuf,
    token: String,
    stamp: String,
}

impl HeldLock for FileLock {
    fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Unlink before unlocking so no one can lock a marker that is going away
        if marker_has_stamp(&self.path, &self.stamp) {
            let _ = fs::remove_file(&self.path);
        } else {
            warn!("Lock '{}' was reclaimed while held, leaving the new marker", self.token);
        }
        let _ = self.file.unlock();
        info!("Released lock '{}'", self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use filetime::FileTime;
    use tempfile::TempDir;

    const STALE: Duration = Duration::from_secs(300);

    fn provider(dir: &TempDir) -> FileLockProvider {
        FileLockProvider::new(dir.path(), Arc::new(SystemClock))
    }

    #[test]
    fn test_try_acquire_success() {
        let temp_dir = TempDir::new().unwrap();
        let locks = provider(&temp_dir);

        let held = locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap();
        assert!(held.is_some());
        assert_eq!(held.as_ref().unwrap().token(), UPDATE_LOCK_TOKEN);
        assert!(locks.marker_path(UPDATE_LOCK_TOKEN).exists());
        assert!(locks.is_held(UPDATE_LOCK_TOKEN, STALE));
    }

    #[test]
    fn test_try_acquire_fails_when_held() {
        let temp_dir = TempDir::new().unwrap();
        let locks = provider(&temp_dir);

        let _first = locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap().unwrap();
        let second = locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn test_release_on_drop() {
        let temp_dir = TempDir::new().unwrap();
        let locks = provider(&temp_dir);

        let held = locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap().unwrap();
        drop(held);

        assert!(!locks.marker_path(UPDATE_LOCK_TOKEN).exists());
        assert!(!locks.is_held(UPDATE_LOCK_TOKEN, STALE));
        assert!(locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap().is_some());
    }

    #[test]
    fn test_stale_marker_is_reclaimed() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let locks = FileLockProvider::new(temp_dir.path(), clock.clone());

        // Marker left behind by a crashed holder
        let marker = locks.marker_path(UPDATE_LOCK_TOKEN);
        fs::write(&marker, "12345 0").unwrap();
        assert!(locks.is_held(UPDATE_LOCK_TOKEN, STALE));
        assert!(locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap().is_none());

        let ten_minutes_ago = FileTime::from_unix_time(clock.unix_now() - 600, 0);
        filetime::set_file_mtime(&marker, ten_minutes_ago).unwrap();

        assert!(!locks.is_held(UPDATE_LOCK_TOKEN, STALE));
        let held = locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap();
        assert!(held.is_some());

        // The abandoned marker is gone, not parked under another name
        let names: Vec<String> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![format!("{UPDATE_LOCK_TOKEN}.lock")]);
    }

    #[test]
    fn test_reclaimed_holder_keeps_successor_lock() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let locks = FileLockProvider::new(temp_dir.path(), clock.clone());

        let overdue = locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap().unwrap();
        clock.advance(STALE + Duration::from_secs(1));

        let successor = locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap();
        assert!(successor.is_some());

        // The overdue holder finishing must not free the successor's lock
        drop(overdue);
        assert!(locks.marker_path(UPDATE_LOCK_TOKEN).exists());
        assert!(locks.is_held(UPDATE_LOCK_TOKEN, STALE));
        assert!(locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap().is_none());

        drop(successor);
        assert!(!locks.marker_path(UPDATE_LOCK_TOKEN).exists());
        assert!(locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap().is_some());
    }

    #[test]
    fn test_marker_mtime_follows_clock() {
        let temp_dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let locks = FileLockProvider::new(temp_dir.path(), clock.clone());

        let _held = locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap().unwrap();
        assert!(locks.is_held(UPDATE_LOCK_TOKEN, STALE));

        clock.advance(STALE + Duration::from_secs(1));
        assert!(!locks.is_held(UPDATE_LOCK_TOKEN, STALE));
    }

    #[test]
    fn test_reclaim_stale_leaves_fresh_marker() {
        let temp_dir = TempDir::new().unwrap();
        let locks = provider(&temp_dir);

        let _held = locks.try_acquire(UPDATE_LOCK_TOKEN, STALE).unwrap().unwrap();
        assert!(!locks.reclaim_stale(UPDATE_LOCK_TOKEN, STALE).unwrap());
        assert!(locks.marker_path(UPDATE_LOCK_TOKEN).exists());
    }

    #[test]
    fn test_creates_lock_dir() {
        let temp_dir = TempDir::new().unwrap();
        let locks = FileLockProvider::new(temp_dir.path().join("deep/dir"), Arc::new(SystemClock));

        assert!(locks.try_acquire("other", STALE).unwrap().is_some());
    }
}
