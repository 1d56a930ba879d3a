// src/sync/replace.rs

//! Staging and atomic replacement of the live artifact
//!
//! Downloaded bytes are written to a temporary file in the artifact's own
//! directory so the final rename never crosses a filesystem. Only a
//! candidate that passed validation is renamed over the live path; readers
//! see either the old file or the new one, never a partial write.

use crate::error::{Error, Result};
use crate::validate::{IntegrityValidator, ValidationReport};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Location of the last-known-good copy kept during a replace
pub fn backup_path(live: &Path) -> PathBuf {
    let mut name = live
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".backup");
    live.with_file_name(name)
}

/// Write `bytes` next to `live`, validate, and swap it in
///
/// On any error the live artifact is untouched and the candidate is
/// removed.
pub fn stage_and_swap(
    live: &Path,
    bytes: &[u8],
    validator: &IntegrityValidator,
) -> Result<ValidationReport> {
    let candidate = stage(live, bytes)?;
    let report = validator.check(candidate.path())?;
    commit(candidate, live)?;
    info!(
        "Replaced {} ({} bytes, sha256 {})",
        live.display(),
        report.size,
        report.sha256
    );
    Ok(report)
}

/// Write the candidate into the artifact's directory
fn stage(live: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let dir = parent_dir(live);
    fs::create_dir_all(dir).map_err(|e| {
        Error::IoError(format!(
            "Failed to create artifact directory {}: {e}",
            dir.display()
        ))
    })?;

    let mut candidate = tempfile::Builder::new()
        .prefix(".candidate-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| Error::IoError(format!("Failed to create candidate file: {e}")))?;

    candidate
        .write_all(bytes)
        .and_then(|()| candidate.as_file().sync_all())
        .map_err(|e| Error::IoError(format!("Failed to write candidate file: {e}")))?;

    debug!("Staged {} bytes at {}", bytes.len(), candidate.path().display());
    Ok(candidate)
}

/// Rename a validated candidate over the live path
fn commit(candidate: NamedTempFile, live: &Path) -> Result<()> {
    set_readable(&candidate);

    let backup = backup_path(live);
    let backed_up = if live.exists() {
        match fs::copy(live, &backup) {
            Ok(_) => true,
            Err(e) => {
                warn!("Could not back up {}: {}", live.display(), e);
                false
            }
        }
    } else {
        false
    };

    // Dropping the PersistError drops the temp file with it
    candidate.persist(live).map_err(|e| {
        Error::ReplaceFailure(format!(
            "Failed to rename candidate over {}: {}",
            live.display(),
            e.error
        ))
    })?;

    if let Ok(dir) = File::open(parent_dir(live)) {
        // Not every filesystem supports fsync on a directory
        let _ = dir.sync_all();
    }

    if backed_up {
        if let Err(e) = fs::remove_file(&backup) {
            warn!("Could not remove backup {}: {}", backup.display(), e);
        }
    }
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Temp files are created 0600; the artifact is read by other services
#[cfg(unix)]
fn set_readable(candidate: &NamedTempFile) {
    use std::os::unix::fs::PermissionsExt;
    let perms = fs::Permissions::from_mode(0o644);
    if let Err(e) = candidate.as_file().set_permissions(perms) {
        warn!("Could not set candidate permissions: {}", e);
    }
}

#[cfg(not(unix))]
fn set_readable(_candidate: &NamedTempFile) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::ValidationRules;
    use tempfile::TempDir;

    fn lenient() -> IntegrityValidator {
        IntegrityValidator::new(ValidationRules {
            min_size: 0,
            required_tables: Vec::new(),
            primary_table: String::new(),
            required_columns: Vec::new(),
        })
    }

    fn sqlite_bytes(dir: &Path) -> Vec<u8> {
        let path = dir.join("source.db");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        drop(conn);
        fs::read(&path).unwrap()
    }

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(".candidate-") || n.ends_with(".backup"))
            .collect()
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/srv/data/cards.cdb")),
            PathBuf::from("/srv/data/cards.cdb.backup")
        );
    }

    #[test]
    fn test_swap_replaces_live_file() {
        let temp_dir = TempDir::new().unwrap();
        let bytes = sqlite_bytes(temp_dir.path());
        let live = temp_dir.path().join("live/cards.cdb");
        fs::create_dir_all(live.parent().unwrap()).unwrap();
        fs::write(&live, b"old contents").unwrap();

        let report = stage_and_swap(&live, &bytes, &lenient()).unwrap();

        assert_eq!(fs::read(&live).unwrap(), bytes);
        assert_eq!(report.size, bytes.len() as u64);
        assert!(leftovers(live.parent().unwrap()).is_empty());
    }

    #[test]
    fn test_swap_creates_missing_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let bytes = sqlite_bytes(temp_dir.path());
        let live = temp_dir.path().join("fresh/cards.cdb");

        stage_and_swap(&live, &bytes, &lenient()).unwrap();
        assert_eq!(fs::read(&live).unwrap(), bytes);
    }

    #[test]
    fn test_invalid_candidate_leaves_live_file() {
        let temp_dir = TempDir::new().unwrap();
        let live = temp_dir.path().join("cards.cdb");
        fs::write(&live, b"old contents").unwrap();

        let err = stage_and_swap(&live, b"<html>not found</html>", &lenient()).unwrap_err();

        assert_eq!(err.kind(), "validation_failure");
        assert_eq!(fs::read(&live).unwrap(), b"old contents");
        assert!(leftovers(temp_dir.path()).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_replaced_file_is_world_readable() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let bytes = sqlite_bytes(temp_dir.path());
        let live = temp_dir.path().join("cards.cdb");

        stage_and_swap(&live, &bytes, &lenient()).unwrap();
        let mode = fs::metadata(&live).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }
}
