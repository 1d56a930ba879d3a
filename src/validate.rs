// src/validate.rs

//! Integrity checks for downloaded candidates
//!
//! A candidate must pass every check before it may replace the live
//! artifact. Checks run in order and stop at the first failure:
//!
//! 1. size at or above the minimum
//! 2. 16-byte SQLite header
//! 3. opens read-only as a database
//! 4. required tables exist
//! 5. required columns exist on the primary table

use crate::config::ArtifactSection;
use crate::error::ValidationError;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use tracing::{debug, warn};

/// Signature at the start of every SQLite 3 database file
pub const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// What a candidate must look like
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRules {
    pub min_size: u64,
    pub required_tables: Vec<String>,
    pub primary_table: String,
    pub required_columns: Vec<String>,
}

impl From<&ArtifactSection> for ValidationRules {
    fn from(section: &ArtifactSection) -> Self {
        Self {
            min_size: section.min_size,
            required_tables: section.required_tables.clone(),
            primary_table: section.primary_table.clone(),
            required_columns: section.required_columns.clone(),
        }
    }
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self::from(&ArtifactSection::default())
    }
}

/// Facts gathered about an accepted candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    pub size: u64,
    pub sha256: String,
}

/// Decides whether a candidate file may become the live artifact
#[derive(Debug, Clone, Default)]
pub struct IntegrityValidator {
    rules: ValidationRules,
}

impl IntegrityValidator {
    pub fn new(rules: ValidationRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    /// Run all checks, reporting which one failed
    pub fn check(&self, path: &Path) -> Result<ValidationReport, ValidationError> {
        let size = std::fs::metadata(path)
            .map_err(|e| ValidationError::Unreadable(e.to_string()))?
            .len();
        if size < self.rules.min_size {
            return Err(ValidationError::TooSmall {
                size,
                min: self.rules.min_size,
            });
        }

        if !has_sqlite_header(path).map_err(|e| ValidationError::Unreadable(e.to_string()))? {
            return Err(ValidationError::BadHeader);
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| ValidationError::Unreadable(e.to_string()))?;

        for table in &self.rules.required_tables {
            if !table_exists(&conn, table)? {
                return Err(ValidationError::MissingTable(table.clone()));
            }
        }

        if !self.rules.required_columns.is_empty() {
            let columns = table_columns(&conn, &self.rules.primary_table)?;
            if columns.is_empty() {
                return Err(ValidationError::MissingTable(self.rules.primary_table.clone()));
            }
            for column in &self.rules.required_columns {
                if !columns.iter().any(|c| c == column) {
                    return Err(ValidationError::MissingColumn {
                        table: self.rules.primary_table.clone(),
                        column: column.clone(),
                    });
                }
            }
        }
        drop(conn);

        let sha256 = sha256_file(path).map_err(|e| ValidationError::Unreadable(e.to_string()))?;
        debug!("Candidate {} passed validation ({} bytes)", path.display(), size);
        Ok(ValidationReport { size, sha256 })
    }

    /// True if the candidate passes every check
    pub fn validate(&self, path: &Path) -> bool {
        match self.check(path) {
            Ok(_) => true,
            Err(e) => {
                warn!("Rejected candidate {}: {}", path.display(), e);
                false
            }
        }
    }
}

fn has_sqlite_header(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut header = [0u8; 16];
    match file.read_exact(&mut header) {
        Ok(()) => Ok(&header == SQLITE_HEADER),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool, ValidationError> {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| ValidationError::Unreadable(e.to_string()))
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, ValidationError> {
    let unreadable = |e: rusqlite::Error| ValidationError::Unreadable(e.to_string());
    // pragma_table_info takes the name as a bound parameter
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1)")
        .map_err(unreadable)?;
    let columns = stmt
        .query_map([table], |row| row.get::<_, String>(0))
        .map_err(unreadable)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(unreadable)?;
    Ok(columns)
}

/// Hex SHA-256 of a file's contents
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
