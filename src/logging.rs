// src/logging.rs

//! Tracing setup with a size-rotated log file
//!
//! Events go to stderr and, when `logging.file` is set, to an append-only
//! file. Before a write, a file that has reached `max_size` is shifted to
//! `<file>.1` (older generations move up by one) and a fresh file is
//! started. At most `keep` rotated generations are retained.

use crate::config::{parse_size, LoggingSection};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `RUST_LOG` overrides `default_level`.
pub fn init(logging: &LoggingSection, default_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match &logging.file {
        Some(path) => {
            let max_bytes = parse_size(&logging.max_size)?;
            let writer = RotatingFileWriter::open(path, max_bytes, logging.keep)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

/// Append-only log file that rotates by size
#[derive(Clone)]
pub struct RotatingFileWriter {
    inner: Arc<Mutex<RotatingFile>>,
}

struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
    file: File,
    size: u64,
}

impl RotatingFileWriter {
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64, keep: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory: {}", parent.display())
                })?;
            }
        }

        let file = open_append(&path)
            .with_context(|| format!("Failed to open log file: {}", path.display()))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            inner: Arc::new(Mutex::new(RotatingFile {
                path,
                max_bytes,
                keep,
                file,
                size,
            })),
        })
    }
}

impl RotatingFile {
    fn rotate(&mut self) -> io::Result<()> {
        if self.keep == 0 {
            self.file = OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.size = 0;
            return Ok(());
        }

        let _ = fs::remove_file(generation(&self.path, self.keep));
        for n in (1..self.keep).rev() {
            let from = generation(&self.path, n);
            if from.exists() {
                fs::rename(&from, generation(&self.path, n + 1))?;
            }
        }
        fs::rename(&self.path, generation(&self.path, 1))?;

        self.file = open_append(&self.path)?;
        self.size = 0;
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.max_bytes > 0 && self.size >= self.max_bytes {
            // A failed rotation must not lose the event; keep appending
            if let Err(e) = self.rotate() {
                eprintln!("log rotation failed for {}: {}", self.path.display(), e);
            }
        }
        let written = self.file.write(buf)?;
        self.size += written as u64;
        Ok(written)
    }
}

/// Path of the `n`th rotated generation
pub fn generation(path: &Path, n: usize) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Per-event handle returned by [`RotatingFileWriter`]
pub struct RotatingFileGuard {
    inner: Arc<Mutex<RotatingFile>>,
}

impl Write for RotatingFileGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().file.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingFileGuard {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_line(writer: &RotatingFileWriter, line: &str) {
        let mut guard = writer.make_writer();
        guard.write_all(line.as_bytes()).unwrap();
        guard.flush().unwrap();
    }

    #[test]
    fn test_generation_names() {
        assert_eq!(
            generation(Path::new("/var/log/update.log"), 2),
            PathBuf::from("/var/log/update.log.2")
        );
    }

    #[test]
    fn test_appends_without_rotation_below_limit() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("update.log");
        let writer = RotatingFileWriter::open(&path, 1024, 5).unwrap();

        write_line(&writer, "first\n");
        write_line(&writer, "second\n");

        assert_eq!(fs::read_to_string(&path).unwrap(), "first\nsecond\n");
        assert!(!generation(&path, 1).exists());
    }

    #[test]
    fn test_rotates_past_limit() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("update.log");
        let writer = RotatingFileWriter::open(&path, 10, 5).unwrap();

        write_line(&writer, "0123456789\n");
        write_line(&writer, "next\n");

        assert_eq!(fs::read_to_string(&path).unwrap(), "next\n");
        assert_eq!(fs::read_to_string(generation(&path, 1)).unwrap(), "0123456789\n");
    }

    #[test]
    fn test_keeps_bounded_generations() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("update.log");
        let writer = RotatingFileWriter::open(&path, 1, 2).unwrap();

        for line in ["a\n", "b\n", "c\n", "d\n"] {
            write_line(&writer, line);
        }

        assert_eq!(fs::read_to_string(&path).unwrap(), "d\n");
        assert_eq!(fs::read_to_string(generation(&path, 1)).unwrap(), "c\n");
        assert_eq!(fs::read_to_string(generation(&path, 2)).unwrap(), "b\n");
        assert!(!generation(&path, 3).exists());
    }

    #[test]
    fn test_existing_file_size_counts() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("update.log");
        fs::write(&path, "0123456789").unwrap();

        let writer = RotatingFileWriter::open(&path, 10, 5).unwrap();
        write_line(&writer, "fresh\n");

        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh\n");
        assert_eq!(fs::read_to_string(generation(&path, 1)).unwrap(), "0123456789");
    }
}
