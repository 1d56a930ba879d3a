// src/remote/mirror.rs

//! Ordered-fallback artifact download
//!
//! Mirrors are tried strictly in order. The first one answering with a
//! success status and a non-empty body wins; there is no racing and no
//! merging of partial bodies. Every failure is logged and the next mirror
//! is tried.

use super::client::{build_client, HttpSettings};
use crate::error::{Error, Result};
use reqwest::blocking::Client;
use tracing::{info, warn};

/// Bytes fetched from a mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArtifact {
    pub bytes: Vec<u8>,
    pub source_url: String,
}

/// Fetches the artifact from an ordered list of sources
pub trait ArtifactFetcher: Send + Sync {
    fn fetch(&self, urls: &[String]) -> Result<FetchedArtifact>;
}

/// HTTP mirror downloader
pub struct MirrorDownloader {
    client: Client,
}

impl MirrorDownloader {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        Ok(Self {
            client: build_client(settings)?,
        })
    }

    /// One attempt against one mirror
    fn fetch_one(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::NetworkFailure(format!("Failed to fetch {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::NetworkFailure(format!(
                "HTTP {} from {}",
                response.status(),
                url
            )));
        }

        let bytes = response
            .bytes()
            .map_err(|e| Error::NetworkFailure(format!("Failed to read response from {}: {}", url, e)))?;

        if bytes.is_empty() {
            return Err(Error::NetworkFailure(format!("Empty body from {}", url)));
        }

        Ok(bytes.to_vec())
    }
}

impl ArtifactFetcher for MirrorDownloader {
    fn fetch(&self, urls: &[String]) -> Result<FetchedArtifact> {
        for url in urls {
            info!(url = %url, "Trying mirror");
            match self.fetch_one(url) {
                Ok(bytes) => {
                    info!(url = %url, size = bytes.len(), "Downloaded artifact");
                    return Ok(FetchedArtifact {
                        bytes,
                        source_url: url.clone(),
                    });
                }
                Err(e) => {
                    warn!(url = %url, "Mirror failed, trying next: {}", e);
                }
            }
        }

        Err(Error::NetworkFailure(format!(
            "All {} mirrors failed",
            urls.len()
        )))
    }
}
