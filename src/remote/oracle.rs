// src/remote/oracle.rs

//! Latest-version lookup
//!
//! The remote history endpoint returns the most recent change records for
//! the tracked path; the identifier of the first record is the latest
//! version. Anything other than a well-formed, non-empty answer is a
//! network failure.

use super::client::{build_client, HttpSettings};
use crate::error::{Error, Result};
use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::debug;

/// Reports the latest version identifier of the remote artifact
pub trait VersionOracle: Send + Sync {
    fn latest_version(&self) -> Result<String>;
}

/// One entry of the commit history response
#[derive(Debug, Deserialize)]
struct CommitRecord {
    sha: Option<String>,
}

/// Version oracle backed by a GitHub-style commits API
pub struct GithubOracle {
    client: Client,
    endpoint: String,
}

impl GithubOracle {
    /// Oracle for `repository` (`owner/name`) on `branch`, tracking `path`
    pub fn new(
        api_base: &str,
        repository: &str,
        branch: &str,
        path: &str,
        settings: &HttpSettings,
    ) -> Result<Self> {
        let mut endpoint = url::Url::parse(api_base)
            .map_err(|e| Error::InitError(format!("Invalid API base {}: {}", api_base, e)))?;
        endpoint
            .path_segments_mut()
            .map_err(|_| Error::InitError(format!("API base cannot be a base URL: {}", api_base)))?
            .pop_if_empty()
            .push("repos")
            .extend(repository.split('/'))
            .push("commits");
        endpoint
            .query_pairs_mut()
            .append_pair("path", path)
            .append_pair("sha", branch)
            .append_pair("page", "1")
            .append_pair("per_page", "1");

        Ok(Self {
            client: build_client(settings)?,
            endpoint: endpoint.to_string(),
        })
    }

    /// Full request URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl VersionOracle for GithubOracle {
    fn latest_version(&self) -> Result<String> {
        debug!("Querying latest version from {}", self.endpoint);

        let response = self
            .client
            .get(&self.endpoint)
            .header(ACCEPT, "application/vnd.github+json")
            .send()
            .map_err(|e| Error::NetworkFailure(format!("Version query failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::NetworkFailure(format!(
                "HTTP {} from {}",
                response.status(),
                self.endpoint
            )));
        }

        let records: Vec<CommitRecord> = response
            .json()
            .map_err(|e| Error::NetworkFailure(format!("Malformed version response: {}", e)))?;

        records
            .into_iter()
            .next()
            .and_then(|r| r.sha)
            .filter(|sha| !sha.is_empty())
            .ok_or_else(|| Error::NetworkFailure("Version response has no entries".to_string()))
    }
}
