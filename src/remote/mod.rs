// src/remote/mod.rs

//! Remote collaborators of the sync core
//!
//! - [`VersionOracle`]: latest version identifier of the remote artifact
//! - [`ArtifactFetcher`]: artifact bytes from an ordered mirror list
//!
//! Both are traits so the orchestrator can be driven by fakes in tests;
//! [`GithubOracle`] and [`MirrorDownloader`] are the HTTP implementations.

mod client;
mod mirror;
mod oracle;

pub use client::{build_client, configured_proxy, HttpSettings};
pub use mirror::{ArtifactFetcher, FetchedArtifact, MirrorDownloader};
pub use oracle::{GithubOracle, VersionOracle};
