// src/server/mod.rs
//! Manual-trigger HTTP surface
//!
//! A single authenticated endpoint lets an operator force a sync, run the
//! regular check, or read the status report. Credential failures are
//! counted per client by the [`AbuseGuard`]; repeat offenders are blocked
//! for a while.

mod handlers;
mod routes;

pub use routes::create_router;

use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::Error;
use crate::security::{AbuseGuard, AbuseLimits};
use crate::sync::Orchestrator;
use anyhow::Result;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Shared state for trigger handlers
pub struct TriggerState {
    pub orchestrator: Arc<Orchestrator>,
    pub guard: Arc<AbuseGuard>,
    /// The trigger secret, or the reason the trigger must stay closed
    pub secret: std::result::Result<String, Error>,
    pub trusted_proxies: Vec<IpAddr>,
}

pub type SharedState = Arc<TriggerState>;

impl TriggerState {
    /// Wire the trigger from configuration
    ///
    /// Builds blocking HTTP clients, so call it outside the async runtime.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let (orchestrator, store) = Orchestrator::from_config(config)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let limits = AbuseLimits {
            max_attempts: config.trigger.max_attempts,
            window: config.attempt_window()?,
            block_duration: config.block_duration()?,
        };

        let secret = config.secret_key().map(str::to_string);
        if let Err(e) = &secret {
            tracing::error!("Manual trigger disabled: {}", e);
        }

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            guard: Arc::new(AbuseGuard::new(store, clock, limits)),
            secret,
            trusted_proxies: config.trusted_proxies(),
        })
    }
}

/// Serve the trigger until the listener fails
pub async fn run_server(state: SharedState, bind_addr: SocketAddr) -> Result<()> {
    tracing::info!("Starting manual trigger on {}", bind_addr);
    if !state.trusted_proxies.is_empty() {
        tracing::info!("Trusted proxies: {:?}", state.trusted_proxies);
    }

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!("Trigger is ready");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
