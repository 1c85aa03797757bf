use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ping::ProbeOutcome;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid target: {0:?}")]
    InvalidTarget(String),

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("ping failed: {0}")]
    Ping(#[from] surge_ping::SurgeError),
}

/// Performs one reachability check against one host.
///
/// Implementations should give up once `timeout` has elapsed; the engine
/// also cuts them off shortly after it, and drops any probe still running
/// when monitoring stops. Errors are recorded as failed samples.
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    async fn probe(&self, host: &str, timeout: Duration) -> Result<ProbeOutcome, ProbeError>;
}
