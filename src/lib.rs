//! Multi-host reachability monitoring.
//!
//! [`MonitorEngine`] probes every registered host on a fixed cadence through a
//! [`ProbeExecutor`], keeps a rolling window of results per host and classifies
//! each host as up, down or flapping. Display layers read immutable
//! [`EngineSnapshot`]s and never touch live state.

pub mod aggregator;
pub mod config;
pub mod dns_cache;
pub mod engine;
pub mod error;
pub mod ping;
pub mod ping_executor;
pub mod probe;
pub mod scheduler;
pub mod snapshot;
pub mod state;
pub mod stats;

pub use config::{AppConfig, ScheduleConfig};
pub use engine::MonitorEngine;
pub use error::EngineError;
pub use ping::{ProbeOutcome, Sample};
pub use ping_executor::IcmpExecutor;
pub use probe::{ProbeError, ProbeExecutor};
pub use snapshot::{EngineSnapshot, HostSnapshot};
pub use state::HostState;
pub use stats::{HostStats, RttSummary, WindowMetrics, WindowSettings};
