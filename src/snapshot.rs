use std::fmt;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::ping::Sample;
use crate::state::HostState;
use crate::stats::{HostStats, WindowMetrics};

/// Point-in-time copy of one host, safe to hand to any display layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostSnapshot {
    pub host: String,
    /// `None` until the first probe result arrives.
    pub state: Option<HostState>,
    pub last_rtt_ms: Option<f64>,
    pub last_change: Option<DateTime<Local>>,
    pub last_error: Option<String>,
    pub metrics: WindowMetrics,
    /// Oldest first.
    pub samples: Vec<Sample>,
}

impl HostSnapshot {
    pub fn new(host: &str, stats: &HostStats) -> Self {
        Self {
            host: host.to_string(),
            state: stats.state(),
            last_rtt_ms: stats.last_rtt_ms(),
            last_change: stats.last_change(),
            last_error: stats.last_error().map(str::to_string),
            metrics: *stats.metrics(),
            samples: stats.samples().cloned().collect(),
        }
    }
}

struct Ms(Option<f64>);

impl fmt::Display for Ms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => write!(f, "{value:.1}"),
            None => write!(f, "-"),
        }
    }
}

impl fmt::Display for HostSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.map_or_else(|| "-".to_string(), |s| s.to_string());
        let rtt = self.metrics.rtt;
        write!(
            f,
            "{}  Status: {}  Last: {} ms  Loss: {:.1}%  Uptime: {:.1}%  Min/Avg/Max: {} / {} / {} ms  Jitter: {} ms",
            self.host,
            state,
            Ms(self.last_rtt_ms),
            self.metrics.loss_pct,
            self.metrics.uptime_pct,
            Ms(rtt.map(|r| r.min)),
            Ms(rtt.map(|r| r.avg)),
            Ms(rtt.map(|r| r.max)),
            Ms(self.metrics.jitter_ms),
        )?;
        if let Some(changed) = self.last_change {
            write!(f, "  Changed: {}", changed.format("%Y-%m-%d %H:%M:%S"))?;
        }
        Ok(())
    }
}

/// All hosts in registration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub running: bool,
    pub hosts: Vec<HostSnapshot>,
}

impl EngineSnapshot {
    pub fn host(&self, host: &str) -> Option<&HostSnapshot> {
        self.hosts.iter().find(|h| h.host == host)
    }
}
