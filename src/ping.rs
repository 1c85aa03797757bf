use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// What a probe executor reports for one reachability check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    pub success: bool,
    pub rtt_ms: Option<f64>,
    pub timed_out: bool,
}

impl ProbeOutcome {
    pub fn success(rtt_ms: f64) -> Self {
        Self {
            success: true,
            rtt_ms: Some(rtt_ms),
            timed_out: false,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            rtt_ms: None,
            timed_out: false,
        }
    }

    pub fn timed_out() -> Self {
        Self {
            success: false,
            rtt_ms: None,
            timed_out: true,
        }
    }
}

/// One entry of a host's rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Local>,
    pub success: bool,
    /// Only present on successful samples.
    pub rtt_ms: Option<f64>,
    pub timed_out: bool,
}

impl Sample {
    pub fn new(outcome: ProbeOutcome, timestamp: DateTime<Local>) -> Self {
        Self {
            timestamp,
            success: outcome.success,
            rtt_ms: if outcome.success { outcome.rtt_ms } else { None },
            timed_out: outcome.timed_out,
        }
    }

    /// RTT of a successful sample, filtering out non-finite values an
    /// executor might hand back.
    pub fn success_rtt(&self) -> Option<f64> {
        if self.success {
            self.rtt_ms.filter(|rtt| rtt.is_finite())
        } else {
            None
        }
    }
}
