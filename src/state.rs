use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ping::Sample;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostState {
    Up,
    Down,
    Flap,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostState::Up => write!(f, "UP"),
            HostState::Down => write!(f, "DOWN"),
            HostState::Flap => write!(f, "FLAP"),
        }
    }
}

impl HostState {
    /// Classifies the newest `flap_window` samples of `recent` (oldest first).
    ///
    /// A uniform run is `Up` or `Down`; any mix is `Flap`, so an ambiguous
    /// window never reads as an optimistic `Up`. With no samples at all the
    /// previous state is kept.
    pub fn classify(recent: &[Sample], flap_window: usize, previous: Option<HostState>) -> Option<HostState> {
        let start = recent.len().saturating_sub(flap_window.max(1));
        let tail = &recent[start..];
        if tail.is_empty() {
            return previous;
        }

        let successes = tail.iter().filter(|s| s.success).count();
        Some(if successes == tail.len() {
            HostState::Up
        } else if successes == 0 {
            HostState::Down
        } else {
            HostState::Flap
        })
    }
}
