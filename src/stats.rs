use std::collections::VecDeque;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::ping::Sample;
use crate::state::HostState;

pub const DEFAULT_WINDOW: usize = 60;
pub const DEFAULT_FLAP_WINDOW: usize = 5;

/// Sizes of the per-host rolling window and of the flap-detection tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSettings {
    pub window: usize,
    pub flap_window: usize,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            flap_window: DEFAULT_FLAP_WINDOW,
        }
    }
}

impl WindowSettings {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.window == 0 {
            return Err(EngineError::InvalidConfig("window must be at least 1".into()));
        }
        if self.flap_window == 0 {
            return Err(EngineError::InvalidConfig("flap window must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RttSummary {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

/// Figures derived from the current window.
///
/// Loss and uptime always sum to 100 for a non-empty window; both are 0 for
/// an empty one. RTT figures only look at successful samples and are `None`
/// until one exists.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WindowMetrics {
    pub total: usize,
    pub successes: usize,
    pub loss_pct: f64,
    pub uptime_pct: f64,
    pub rtt: Option<RttSummary>,
    /// Mean absolute difference between consecutive successful RTTs.
    pub jitter_ms: Option<f64>,
}

impl WindowMetrics {
    pub fn compute<'a>(samples: impl IntoIterator<Item = &'a Sample>) -> Self {
        let mut total = 0usize;
        let mut successes = 0usize;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut rtt_count = 0usize;
        let mut previous_rtt: Option<f64> = None;
        let mut diff_sum = 0.0;
        let mut diff_count = 0usize;

        for sample in samples {
            total += 1;
            if sample.success {
                successes += 1;
            }
            let Some(rtt) = sample.success_rtt() else {
                continue;
            };
            min = min.min(rtt);
            max = max.max(rtt);
            sum += rtt;
            rtt_count += 1;
            if let Some(prev) = previous_rtt {
                diff_sum += (rtt - prev).abs();
                diff_count += 1;
            }
            previous_rtt = Some(rtt);
        }

        if total == 0 {
            return Self::default();
        }

        let uptime_pct = successes as f64 * 100.0 / total as f64;
        Self {
            total,
            successes,
            loss_pct: 100.0 - uptime_pct,
            uptime_pct,
            rtt: (rtt_count > 0).then(|| RttSummary {
                min,
                avg: sum / rtt_count as f64,
                max,
            }),
            jitter_ms: (diff_count > 0).then(|| diff_sum / diff_count as f64),
        }
    }
}

/// Rolling state for one host. Only the aggregator loop mutates it.
#[derive(Debug, Clone)]
pub struct HostStats {
    settings: WindowSettings,
    samples: VecDeque<Sample>,
    last_rtt_ms: Option<f64>,
    last_error: Option<String>,
    state: Option<HostState>,
    last_change: Option<DateTime<Local>>,
    metrics: WindowMetrics,
}

impl HostStats {
    pub fn new(settings: WindowSettings) -> Self {
        Self {
            settings,
            samples: VecDeque::with_capacity(settings.window),
            last_rtt_ms: None,
            last_error: None,
            state: None,
            last_change: None,
            metrics: WindowMetrics::default(),
        }
    }

    /// Appends a sample, evicting the oldest one when the window is full, then
    /// recomputes metrics and state. Returns the previous state when the state
    /// changed.
    pub fn record(&mut self, sample: Sample) -> Option<Option<HostState>> {
        self.record_with_error(sample, None)
    }

    pub fn record_with_error(&mut self, sample: Sample, error: Option<String>) -> Option<Option<HostState>> {
        let at = sample.timestamp;
        if let Some(rtt) = sample.success_rtt() {
            self.last_rtt_ms = Some(rtt);
        }
        if !sample.success {
            self.last_error = error.or_else(|| sample.timed_out.then(|| "timed out".to_string()));
        }

        while self.samples.len() >= self.settings.window.max(1) {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        let metrics = WindowMetrics::compute(&self.samples);
        let state = HostState::classify(self.samples.make_contiguous(), self.settings.flap_window, self.state);

        self.metrics = metrics;
        if state == self.state {
            return None;
        }
        let previous = self.state;
        self.state = state;
        self.last_change = Some(at);
        Some(previous)
    }

    pub fn samples(&self) -> impl ExactSizeIterator<Item = &Sample> {
        self.samples.iter()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.settings.window
    }

    pub fn last_rtt_ms(&self) -> Option<f64> {
        self.last_rtt_ms
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn state(&self) -> Option<HostState> {
        self.state
    }

    pub fn last_change(&self) -> Option<DateTime<Local>> {
        self.last_change
    }

    pub fn metrics(&self) -> &WindowMetrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ping::ProbeOutcome;
    use chrono::{Duration, TimeZone};

    fn at(second: i64) -> DateTime<Local> {
        Local.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(second)
    }

    fn ok(rtt: f64, second: i64) -> Sample {
        Sample::new(ProbeOutcome::success(rtt), at(second))
    }

    fn fail(second: i64) -> Sample {
        Sample::new(ProbeOutcome::failure(), at(second))
    }

    fn stats(window: usize, flap_window: usize) -> HostStats {
        HostStats::new(WindowSettings { window, flap_window })
    }

    #[test]
    fn window_evicts_oldest_first() {
        let mut st = stats(3, 2);
        for i in 0..5 {
            st.record(ok(i as f64, i));
            assert!(st.len() <= 3);
        }
        let rtts: Vec<_> = st.samples().map(|s| s.rtt_ms.unwrap()).collect();
        assert_eq!(rtts, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn loss_and_uptime_are_complements() {
        let mut st = stats(60, 5);
        let pattern = [true, false, false, true, true, true, false];
        for (i, success) in pattern.iter().enumerate() {
            let sample = if *success { ok(20.0, i as i64) } else { fail(i as i64) };
            st.record(sample);
            let m = st.metrics();
            assert!((m.loss_pct + m.uptime_pct - 100.0).abs() < 1e-9);
        }
        let m = st.metrics();
        assert_eq!(m.total, 7);
        assert_eq!(m.successes, 4);
        assert!((m.loss_pct - 300.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn empty_window_reports_zero_and_absent() {
        let st = stats(60, 5);
        let m = st.metrics();
        assert_eq!(m.loss_pct, 0.0);
        assert_eq!(m.uptime_pct, 0.0);
        assert_eq!(m.rtt, None);
        assert_eq!(m.jitter_ms, None);
        assert_eq!(st.state(), None);
    }

    #[test]
    fn rtt_figures_ignore_failures() {
        let mut st = stats(60, 5);
        st.record(fail(0));
        st.record(fail(1));
        assert_eq!(st.metrics().rtt, None);
        assert_eq!(st.metrics().jitter_ms, None);

        st.record(ok(10.0, 2));
        assert_eq!(st.metrics().jitter_ms, None);
        st.record(fail(3));
        st.record(ok(30.0, 4));
        st.record(ok(20.0, 5));

        let rtt = st.metrics().rtt.unwrap();
        assert_eq!(rtt.min, 10.0);
        assert_eq!(rtt.max, 30.0);
        assert_eq!(rtt.avg, 20.0);
        // |30 - 10| and |20 - 30|
        assert_eq!(st.metrics().jitter_ms, Some(15.0));
        assert_eq!(st.last_rtt_ms(), Some(20.0));
    }

    #[test]
    fn last_rtt_survives_failures() {
        let mut st = stats(60, 5);
        st.record(ok(42.0, 0));
        st.record(fail(1));
        assert_eq!(st.last_rtt_ms(), Some(42.0));
    }

    #[test]
    fn last_error_tracks_failures() {
        let mut st = stats(60, 5);
        st.record_with_error(fail(0), Some("resolve failed".into()));
        assert_eq!(st.last_error(), Some("resolve failed"));
        st.record(Sample::new(ProbeOutcome::timed_out(), at(1)));
        assert_eq!(st.last_error(), Some("timed out"));
    }

    #[test]
    fn worked_flap_trace() {
        let mut st = stats(5, 3);
        let mut states = Vec::new();
        let feed = [false, false, false, true, true, true];
        for (i, success) in feed.iter().enumerate() {
            let sample = if *success { ok(5.0, i as i64) } else { fail(i as i64) };
            st.record(sample);
            states.push(st.state().unwrap());
        }
        use HostState::*;
        assert_eq!(states, vec![Down, Down, Down, Flap, Flap, Up]);
    }

    #[test]
    fn last_change_moves_only_on_transitions() {
        let mut st = stats(5, 3);
        let feed = [false, false, true, true, true, true, false];
        let mut previous_state = None;
        for (i, success) in feed.iter().enumerate() {
            let before = st.last_change();
            let sample = if *success { ok(5.0, i as i64) } else { fail(i as i64) };
            let changed = st.record(sample);
            let state = st.state();
            if state != previous_state {
                assert_eq!(changed, Some(previous_state));
                assert_eq!(st.last_change(), Some(at(i as i64)));
            } else {
                assert_eq!(changed, None);
                assert_eq!(st.last_change(), before);
            }
            previous_state = state;
        }
    }

    #[test]
    fn identical_feeds_give_identical_states() {
        let feed = [true, false, true, true, false, false, false, true, true, true];
        let run = || {
            let mut st = stats(5, 3);
            feed.iter()
                .enumerate()
                .map(|(i, success)| {
                    let sample = if *success { ok(i as f64, i as i64) } else { fail(i as i64) };
                    st.record(sample);
                    (st.state(), st.last_change())
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn settings_reject_zero() {
        assert!(WindowSettings { window: 0, flap_window: 5 }.validate().is_err());
        assert!(WindowSettings { window: 60, flap_window: 0 }.validate().is_err());
        assert!(WindowSettings::default().validate().is_ok());
    }
}
