use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Local;
use log::debug;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::time::{MissedTickBehavior, interval};

use crate::aggregator::{ProbeReport, Roster, RosterEntry};
use crate::config::ScheduleConfig;
use crate::ping::ProbeOutcome;
use crate::probe::ProbeExecutor;

/// Slack given to an executor past its own timeout before the worker gives up
/// on it and records a timeout itself.
pub const EXECUTOR_GRACE: Duration = Duration::from_millis(250);

#[derive(Default)]
struct Slot {
    seq: u64,
    busy: Arc<AtomicBool>,
}

/// Clears a host's busy flag when its worker finishes or is dropped.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Hands probes to workers. Holds at most one outstanding probe per host and
/// at most `parallel` running probes overall.
pub struct Dispatcher {
    executor: Arc<dyn ProbeExecutor>,
    schedule: ScheduleConfig,
    permits: Arc<Semaphore>,
    results: mpsc::UnboundedSender<ProbeReport>,
    cancel: watch::Receiver<bool>,
    slots: HashMap<u64, Slot>,
}

impl Dispatcher {
    pub fn new(
        executor: Arc<dyn ProbeExecutor>,
        schedule: ScheduleConfig,
        results: mpsc::UnboundedSender<ProbeReport>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(schedule.parallel)),
            schedule,
            results,
            cancel,
            slots: HashMap::new(),
        }
    }

    /// Dispatches every idle host in the roster and forgets hosts that left it.
    fn tick(&mut self, roster: &[RosterEntry]) {
        self.slots.retain(|id, _| roster.iter().any(|entry| entry.id == *id));
        for entry in roster {
            self.dispatch(entry);
        }
    }

    /// Dispatches only hosts seen for the first time.
    fn dispatch_new(&mut self, roster: &[RosterEntry]) {
        self.slots.retain(|id, _| roster.iter().any(|entry| entry.id == *id));
        for entry in roster {
            if !self.slots.contains_key(&entry.id) {
                self.dispatch(entry);
            }
        }
    }

    fn dispatch(&mut self, entry: &RosterEntry) {
        let slot = self.slots.entry(entry.id).or_default();
        if slot
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Skipping {}: previous probe still running", entry.host);
            return;
        }
        slot.seq += 1;

        let in_flight = InFlight(slot.busy.clone());
        let report = ProbeReport {
            host_id: entry.id,
            host: entry.host.clone(),
            seq: slot.seq,
            started_at: Local::now(),
            outcome: ProbeOutcome::failure(),
            error: None,
        };
        let executor = self.executor.clone();
        let permits = self.permits.clone();
        let results = self.results.clone();
        let cancel = self.cancel.clone();
        let timeout = self.schedule.timeout;

        tokio::spawn(async move {
            let _in_flight = in_flight;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if *cancel.borrow() {
                return;
            }
            let mut report = report;
            report.started_at = Local::now();
            let report = run_probe(executor.as_ref(), report, timeout).await;
            let _ = results.send(report);
        });
    }
}

async fn run_probe(executor: &dyn ProbeExecutor, mut report: ProbeReport, timeout: Duration) -> ProbeReport {
    let result = tokio::time::timeout(timeout + EXECUTOR_GRACE, executor.probe(&report.host, timeout)).await;
    match result {
        Ok(Ok(outcome)) => report.outcome = outcome,
        Ok(Err(e)) => {
            debug!("Probe for {} failed: {}", report.host, e);
            report.outcome = ProbeOutcome::failure();
            report.error = Some(e.to_string());
        }
        Err(_) => {
            debug!("Probe for {} exceeded {:?}", report.host, timeout);
            report.outcome = ProbeOutcome::timed_out();
        }
    }
    report
}

/// Resolves once `cancel` reads `true` or its sender is gone.
pub async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|stop| *stop).await;
}

/// Ticks every `interval` until cancelled; hosts added in between are probed
/// right away instead of waiting for the next tick.
pub async fn run(mut dispatcher: Dispatcher, mut roster: watch::Receiver<Roster>) {
    let mut cancel = dispatcher.cancel.clone();
    let mut ticker = interval(dispatcher.schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            _ = ticker.tick() => {
                let current = roster.borrow_and_update().clone();
                dispatcher.tick(&current);
            }
            changed = roster.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = roster.borrow_and_update().clone();
                dispatcher.dispatch_new(&current);
            }
        }
    }
    debug!("Scheduler stopped");
}
