//! The single writer of all host statistics.
//!
//! Workers only send [`ProbeReport`]s; host registration changes arrive as
//! [`Command`]s on a second channel. Both are handled by one task, so the
//! table needs no locking and a removal can never interleave with an update
//! for the same host.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Local};
use log::{debug, info};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::EngineError;
use crate::ping::{ProbeOutcome, Sample};
use crate::scheduler::cancelled;
use crate::snapshot::{EngineSnapshot, HostSnapshot};
use crate::stats::{HostStats, WindowSettings};

/// A host as the scheduler sees it. `id` changes if the host is removed and
/// added again, so late results for the old registration can be told apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterEntry {
    pub id: u64,
    pub host: String,
}

pub type Roster = Arc<Vec<RosterEntry>>;

#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub host_id: u64,
    pub host: String,
    /// Per-host dispatch counter, starting at 1.
    pub seq: u64,
    /// Set when the worker holds a permit and calls the executor.
    pub started_at: DateTime<Local>,
    pub outcome: ProbeOutcome,
    pub error: Option<String>,
}

pub enum Command {
    Add {
        host: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Remove {
        host: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

pub struct Reply(oneshot::Sender<Result<(), EngineError>>, Result<(), EngineError>);

impl Reply {
    pub fn send(self) {
        let _ = self.0.send(self.1);
    }
}

struct HostEntry {
    host: String,
    stats: HostStats,
    last_seq: u64,
}

/// Registered hosts and their stats, in registration order.
pub struct HostTable {
    settings: WindowSettings,
    next_id: u64,
    entries: BTreeMap<u64, HostEntry>,
    ids: HashMap<String, u64>,
}

impl HostTable {
    pub fn new(settings: WindowSettings) -> Self {
        Self {
            settings,
            next_id: 1,
            entries: BTreeMap::new(),
            ids: HashMap::new(),
        }
    }

    pub fn add(&mut self, host: &str) -> Result<u64, EngineError> {
        if self.ids.contains_key(host) {
            return Err(EngineError::DuplicateHost(host.to_string()));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.ids.insert(host.to_string(), id);
        self.entries.insert(
            id,
            HostEntry {
                host: host.to_string(),
                stats: HostStats::new(self.settings),
                last_seq: 0,
            },
        );
        Ok(id)
    }

    pub fn remove(&mut self, host: &str) -> Result<(), EngineError> {
        let id = self
            .ids
            .remove(host)
            .ok_or_else(|| EngineError::UnknownHost(host.to_string()))?;
        self.entries.remove(&id);
        Ok(())
    }

    pub fn contains(&self, host: &str) -> bool {
        self.ids.contains_key(host)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets the last applied sequence of every host. A new scheduler
    /// numbers its probes from 1 again, so this runs before each start.
    pub fn reset_sequences(&mut self) {
        for entry in self.entries.values_mut() {
            entry.last_seq = 0;
        }
    }

    /// Applies a report if it belongs to a current registration and is newer
    /// than anything applied for that host. Returns whether it was applied.
    pub fn apply(&mut self, report: ProbeReport) -> bool {
        let Some(entry) = self.entries.get_mut(&report.host_id) else {
            debug!("Discarding result for unregistered host {}", report.host);
            return false;
        };
        if report.seq <= entry.last_seq {
            debug!(
                "Discarding stale result #{} for {} (last applied #{})",
                report.seq, entry.host, entry.last_seq
            );
            return false;
        }
        entry.last_seq = report.seq;

        let sample = Sample::new(report.outcome, report.started_at);
        if let Some(previous) = entry.stats.record_with_error(sample, report.error) {
            let previous = previous.map_or_else(|| "-".to_string(), |s| s.to_string());
            if let Some(state) = entry.stats.state() {
                info!("{} changed {} -> {}", entry.host, previous, state);
            }
        }
        true
    }

    /// Applies a command. The answer is returned rather than sent so callers
    /// only hear back once the new roster and snapshot are published.
    pub fn handle(&mut self, command: Command) -> Reply {
        match command {
            Command::Add { host, reply } => Reply(reply, self.add(&host).map(|_| ())),
            Command::Remove { host, reply } => Reply(reply, self.remove(&host)),
        }
    }

    pub fn roster(&self) -> Roster {
        Arc::new(
            self.entries
                .iter()
                .map(|(id, entry)| RosterEntry {
                    id: *id,
                    host: entry.host.clone(),
                })
                .collect(),
        )
    }

    pub fn snapshot(&self, running: bool) -> EngineSnapshot {
        EngineSnapshot {
            running,
            hosts: self
                .entries
                .values()
                .map(|entry| HostSnapshot::new(&entry.host, &entry.stats))
                .collect(),
        }
    }
}

/// Channels the aggregator loop works with.
pub struct AggregatorChannels {
    pub results: mpsc::UnboundedReceiver<ProbeReport>,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub roster: watch::Sender<Roster>,
    pub snapshots: Arc<watch::Sender<Arc<EngineSnapshot>>>,
    pub cancel: watch::Receiver<bool>,
}

/// Runs until cancelled, then applies whatever is already queued and hands
/// the table back.
pub async fn run(mut table: HostTable, channels: AggregatorChannels) -> HostTable {
    let AggregatorChannels {
        mut results,
        mut commands,
        roster,
        snapshots,
        mut cancel,
    } = channels;

    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => break,
            Some(command) = commands.recv() => {
                let mut replies = vec![table.handle(command)];
                while let Ok(command) = commands.try_recv() {
                    replies.push(table.handle(command));
                }
                roster.send_replace(table.roster());
                snapshots.send_replace(Arc::new(table.snapshot(true)));
                replies.into_iter().for_each(Reply::send);
            }
            Some(report) = results.recv() => {
                table.apply(report);
                while let Ok(report) = results.try_recv() {
                    table.apply(report);
                }
                snapshots.send_replace(Arc::new(table.snapshot(true)));
            }
            else => break,
        }
    }

    let mut replies = Vec::new();
    while let Ok(command) = commands.try_recv() {
        replies.push(table.handle(command));
    }
    while let Ok(report) = results.try_recv() {
        table.apply(report);
    }
    snapshots.send_replace(Arc::new(table.snapshot(false)));
    replies.into_iter().for_each(Reply::send);
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::HostState;

    fn report(host_id: u64, host: &str, seq: u64, outcome: ProbeOutcome) -> ProbeReport {
        ProbeReport {
            host_id,
            host: host.to_string(),
            seq,
            started_at: Local::now(),
            outcome,
            error: None,
        }
    }

    #[test]
    fn duplicate_and_unknown_hosts() {
        let mut table = HostTable::new(WindowSettings::default());
        table.add("a").unwrap();
        assert!(matches!(table.add("a"), Err(EngineError::DuplicateHost(_))));
        assert!(matches!(table.remove("b"), Err(EngineError::UnknownHost(_))));
        table.remove("a").unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn stale_results_are_discarded() {
        let mut table = HostTable::new(WindowSettings::default());
        let id = table.add("a").unwrap();
        assert!(table.apply(report(id, "a", 2, ProbeOutcome::failure())));
        assert!(!table.apply(report(id, "a", 1, ProbeOutcome::success(1.0))));
        assert!(!table.apply(report(id, "a", 2, ProbeOutcome::success(1.0))));

        let snap = table.snapshot(false);
        assert_eq!(snap.hosts[0].samples.len(), 1);
        assert_eq!(snap.hosts[0].state, Some(HostState::Down));
    }

    #[test]
    fn sequences_restart_after_reset() {
        let mut table = HostTable::new(WindowSettings::default());
        let id = table.add("a").unwrap();
        for seq in 1..=10 {
            assert!(table.apply(report(id, "a", seq, ProbeOutcome::success(1.0))));
        }
        assert!(!table.apply(report(id, "a", 1, ProbeOutcome::failure())));

        table.reset_sequences();
        assert!(table.apply(report(id, "a", 1, ProbeOutcome::failure())));
        let snap = table.snapshot(false);
        assert_eq!(snap.hosts[0].samples.len(), 11);
        assert_eq!(snap.hosts[0].state, Some(HostState::Flap));
    }

    #[test]
    fn results_for_old_registration_do_not_resurrect() {
        let mut table = HostTable::new(WindowSettings::default());
        let old = table.add("a").unwrap();
        table.remove("a").unwrap();
        assert!(!table.apply(report(old, "a", 1, ProbeOutcome::success(1.0))));
        assert!(table.snapshot(false).hosts.is_empty());

        let new = table.add("a").unwrap();
        assert_ne!(old, new);
        assert!(!table.apply(report(old, "a", 5, ProbeOutcome::success(1.0))));
        assert!(table.snapshot(false).hosts[0].samples.is_empty());
    }

    #[test]
    fn roster_and_snapshot_keep_registration_order() {
        let mut table = HostTable::new(WindowSettings::default());
        for host in ["c", "a", "b"] {
            table.add(host).unwrap();
        }
        table.remove("a").unwrap();
        table.add("a").unwrap();
        let hosts: Vec<_> = table.roster().iter().map(|e| e.host.clone()).collect();
        assert_eq!(hosts, vec!["c", "b", "a"]);
        let snap: Vec<_> = table.snapshot(true).hosts.into_iter().map(|h| h.host).collect();
        assert_eq!(snap, hosts);
    }

    #[tokio::test]
    async fn loop_drains_queued_results_on_cancel() {
        let mut table = HostTable::new(WindowSettings::default());
        let id = table.add("a").unwrap();

        let (results_tx, results) = mpsc::unbounded_channel();
        let (_commands_tx, commands) = mpsc::unbounded_channel();
        let (roster, _roster_rx) = watch::channel(table.roster());
        let snapshots = Arc::new(watch::channel(Arc::new(EngineSnapshot::default())).0);
        let (cancel_tx, cancel) = watch::channel(true);

        for seq in 1..=3 {
            results_tx.send(report(id, "a", seq, ProbeOutcome::success(2.0))).unwrap();
        }
        let table = run(
            table,
            AggregatorChannels {
                results,
                commands,
                roster,
                snapshots: snapshots.clone(),
                cancel,
            },
        )
        .await;
        drop(cancel_tx);

        assert_eq!(table.snapshot(false).hosts[0].samples.len(), 3);
        let published = snapshots.borrow().clone();
        assert!(!published.running);
        assert_eq!(published.hosts[0].state, Some(HostState::Up));
    }

    #[tokio::test]
    async fn commands_update_roster() {
        let table = HostTable::new(WindowSettings::default());
        let (_results_tx, results) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (roster, mut roster_rx) = watch::channel(table.roster());
        let snapshots = Arc::new(watch::channel(Arc::new(EngineSnapshot::default())).0);
        let (cancel_tx, cancel) = watch::channel(false);

        let handle = tokio::spawn(run(
            table,
            AggregatorChannels {
                results,
                commands,
                roster,
                snapshots,
                cancel,
            },
        ));

        let (reply, reply_rx) = oneshot::channel();
        commands_tx
            .send(Command::Add {
                host: "10.0.0.1".into(),
                reply,
            })
            .unwrap();
        reply_rx.await.unwrap().unwrap();
        roster_rx.changed().await.unwrap();
        assert_eq!(roster_rx.borrow()[0].host, "10.0.0.1");

        let (reply, reply_rx) = oneshot::channel();
        commands_tx
            .send(Command::Remove {
                host: "nope".into(),
                reply,
            })
            .unwrap();
        assert!(matches!(reply_rx.await.unwrap(), Err(EngineError::UnknownHost(_))));

        cancel_tx.send_replace(true);
        let table = handle.await.unwrap();
        assert!(table.contains("10.0.0.1"));
    }
}
