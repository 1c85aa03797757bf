use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::runtime::{Builder, Runtime};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::aggregator::{self, AggregatorChannels, Command, HostTable};
use crate::config::ScheduleConfig;
use crate::error::EngineError;
use crate::probe::ProbeExecutor;
use crate::scheduler::{self, Dispatcher};
use crate::snapshot::EngineSnapshot;
use crate::stats::WindowSettings;

/// Extra time `stop` allows on top of the probe timeout for the loops to exit.
pub const STOP_GRACE: Duration = Duration::from_millis(500);

struct Running {
    runtime: Runtime,
    schedule: ScheduleConfig,
    cancel: watch::Sender<bool>,
    commands: mpsc::UnboundedSender<Command>,
    scheduler: JoinHandle<()>,
    aggregator: JoinHandle<HostTable>,
}

impl Running {
    /// Sends a command to the aggregator and waits for its answer.
    fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<(), EngineError>>) -> Command,
    ) -> Result<(), EngineError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| EngineError::Disconnected)?;
        reply_rx.blocking_recv().map_err(|_| EngineError::Disconnected)?
    }

    /// Cancels both loops and waits for them for at most the probe timeout
    /// plus [`STOP_GRACE`]. Probes still running are dropped with the runtime.
    fn shutdown(self) -> Option<HostTable> {
        let Running {
            runtime,
            schedule,
            cancel,
            commands,
            scheduler,
            aggregator,
        } = self;

        cancel.send_replace(true);
        drop(commands);

        let grace = schedule.timeout + STOP_GRACE;
        let joined = runtime.block_on(async move {
            tokio::time::timeout(grace, async move {
                if let Err(e) = scheduler.await {
                    warn!("Scheduler task failed: {}", e);
                }
                aggregator.await
            })
            .await
        });
        runtime.shutdown_background();

        match joined {
            Ok(Ok(table)) => Some(table),
            Ok(Err(e)) => {
                warn!("Aggregator task failed: {}", e);
                None
            }
            Err(_) => {
                warn!("Monitoring loops did not exit within {:?}", grace);
                None
            }
        }
    }
}

enum Phase {
    Stopped(HostTable),
    Running(Running),
}

/// Probes a set of hosts on a fixed cadence and keeps rolling statistics for
/// each of them.
///
/// The API is blocking: the engine owns a private tokio runtime while it is
/// running, so [`stop`](Self::stop), [`add_host`](Self::add_host) and
/// [`remove_host`](Self::remove_host) must not be called from inside an async
/// context.
pub struct MonitorEngine {
    executor: Arc<dyn ProbeExecutor>,
    settings: WindowSettings,
    phase: Mutex<Phase>,
    snapshots: Arc<watch::Sender<Arc<EngineSnapshot>>>,
}

impl MonitorEngine {
    pub fn new(executor: Arc<dyn ProbeExecutor>, settings: WindowSettings) -> Result<Self, EngineError> {
        settings.validate()?;
        let (snapshots, _) = watch::channel(Arc::new(EngineSnapshot::default()));
        Ok(Self {
            executor,
            settings,
            phase: Mutex::new(Phase::Stopped(HostTable::new(settings))),
            snapshots: Arc::new(snapshots),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, table: &HostTable, running: bool) {
        self.snapshots.send_replace(Arc::new(table.snapshot(running)));
    }

    /// Registers any of `hosts` not known yet and starts probing all
    /// registered hosts. Returns without waiting for the first results.
    pub fn start<I, S>(&self, hosts: I, schedule: ScheduleConfig) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        schedule.validate()?;
        let mut phase = self.lock();
        let Phase::Stopped(table) = &mut *phase else {
            return Err(EngineError::AlreadyRunning);
        };
        for host in hosts {
            let host = host.as_ref();
            if !table.contains(host) {
                table.add(host)?;
            }
        }

        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("pingboard-probe")
            .build()?;

        let mut table = mem::replace(table, HostTable::new(self.settings));
        table.reset_sequences();
        let host_count = table.len();

        let (cancel, cancel_rx) = watch::channel(false);
        let (results_tx, results) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (roster, roster_rx) = watch::channel(table.roster());
        self.publish(&table, true);

        let aggregator = runtime.spawn(aggregator::run(
            table,
            AggregatorChannels {
                results,
                commands: commands_rx,
                roster,
                snapshots: self.snapshots.clone(),
                cancel: cancel_rx.clone(),
            },
        ));
        let dispatcher = Dispatcher::new(self.executor.clone(), schedule, results_tx, cancel_rx);
        let scheduler = runtime.spawn(scheduler::run(dispatcher, roster_rx));

        *phase = Phase::Running(Running {
            runtime,
            schedule,
            cancel,
            commands,
            scheduler,
            aggregator,
        });
        info!(
            "Monitoring {} hosts every {:?} (timeout {:?}, parallel {})",
            host_count, schedule.interval, schedule.timeout, schedule.parallel
        );
        Ok(())
    }

    /// Stops probing and waits, for a bounded time, until the scheduler and
    /// aggregator have exited. Results already queued are applied; probes
    /// still running are abandoned. Stopping a stopped engine does nothing.
    pub fn stop(&self) -> Result<(), EngineError> {
        let mut phase = self.lock();
        let running = match mem::replace(&mut *phase, Phase::Stopped(HostTable::new(self.settings))) {
            Phase::Running(running) => running,
            stopped => {
                *phase = stopped;
                debug!("Stop requested while not running");
                return Ok(());
            }
        };

        let table = running.shutdown().unwrap_or_else(|| {
            // Keep the hosts even though their history is lost.
            let mut table = HostTable::new(self.settings);
            for host in self.snapshots.borrow().hosts.iter() {
                let _ = table.add(&host.host);
            }
            table
        });
        self.publish(&table, false);
        info!("Monitoring stopped");
        *phase = Phase::Stopped(table);
        Ok(())
    }

    pub fn add_host(&self, host: &str) -> Result<(), EngineError> {
        let mut phase = self.lock();
        match &mut *phase {
            Phase::Stopped(table) => {
                table.add(host)?;
                self.publish(table, false);
                Ok(())
            }
            Phase::Running(running) => running.request(|reply| Command::Add {
                host: host.to_string(),
                reply,
            }),
        }
    }

    /// Removes a host and its statistics. While running, the removal goes
    /// through the aggregator, so a probe that is still in flight for the host
    /// is discarded when it completes.
    pub fn remove_host(&self, host: &str) -> Result<(), EngineError> {
        let mut phase = self.lock();
        match &mut *phase {
            Phase::Stopped(table) => {
                table.remove(host)?;
                self.publish(table, false);
                Ok(())
            }
            Phase::Running(running) => running.request(|reply| Command::Remove {
                host: host.to_string(),
                reply,
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(&*self.lock(), Phase::Running(_))
    }

    /// The latest published state of every host.
    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified each time a new snapshot is published.
    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.snapshot().hosts.iter().map(|h| h.host.clone()).collect()
    }
}

impl Drop for MonitorEngine {
    fn drop(&mut self) {
        let phase = self.phase.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Phase::Running(running) = mem::replace(phase, Phase::Stopped(HostTable::new(self.settings))) {
            running.cancel.send_replace(true);
            running.runtime.shutdown_background();
        }
    }
}
