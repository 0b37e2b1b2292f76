use crate::{
    config::ClusterConfig,
    error::ProtocolError,
    message::ProcessId,
    observer::Observer,
    process::Process,
    schedule::{RandomSchedule, Schedule},
    transport::{INBOX_CAPACITY, LocalNetwork, TcpTransport, Transport, serve_tcp},
};
use anyhow::{Context, Result};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// The think / request / wait / hold / release cycle of one process.
pub struct Driver<T: Transport, S: Schedule> {
    pub process: Process<T>,
    pub schedule: S,
    pub crash_poll: Duration,
}

/// Sleeps for `duration` unless shutdown comes first. Returns true on shutdown.
async fn pause(shutdown: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

impl<T: Transport, S: Schedule> Driver<T, S> {
    // `schedule` need not be `Sync`: only `process` and owned copies live across awaits.
    #[instrument(skip_all, fields(id = %self.process.id()))]
    pub async fn run(mut self) -> Result<()> {
        let shutdown = self.process.shutdown_token().clone();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if !self.process.is_alive().await {
                if pause(&shutdown, self.crash_poll).await {
                    break;
                }
                continue;
            }

            self.process.announce().await;
            let think = self.schedule.think_time();
            if pause(&shutdown, think).await {
                break;
            }

            match self.process.request_cs().await {
                Ok(()) => {}
                // Went down while thinking.
                Err(ProtocolError::Crashed) => continue,
                Err(e) => {
                    warn!("could not request: {e}");
                    continue;
                }
            }

            match self.process.await_permission().await {
                Ok(()) => {}
                Err(ProtocolError::Cancelled) => break,
                Err(e) => {
                    warn!("could not enter: {e}");
                    continue;
                }
            }

            let hold = self.schedule.hold_time();
            let cancelled = pause(&shutdown, hold).await;
            self.process
                .exit_cs()
                .await
                .context("release critical section")?;
            if cancelled {
                break;
            }
        }

        info!("driver stopped");
        Ok(())
    }
}

/// A fixed set of processes sharing one network and one shutdown signal.
///
/// Listeners run from construction; drivers only after [`Cluster::start`].
pub struct Cluster<T: Transport> {
    processes: BTreeMap<ProcessId, Process<T>>,
    config: ClusterConfig,
    shutdown: CancellationToken,
    tasks: JoinSet<()>,
    started: bool,
}

impl Cluster<LocalNetwork> {
    pub fn local(config: ClusterConfig, observer: Arc<dyn Observer>) -> Self {
        let network = LocalNetwork::new();
        let shutdown = CancellationToken::new();
        let mut tasks = JoinSet::new();
        let mut processes = BTreeMap::new();

        for id in config.peers.ids() {
            let inbox = network.register(id);
            let process = Process::new(
                id,
                config.peers.ids(),
                network.clone(),
                Arc::clone(&observer),
                shutdown.child_token(),
            );
            tasks.spawn(process.clone().listen(inbox));
            processes.insert(id, process);
        }

        Self {
            processes,
            config,
            shutdown,
            tasks,
            started: false,
        }
    }
}

impl Cluster<TcpTransport> {
    /// Binds every address in the peer table on this host.
    pub async fn tcp(config: ClusterConfig, observer: Arc<dyn Observer>) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let transport = TcpTransport::new(config.peers.clone());
        let mut tasks = JoinSet::new();
        let mut processes = BTreeMap::new();

        for id in config.peers.ids() {
            let address = config
                .peers
                .address(id)
                .with_context(|| format!("no address for {id}"))?;
            let listener = TcpListener::bind(address)
                .await
                .with_context(|| format!("bind {id} on {address}"))?;
            info!(%id, %address, "listening");

            let process = Process::new(
                id,
                config.peers.ids(),
                transport.clone(),
                Arc::clone(&observer),
                shutdown.child_token(),
            );
            let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
            tasks.spawn(serve_tcp(listener, tx, shutdown.child_token()));
            tasks.spawn(process.clone().listen(inbox));
            processes.insert(id, process);
        }

        Ok(Self {
            processes,
            config,
            shutdown,
            tasks,
            started: false,
        })
    }
}

impl<T: Transport> Cluster<T> {
    pub fn process(&self, id: ProcessId) -> Option<&Process<T>> {
        self.processes.get(&id)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process<T>> {
        self.processes.values()
    }

    /// Starts every driver with a random schedule drawn from the configured timings.
    pub fn start(&mut self) {
        let timings = self.config.timings.clone();
        let seed = self.config.seed;
        self.start_with(|id| {
            RandomSchedule::new(&timings, seed.map(|s| s.wrapping_add(u64::from(id.0))))
        });
    }

    /// Starts every driver, asking `schedule` for each process's timing. Only the first call
    /// has any effect.
    pub fn start_with<S, F>(&mut self, mut schedule: F)
    where
        S: Schedule + 'static,
        F: FnMut(ProcessId) -> S,
    {
        if self.started {
            return;
        }
        self.started = true;

        for (id, process) in &self.processes {
            let driver = Driver {
                process: process.clone(),
                schedule: schedule(*id),
                crash_poll: self.config.timings.crash_poll,
            };
            self.tasks.spawn(async move {
                if let Err(e) = driver.run().await {
                    warn!("driver failed: {e:#}");
                }
            });
        }
    }

    /// Operator toggle. Returns the new liveness, or `None` for an unknown id.
    pub async fn toggle(&self, id: ProcessId) -> Option<bool> {
        match self.processes.get(&id) {
            Some(process) => Some(process.toggle_alive().await),
            None => None,
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals every task and waits for all of them, outgoing sends included, to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!("task failed: {e}");
            }
        }
        for process in self.processes.values() {
            process.drain().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{PeerTable, Timings},
        observer::{ChannelObserver, Event},
        protocol::ProcessState,
    };
    use std::cell::Cell;

    /// Counts its own cycles through a `Cell`, so it is `Send` but not `Sync`.
    struct CountingSchedule {
        cycles: Cell<u32>,
    }

    impl Schedule for CountingSchedule {
        fn think_time(&mut self) -> Duration {
            self.cycles.set(self.cycles.get() + 1);
            Duration::from_millis(1)
        }

        fn hold_time(&mut self) -> Duration {
            Duration::from_millis(1)
        }
    }

    fn config(count: u32) -> ClusterConfig {
        ClusterConfig {
            peers: PeerTable::localhost(count).unwrap(),
            timings: Timings::from_millis((1, 1), (1, 1), 5),
            seed: Some(3),
        }
    }

    #[tokio::test]
    async fn drivers_accept_schedules_that_are_not_sync() {
        let (observer, mut events) = ChannelObserver::new();
        let mut cluster = Cluster::local(config(3), Arc::new(observer));
        cluster.start_with(|_| CountingSchedule {
            cycles: Cell::new(0),
        });

        let entered = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let Event::State(change) = event {
                    if change.state == ProcessState::InCriticalSection {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(entered);

        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn toggle_reports_new_liveness() {
        let (observer, _events) = ChannelObserver::new();
        let cluster = Cluster::local(config(2), Arc::new(observer));

        assert_eq!(cluster.toggle(ProcessId(2)).await, Some(false));
        assert_eq!(cluster.toggle(ProcessId(2)).await, Some(true));
        assert_eq!(cluster.toggle(ProcessId(7)).await, None);

        cluster.shutdown().await;
    }
}
