use anyhow::{Context, Result};
use clap::Parser;
use ricart_agrawala_lib::{
    config::{ClusterConfig, DEFAULT_BASE_PORT, DEFAULT_PROCESS_COUNT, PeerTable, Timings},
    message::ProcessId,
    observer::{ChannelObserver, Event, Fanout, TracingObserver},
    protocol::ProcessState,
    run::Cluster,
    transport::Transport,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::{IpAddr, Ipv4Addr},
    sync::Arc,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "simulation")]
#[command(about = "Run a Ricart & Agrawala cluster in one process")]
struct Args {
    #[arg(short = 'n', long, default_value_t = DEFAULT_PROCESS_COUNT)]
    processes: u32,

    /// Process i listens on base_port + i.
    #[arg(long, default_value_t = DEFAULT_BASE_PORT)]
    base_port: u16,

    /// Use in-memory channels instead of localhost TCP.
    #[arg(long)]
    local: bool,

    /// Wait for a `start` command instead of starting right away.
    #[arg(long)]
    manual_start: bool,

    #[arg(long, default_value_t = 4000)]
    think_min_ms: u64,

    #[arg(long, default_value_t = 7000)]
    think_max_ms: u64,

    #[arg(long, default_value_t = 3000)]
    hold_min_ms: u64,

    #[arg(long, default_value_t = 4000)]
    hold_max_ms: u64,

    #[arg(long, default_value_t = 1000)]
    crash_poll_ms: u64,

    #[arg(long)]
    seed: Option<u64>,
}

impl Args {
    fn config(&self) -> Result<ClusterConfig> {
        Ok(ClusterConfig {
            peers: PeerTable::sequential(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                self.base_port,
                self.processes,
            )
            .context("build peer table")?,
            timings: Timings::from_millis(
                (self.think_min_ms, self.think_max_ms),
                (self.hold_min_ms, self.hold_max_ms),
                self.crash_poll_ms,
            ),
            seed: self.seed,
        })
    }
}

/// Counts critical-section entries per process until every observer handle is gone.
///
/// Also checks the run as it goes: two simultaneous holders is logged as an error.
async fn tally(mut events: mpsc::UnboundedReceiver<Event>) -> BTreeMap<ProcessId, u64> {
    let mut entries = BTreeMap::new();
    let mut holders = BTreeSet::new();

    while let Some(event) = events.recv().await {
        let Event::State(change) = event else {
            continue;
        };
        if change.state == ProcessState::InCriticalSection {
            *entries.entry(change.process_id).or_default() += 1;
            holders.insert(change.process_id);
            if holders.len() > 1 {
                error!(?holders, "more than one process holds the critical section");
            }
        } else {
            holders.remove(&change.process_id);
        }
    }

    entries
}

/// Reads operator commands from stdin until `quit`, EOF or Ctrl-C.
async fn operate<T: Transport>(mut cluster: Cluster<T>, manual_start: bool) -> Result<()> {
    if manual_start {
        info!("type `start` to begin, `<id>` to crash or restart a process, `quit` to stop");
    } else {
        cluster.start();
        info!("type `<id>` to crash or restart a process, `status`, or `quit`");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line.context("read stdin")? {
                Some(line) => line,
                None => break,
            },
        };

        let command = line.trim();
        match command {
            "" => {}
            "start" => cluster.start(),
            "quit" | "exit" => break,
            "status" => {
                for process in cluster.processes() {
                    let snapshot = process.snapshot().await;
                    info!(id = %process.id(), ?snapshot, "status");
                }
            }
            other => {
                let id = other.strip_prefix("toggle").unwrap_or(other).trim();
                match id.trim_start_matches('P').parse::<u32>() {
                    Ok(id) => match cluster.toggle(ProcessId(id)).await {
                        Some(alive) => info!(id, alive, "toggled"),
                        None => warn!("no process {id}"),
                    },
                    Err(_) => warn!("unknown command: {other}"),
                }
            }
        }
    }

    info!("shutting down");
    cluster.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.config()?;
    let (channel, events) = ChannelObserver::new();
    let observer = Arc::new(Fanout(vec![Arc::new(TracingObserver), Arc::new(channel)]));
    let summary = tokio::spawn(tally(events));

    if args.local {
        operate(Cluster::local(config, observer), args.manual_start).await?;
    } else {
        let cluster = Cluster::tcp(config, observer)
            .await
            .context("start tcp cluster")?;
        operate(cluster, args.manual_start).await?;
    }

    for (id, count) in summary.await.context("tally task")? {
        info!(%id, entries = count, "critical section entries");
    }
    Ok(())
}
