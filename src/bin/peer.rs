use anyhow::{Context, Result, bail};
use clap::Parser;
use ricart_agrawala_lib::{
    config::{PeerTable, Timings},
    message::ProcessId,
    observer::TracingObserver,
    process::Process,
    run::Driver,
    schedule::RandomSchedule,
    transport::{INBOX_CAPACITY, TcpTransport, Transport, serve_tcp},
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "peer")]
#[command(about = "Run a single Ricart & Agrawala process")]
struct Args {
    #[arg(long)]
    id: u32,

    /// Every member including this one, as `id=host:port`.
    #[arg(long = "peer", value_parser = parse_peer, required = true)]
    peers: Vec<(u32, SocketAddr)>,

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
}

fn parse_peer(raw: &str) -> Result<(u32, SocketAddr)> {
    let (id, address) = raw
        .split_once('=')
        .with_context(|| format!("expected id=host:port, got {raw}"))?;
    Ok((
        id.parse().context("peer id")?,
        address.parse().context("peer address")?,
    ))
}

/// Reads operator commands from stdin until `quit`, EOF or Ctrl-C.
async fn operate<T: Transport>(process: &Process<T>) -> Result<()> {
    info!("type `toggle` to crash or restart this process, `status`, or `quit`");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => match line.context("read stdin")? {
                Some(line) => line,
                None => break,
            },
        };

        match line.trim() {
            "" => {}
            "toggle" | "t" => {
                let alive = process.toggle_alive().await;
                info!(id = %process.id(), alive, "toggled");
            }
            "status" => {
                let snapshot = process.snapshot().await;
                info!(id = %process.id(), ?snapshot, "status");
            }
            "quit" | "exit" => break,
            other => warn!("unknown command: {other}"),
        }
    }

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
    let id = ProcessId(args.id);

    let mut peers = PeerTable::new();
    for (peer, address) in &args.peers {
        peers.insert(ProcessId(*peer), *address);
    }
    let Some(own_address) = peers.address(id) else {
        bail!("{id} is missing from the peer table");
    };

    let shutdown = CancellationToken::new();
    let process = Process::new(
        id,
        peers.ids(),
        TcpTransport::new(peers.clone()),
        Arc::new(TracingObserver),
        shutdown.clone(),
    );

    let listener = TcpListener::bind(own_address)
        .await
        .with_context(|| format!("bind {own_address}"))?;
    info!(%id, %own_address, "listening");

    let (tx, inbox) = mpsc::channel(INBOX_CAPACITY);
    let server = tokio::spawn(serve_tcp(listener, tx, shutdown.clone()));
    let listen = tokio::spawn(process.clone().listen(inbox));

    let timings = Timings::from_millis(
        (args.think_min_ms, args.think_max_ms),
        (args.hold_min_ms, args.hold_max_ms),
        args.crash_poll_ms,
    );
    let driver = Driver {
        process: process.clone(),
        schedule: RandomSchedule::new(&timings, None),
        crash_poll: timings.crash_poll,
    };
    let driver = tokio::spawn(driver.run());

    operate(&process).await?;
    info!("shutting down");
    shutdown.cancel();

    driver.await.context("join driver")??;
    server.await.context("join server")?;
    listen.await.context("join listener")?;
    process.drain().await;

    Ok(())
}
