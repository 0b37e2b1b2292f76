//! Point-to-point delivery of single messages.
//!
//! Every inbound path ends in an [`Inbox`], so a process consumes local and TCP traffic the same
//! way. Sends either deliver the whole message or fail; nothing is retried.

use crate::{
    config::PeerTable,
    error::DeliveryError,
    message::{Message, ProcessId},
};
use futures::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    future::Future,
    io,
    sync::{Arc, RwLock},
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::{
    codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError},
    sync::CancellationToken,
    task::TaskTracker,
};
use tracing::{debug, instrument, warn};

pub const INBOX_CAPACITY: usize = 64;
const MAX_LINE_LENGTH: usize = 1024;

pub type Inbox = mpsc::Receiver<Message>;

pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        to: ProcessId,
        message: Message,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// In-process network: one bounded channel per registered process.
#[derive(Clone, Debug, Default)]
pub struct LocalNetwork {
    inboxes: Arc<RwLock<HashMap<ProcessId, mpsc::Sender<Message>>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: ProcessId) -> Inbox {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        self.write().insert(id, tx);
        rx
    }

    /// Makes `id` unreachable; later sends to it fail with `UnknownPeer`.
    pub fn disconnect(&self, id: ProcessId) {
        self.write().remove(&id);
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ProcessId, mpsc::Sender<Message>>> {
        self.inboxes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, id: ProcessId) -> Option<mpsc::Sender<Message>> {
        let inboxes = self
            .inboxes
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inboxes.get(&id).cloned()
    }
}

impl Transport for LocalNetwork {
    async fn send(&self, to: ProcessId, message: Message) -> Result<(), DeliveryError> {
        let inbox = self.lookup(to).ok_or(DeliveryError::UnknownPeer(to))?;
        inbox
            .send(message)
            .await
            .map_err(|_| DeliveryError::Closed(to))
    }
}

/// Opens one connection per message and writes it as a single JSON line.
#[derive(Clone, Debug)]
pub struct TcpTransport {
    peers: Arc<PeerTable>,
}

impl TcpTransport {
    pub fn new(peers: PeerTable) -> Self {
        Self {
            peers: Arc::new(peers),
        }
    }
}

fn into_io(error: LinesCodecError) -> io::Error {
    match error {
        LinesCodecError::Io(error) => error,
        other => io::Error::other(other),
    }
}

impl Transport for TcpTransport {
    async fn send(&self, to: ProcessId, message: Message) -> Result<(), DeliveryError> {
        let address = self.peers.address(to).ok_or(DeliveryError::UnknownPeer(to))?;
        let line = message.to_json_string()?;

        let stream = TcpStream::connect(address)
            .await
            .map_err(|source| DeliveryError::Connect { peer: to, source })?;
        let mut lines = FramedWrite::new(stream, LinesCodec::new());

        lines.send(line).await.map_err(|e: LinesCodecError| DeliveryError::Write {
            peer: to,
            source: into_io(e),
        })?;
        SinkExt::<String>::close(&mut lines).await.map_err(|e| DeliveryError::Write {
            peer: to,
            source: into_io(e),
        })?;

        Ok(())
    }
}

/// Accepts connections until `shutdown` fires and forwards every decoded message to `inbox`.
/// Returns once every open connection has been closed as well.
///
/// Connections are always accepted. Whether the payload means anything is the receiving
/// process's business, so a crashed process still drains its sockets.
#[instrument(skip_all, fields(address = ?listener.local_addr().ok()))]
pub async fn serve_tcp(
    listener: TcpListener,
    inbox: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) {
    let mut incoming = TcpListenerStream::new(listener);
    let connections = TaskTracker::new();

    loop {
        let stream = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = incoming.next() => match next {
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    warn!("accept failed: {e}");
                    continue;
                }
                None => break,
            },
        };

        let inbox = inbox.clone();
        let shutdown = shutdown.clone();
        connections.spawn(async move {
            if let Err(e) = read_connection(stream, inbox, shutdown).await {
                debug!("connection ended: {e}");
            }
        });
    }

    connections.close();
    connections.wait().await;
}

async fn read_connection(
    stream: TcpStream,
    inbox: mpsc::Sender<Message>,
    shutdown: CancellationToken,
) -> Result<(), LinesCodecError> {
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next() => match line {
                Some(line) => line?,
                None => break,
            },
        };
        match Message::from_json_string(&line) {
            Ok(message) => {
                if inbox.send(message).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!("dropping message: {e}"),
        }
    }

    Ok(())
}
