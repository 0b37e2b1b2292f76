use crate::{
    error::{DeliveryError, ProtocolError},
    message::{Envelope, Message, ProcessId},
    observer::{LogLine, Observer, StateChange},
    protocol::{ProcessState, Protocol, Receipt},
    transport::{Inbox, Transport},
};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, instrument};

/// Point-in-time copy of a process's bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub state: ProcessState,
    pub alive: bool,
    pub clock: i64,
    pub request_timestamp: Option<i64>,
    pub pending: Vec<ProcessId>,
    pub deferred: Vec<ProcessId>,
}

struct Shared<T> {
    id: ProcessId,
    protocol: Mutex<Protocol>,
    permission: Notify,
    transport: T,
    observer: Arc<dyn Observer>,
    shutdown: CancellationToken,
    sends: TaskTracker,
}

/// One peer: protocol state behind a lock plus the means to talk to the others.
///
/// Cloning is cheap and every clone drives the same process.
pub struct Process<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Process<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> Process<T> {
    pub fn new(
        id: ProcessId,
        peers: impl IntoIterator<Item = ProcessId>,
        transport: T,
        observer: Arc<dyn Observer>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                protocol: Mutex::new(Protocol::new(id, peers)),
                permission: Notify::new(),
                transport,
                observer,
                shutdown,
                sends: TaskTracker::new(),
            }),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.shared.id
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shared.shutdown
    }

    pub async fn is_alive(&self) -> bool {
        self.shared.protocol.lock().await.is_alive()
    }

    pub async fn state(&self) -> ProcessState {
        self.shared.protocol.lock().await.state()
    }

    pub async fn snapshot(&self) -> Snapshot {
        let protocol = self.shared.protocol.lock().await;
        Snapshot {
            state: protocol.state(),
            alive: protocol.is_alive(),
            clock: protocol.clock(),
            request_timestamp: protocol.request_timestamp(),
            pending: protocol.pending().iter().copied().collect(),
            deferred: protocol.deferred().iter().map(|m| m.sender).collect(),
        }
    }

    /// Broadcasts a REQUEST to every peer. The process must be alive and idle.
    pub async fn request_cs(&self) -> Result<(), ProtocolError> {
        let mut protocol = self.shared.protocol.lock().await;
        let envelopes = protocol.request()?;

        self.log(protocol.clock(), "requesting critical section");
        self.publish(&protocol);
        for envelope in envelopes {
            self.dispatch(envelope);
        }

        Ok(())
    }

    /// Suspends until every peer has replied, then enters the critical section.
    ///
    /// The lock is only held while checking, so inbound messages keep flowing. Wakes on the
    /// REPLY that empties the pending set, or fails with `Cancelled` on shutdown.
    pub async fn await_permission(&self) -> Result<(), ProtocolError> {
        loop {
            {
                let mut protocol = self.shared.protocol.lock().await;
                if protocol.enter() {
                    self.log(
                        protocol.clock(),
                        "entered critical section, holding the implicit token",
                    );
                    self.publish(&protocol);
                    return Ok(());
                }
                if !protocol.is_requesting() {
                    return Err(ProtocolError::NotIdle);
                }
            }

            tokio::select! {
                _ = self.shared.permission.notified() => {}
                _ = self.shared.shutdown.cancelled() => return Err(ProtocolError::Cancelled),
            }
        }
    }

    /// Leaves the critical section and answers every deferred request.
    pub async fn exit_cs(&self) -> Result<(), ProtocolError> {
        let mut protocol = self.shared.protocol.lock().await;
        let envelopes = protocol.exit()?;

        self.log(protocol.clock(), "left critical section");
        // Published before any REPLY leaves, so no observer sees two holders at once.
        self.publish(&protocol);
        for envelope in envelopes {
            self.log(
                protocol.clock(),
                format!("releasing deferred request of {}", envelope.to),
            );
            self.dispatch(envelope);
        }

        Ok(())
    }

    pub async fn on_receive(&self, message: Message) {
        let mut protocol = self.shared.protocol.lock().await;

        match protocol.receive(message) {
            Receipt::Dropped => {
                debug!(from = %message.sender, kind = %message.kind, "crashed, dropping");
            }
            receipt => {
                self.log(
                    protocol.clock(),
                    format!(
                        "received {} from {} [T={}]",
                        message.kind, message.sender, message.timestamp
                    ),
                );
                match receipt {
                    Receipt::Replied(envelope) => self.dispatch(envelope),
                    Receipt::Deferred => self.log(
                        protocol.clock(),
                        format!("deferring request of {}", message.sender),
                    ),
                    Receipt::Granted { complete: true } => self.shared.permission.notify_one(),
                    Receipt::Granted { complete: false } | Receipt::Stale | Receipt::Dropped => {}
                }
            }
        }
    }

    /// Idempotent. Pending replies and deferred requests survive a crash untouched.
    pub async fn set_alive(&self, alive: bool) -> bool {
        let mut protocol = self.shared.protocol.lock().await;
        if protocol.set_alive(alive) {
            let text = if alive {
                "restarted (manual)"
            } else {
                "crashed (manual)"
            };
            self.log(protocol.clock(), text);
            self.shared.observer.on_alive_change(self.id(), alive);
        }
        alive
    }

    /// Operator toggle. Returns the new liveness.
    pub async fn toggle_alive(&self) -> bool {
        let alive = !self.is_alive().await;
        self.set_alive(alive).await
    }

    /// Reports the current state to the observer without changing anything.
    pub async fn announce(&self) {
        let protocol = self.shared.protocol.lock().await;
        self.publish(&protocol);
    }

    /// Feeds inbound messages to [`Process::on_receive`] until shutdown or the inbox closes.
    #[instrument(skip_all, fields(id = %self.id()))]
    pub async fn listen(self, mut inbox: Inbox) {
        loop {
            let message = tokio::select! {
                _ = self.shared.shutdown.cancelled() => break,
                message = inbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.on_receive(message).await;
        }
        debug!("listener stopped");
    }

    /// Waits for every send still in flight. Sends are abandoned once shutdown fires.
    pub async fn drain(&self) {
        self.shared.sends.close();
        self.shared.sends.wait().await;
        self.shared.sends.reopen();
    }

    /// Fire-and-forget send, tracked so shutdown can wait for it. A failure is logged against
    /// the message's own timestamp and otherwise ignored.
    fn dispatch(&self, envelope: Envelope) {
        let process = self.clone();
        self.shared.sends.spawn(async move {
            let result: Result<(), DeliveryError> = tokio::select! {
                _ = process.shared.shutdown.cancelled() => return,
                result = process.shared.transport.send(envelope.to, envelope.message) => result,
            };
            if let Err(e) = result {
                process.log(
                    envelope.message.timestamp,
                    format!(
                        "failed to send {} to {} (maybe down): {e}",
                        envelope.message.kind, envelope.to
                    ),
                );
            }
        });
    }

    fn publish(&self, protocol: &Protocol) {
        let state = protocol.state();
        self.shared.observer.on_state_change(StateChange {
            process_id: self.id(),
            state,
            holds_exclusive_access: state == ProcessState::InCriticalSection,
        });
    }

    fn log(&self, clock: i64, text: impl Into<String>) {
        self.shared.observer.on_log(LogLine::new(self.id(), clock, text));
    }
}
