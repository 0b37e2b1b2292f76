//! Sinks for what processes report. Nothing here feeds back into protocol state.

use crate::{message::ProcessId, protocol::ProcessState};
use chrono::{DateTime, SecondsFormat, Utc};
use std::{fmt, sync::Arc};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub process_id: ProcessId,
    pub state: ProcessState,
    pub holds_exclusive_access: bool,
}

#[derive(Clone, Debug)]
pub struct LogLine {
    pub process_id: ProcessId,
    pub clock: i64,
    pub at: DateTime<Utc>,
    pub text: String,
}

impl LogLine {
    pub fn new(process_id: ProcessId, clock: i64, text: impl Into<String>) -> Self {
        Self {
            process_id,
            clock,
            at: Utc::now(),
            text: text.into(),
        }
    }
}

/// `<RFC 3339 time> P<id> [T=<clock>] <text>`, with the wall-clock time the line was recorded.
impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [T={}] {}",
            self.at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.process_id,
            self.clock,
            self.text
        )
    }
}

pub trait Observer: Send + Sync + 'static {
    fn on_state_change(&self, change: StateChange);

    fn on_log(&self, line: LogLine);

    fn on_alive_change(&self, _process_id: ProcessId, _alive: bool) {}
}

/// Writes everything to the `tracing` subscriber.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_state_change(&self, change: StateChange) {
        let suffix = if change.holds_exclusive_access {
            " - holding token"
        } else {
            ""
        };
        info!(
            process = %change.process_id,
            state = %change.state,
            "{}: {}{suffix}",
            change.process_id,
            change.state
        );
    }

    fn on_log(&self, line: LogLine) {
        info!(process = %line.process_id, clock = line.clock, "{line}");
    }

    fn on_alive_change(&self, process_id: ProcessId, alive: bool) {
        let status = if alive { "up" } else { "down" };
        info!(process = %process_id, alive, "{process_id}: {status}");
    }
}

#[derive(Clone, Debug)]
pub enum Event {
    State(StateChange),
    Log(LogLine),
    Alive { process_id: ProcessId, alive: bool },
}

/// Forwards events into an unbounded channel, for anything that wants to watch the run.
#[derive(Clone, Debug)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn on_state_change(&self, change: StateChange) {
        let _ = self.tx.send(Event::State(change));
    }

    fn on_log(&self, line: LogLine) {
        let _ = self.tx.send(Event::Log(line));
    }

    fn on_alive_change(&self, process_id: ProcessId, alive: bool) {
        let _ = self.tx.send(Event::Alive { process_id, alive });
    }
}

/// Hands every event to each inner observer in turn.
#[derive(Clone, Default)]
pub struct Fanout(pub Vec<Arc<dyn Observer>>);

impl Observer for Fanout {
    fn on_state_change(&self, change: StateChange) {
        for observer in &self.0 {
            observer.on_state_change(change);
        }
    }

    fn on_log(&self, line: LogLine) {
        for observer in &self.0 {
            observer.on_log(line.clone());
        }
    }

    fn on_alive_change(&self, process_id: ProcessId, alive: bool) {
        for observer in &self.0 {
            observer.on_alive_change(process_id, alive);
        }
    }
}
