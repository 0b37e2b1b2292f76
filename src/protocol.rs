//! Ricart & Agrawala permission state machine, without any I/O.
//!
//! Every operation mutates the local bookkeeping and hands back the messages that must go out.
//! The caller owns delivery and serialises access (one lock per process).
//!
//! A process that is requesting or inside the critical section holds back its REPLY to any
//! request with lower priority, in the `(timestamp, id)` order. Holding those replies is what
//! makes the winner the implicit token holder: the token is passed on when the deferred queue is
//! drained at exit.

use crate::{
    error::ProtocolError,
    message::{Envelope, Message, MessageKind, ProcessId},
    time::LamportClock,
};
use std::{
    collections::{BTreeSet, VecDeque},
    fmt,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Idle,
    Requesting,
    InCriticalSection,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("IDLE"),
            Self::Requesting => f.write_str("REQUESTING"),
            Self::InCriticalSection => f.write_str("IN_CS"),
        }
    }
}

/// What handling one inbound message amounted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Receipt {
    /// The process is crashed; nothing changed.
    Dropped,
    /// A REQUEST answered on the spot.
    Replied(Envelope),
    /// A REQUEST queued until exit.
    Deferred,
    /// A REPLY counted against the pending set. `complete` is set on the one that empties it.
    Granted { complete: bool },
    /// A REPLY from a peer we were not waiting on.
    Stale,
}

#[derive(Clone, Debug)]
pub struct Protocol {
    id: ProcessId,
    peers: BTreeSet<ProcessId>,
    clock: LamportClock,
    alive: bool,
    requesting: bool,
    in_cs: bool,
    request_timestamp: i64,
    pending: BTreeSet<ProcessId>,
    deferred: VecDeque<Message>,
}

impl Protocol {
    pub fn new(id: ProcessId, peers: impl IntoIterator<Item = ProcessId>) -> Self {
        Self {
            id,
            peers: peers.into_iter().filter(|peer| *peer != id).collect(),
            clock: LamportClock::new(),
            alive: true,
            requesting: false,
            in_cs: false,
            request_timestamp: 0,
            pending: BTreeSet::new(),
            deferred: VecDeque::new(),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn clock(&self) -> i64 {
        self.clock.now()
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn is_requesting(&self) -> bool {
        self.requesting
    }

    pub fn state(&self) -> ProcessState {
        if self.in_cs {
            ProcessState::InCriticalSection
        } else if self.requesting {
            ProcessState::Requesting
        } else {
            ProcessState::Idle
        }
    }

    /// Timestamp of the outstanding request, if any.
    pub fn request_timestamp(&self) -> Option<i64> {
        self.requesting.then_some(self.request_timestamp)
    }

    pub fn pending(&self) -> &BTreeSet<ProcessId> {
        &self.pending
    }

    pub fn deferred(&self) -> &VecDeque<Message> {
        &self.deferred
    }

    /// Returns whether the flag actually changed. Pending replies and deferred requests are left
    /// exactly as they were.
    pub fn set_alive(&mut self, alive: bool) -> bool {
        let changed = self.alive != alive;
        self.alive = alive;
        changed
    }

    /// Starts a request cycle: one REQUEST per peer, all stamped with the same fresh time.
    pub fn request(&mut self) -> Result<Vec<Envelope>, ProtocolError> {
        if !self.alive {
            return Err(ProtocolError::Crashed);
        }
        if self.requesting || self.in_cs {
            return Err(ProtocolError::NotIdle);
        }

        let timestamp = self.clock.tick();
        self.requesting = true;
        self.request_timestamp = timestamp;
        self.pending = self.peers.clone();

        Ok(self
            .peers
            .iter()
            .map(|peer| Envelope {
                to: *peer,
                message: Message::request(self.id, timestamp),
            })
            .collect())
    }

    /// True once every peer has replied to the outstanding request.
    pub fn permission_granted(&self) -> bool {
        self.requesting && !self.in_cs && self.pending.is_empty()
    }

    /// Moves into the critical section if permission is complete.
    pub fn enter(&mut self) -> bool {
        if !self.permission_granted() {
            return false;
        }
        self.in_cs = true;
        true
    }

    /// Leaves the critical section and answers every deferred request, oldest first.
    pub fn exit(&mut self) -> Result<Vec<Envelope>, ProtocolError> {
        if !self.in_cs {
            return Err(ProtocolError::NotInCriticalSection);
        }
        self.in_cs = false;
        self.requesting = false;

        let timestamp = self.clock.now();
        Ok(self
            .deferred
            .drain(..)
            .map(|request| Envelope {
                to: request.sender,
                message: Message::reply(self.id, timestamp),
            })
            .collect())
    }

    pub fn receive(&mut self, message: Message) -> Receipt {
        if !self.alive {
            return Receipt::Dropped;
        }

        self.clock.observe(message.timestamp);

        match message.kind {
            MessageKind::Request => {
                if self.should_reply_now(&message) {
                    Receipt::Replied(Envelope {
                        to: message.sender,
                        message: Message::reply(self.id, self.clock.now()),
                    })
                } else {
                    self.deferred.push_back(message);
                    Receipt::Deferred
                }
            }
            MessageKind::Reply => {
                if self.requesting && self.pending.remove(&message.sender) {
                    Receipt::Granted {
                        complete: self.pending.is_empty(),
                    }
                } else {
                    Receipt::Stale
                }
            }
        }
    }

    fn should_reply_now(&self, request: &Message) -> bool {
        if self.in_cs {
            return false;
        }
        !self.requesting || request.priority() < (self.request_timestamp, self.id)
    }
}
