//! Messages exchanged between peers.
//!
//! There are only two kinds: a REQUEST asking for permission to enter the critical section, and
//! the REPLY granting it. Both carry the sender and the sender's logical time at send.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a process within the fixed peer set `1..=N`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request = 0,
    Reply = 1,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("REQUEST"),
            Self::Reply => f.write_str("REPLY"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub sender: ProcessId,
    pub timestamp: i64,
}

impl Message {
    pub fn request(sender: ProcessId, timestamp: i64) -> Self {
        Self {
            kind: MessageKind::Request,
            sender,
            timestamp,
        }
    }

    pub fn reply(sender: ProcessId, timestamp: i64) -> Self {
        Self {
            kind: MessageKind::Reply,
            sender,
            timestamp,
        }
    }

    /// Priority of a request in the `(timestamp, id)` total order. Lower wins.
    pub fn priority(&self) -> (i64, ProcessId) {
        (self.timestamp, self.sender)
    }

    /// Returns the message as a single JSON line, without the trailing newline.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_string(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str::<Self>(line).map_err(ProtocolError::Decode)
    }
}

/// A message paired with the peer it is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub to: ProcessId,
    pub message: Message,
}
