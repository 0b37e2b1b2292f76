use crate::message::ProcessId;

/// Failure to hand a single message to a peer. Logged and dropped, never retried.
#[derive(thiserror::Error, Debug)]
pub enum DeliveryError {
    #[error("no address known for {0}")]
    UnknownPeer(ProcessId),

    #[error("could not connect to {peer}: {source}")]
    Connect {
        peer: ProcessId,
        #[source]
        source: std::io::Error,
    },

    #[error("could not write to {peer}: {source}")]
    Write {
        peer: ProcessId,
        #[source]
        source: std::io::Error,
    },

    #[error("could not encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("inbox of {0} is closed")]
    Closed(ProcessId),
}

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    #[error("process is crashed")]
    Crashed,

    #[error("process is already requesting or holding the critical section")]
    NotIdle,

    #[error("process does not hold the critical section")]
    NotInCriticalSection,

    #[error("malformed message: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("process is shutting down")]
    Cancelled,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("process {id} does not fit a port after base port {base_port}")]
    PortOutOfRange { id: u32, base_port: u16 },
}
