use crate::{error::ConfigError, message::ProcessId};
use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    ops::RangeInclusive,
    time::Duration,
};

pub const DEFAULT_BASE_PORT: u16 = 5000;
pub const DEFAULT_PROCESS_COUNT: u32 = 10;

/// Static address table, built once at startup.
#[derive(Clone, Debug, Default)]
pub struct PeerTable {
    addresses: BTreeMap<ProcessId, SocketAddr>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes `1..=count` on `host`, process `i` listening on `base_port + i`.
    ///
    /// Fails if any of those ports would pass `u16::MAX`.
    pub fn sequential(host: IpAddr, base_port: u16, count: u32) -> Result<Self, ConfigError> {
        let addresses = (1..=count)
            .map(|i| {
                let port = u16::try_from(i)
                    .ok()
                    .and_then(|offset| base_port.checked_add(offset))
                    .ok_or(ConfigError::PortOutOfRange { id: i, base_port })?;
                Ok((ProcessId(i), SocketAddr::new(host, port)))
            })
            .collect::<Result<_, ConfigError>>()?;
        Ok(Self { addresses })
    }

    pub fn localhost(count: u32) -> Result<Self, ConfigError> {
        Self::sequential(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            DEFAULT_BASE_PORT,
            count,
        )
    }

    pub fn insert(&mut self, id: ProcessId, address: SocketAddr) {
        self.addresses.insert(id, address);
    }

    pub fn address(&self, id: ProcessId) -> Option<SocketAddr> {
        self.addresses.get(&id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.addresses.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Scenario timing for the driver loop. None of this affects protocol correctness.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timings {
    pub think: RangeInclusive<Duration>,
    pub hold: RangeInclusive<Duration>,
    pub crash_poll: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            think: Duration::from_millis(4000)..=Duration::from_millis(7000),
            hold: Duration::from_millis(3000)..=Duration::from_millis(4000),
            crash_poll: Duration::from_millis(1000),
        }
    }
}

impl Timings {
    pub fn from_millis(think: (u64, u64), hold: (u64, u64), crash_poll: u64) -> Self {
        Self {
            think: Duration::from_millis(think.0)..=Duration::from_millis(think.1.max(think.0)),
            hold: Duration::from_millis(hold.0)..=Duration::from_millis(hold.1.max(hold.0)),
            crash_poll: Duration::from_millis(crash_poll),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ClusterConfig {
    pub peers: PeerTable,
    pub timings: Timings,
    pub seed: Option<u64>,
}
