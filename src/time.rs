use std::cmp::max;

pub trait Clock<T> {
    /// Advance the clock by 1 unit
    fn advance_clock(&mut self) -> T;

    /// Update the clock when receiving a message including the timestamp
    fn update_clock(&mut self, message_timestamp: &T) -> T;

    /// get the current time
    fn get_clock(&self) -> T;
}

/// Scalar logical clock owned by a single process. The value never decreases.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LamportClock {
    time: i64,
}

impl Clock<i64> for LamportClock {
    /// Every message this process originates is a new event, so the clock moves forward before
    /// the timestamp is read.
    fn advance_clock(&mut self) -> i64 {
        self.time += 1;
        self.time
    }

    /// On receipt we jump past whatever the sender had seen, which keeps the happened-before
    /// relation consistent with timestamp order.
    fn update_clock(&mut self, message_timestamp: &i64) -> i64 {
        self.time = max(self.time, *message_timestamp);
        self.advance_clock()
    }

    fn get_clock(&self) -> i64 {
        self.time
    }
}

impl LamportClock {
    pub fn new() -> Self {
        Self { time: 0 }
    }

    pub fn tick(&mut self) -> i64 {
        self.advance_clock()
    }

    pub fn observe(&mut self, remote_timestamp: i64) -> i64 {
        self.update_clock(&remote_timestamp)
    }

    pub fn now(&self) -> i64 {
        self.get_clock()
    }
}
