use crate::config::Timings;
use rand::{Rng, SeedableRng, rngs::SmallRng};
use std::{ops::RangeInclusive, time::Duration};

/// Decides when a process wants the critical section and how long it keeps it.
pub trait Schedule: Send {
    fn think_time(&mut self) -> Duration;

    fn hold_time(&mut self) -> Duration;
}

#[derive(Clone, Debug)]
pub struct RandomSchedule {
    rng: SmallRng,
    think: RangeInclusive<Duration>,
    hold: RangeInclusive<Duration>,
}

impl RandomSchedule {
    pub fn new(timings: &Timings, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_rng(&mut rand::rng()),
        };

        Self {
            rng,
            think: timings.think.clone(),
            hold: timings.hold.clone(),
        }
    }

    fn sample(rng: &mut SmallRng, range: &RangeInclusive<Duration>) -> Duration {
        let low = range.start().as_millis() as u64;
        let high = range.end().as_millis() as u64;
        if high <= low {
            return *range.start();
        }
        Duration::from_millis(rng.random_range(low..=high))
    }
}

impl Schedule for RandomSchedule {
    fn think_time(&mut self) -> Duration {
        Self::sample(&mut self.rng, &self.think)
    }

    fn hold_time(&mut self) -> Duration {
        Self::sample(&mut self.rng, &self.hold)
    }
}

/// Same durations every cycle.
#[derive(Clone, Copy, Debug)]
pub struct FixedSchedule {
    pub think: Duration,
    pub hold: Duration,
}

impl Schedule for FixedSchedule {
    fn think_time(&mut self) -> Duration {
        self.think
    }

    fn hold_time(&mut self) -> Duration {
        self.hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_schedule_stays_in_range() {
        let timings = Timings::from_millis((40, 70), (30, 40), 10);
        let mut schedule = RandomSchedule::new(&timings, Some(7));
        for _ in 0..200 {
            assert!(timings.think.contains(&schedule.think_time()));
            assert!(timings.hold.contains(&schedule.hold_time()));
        }
    }

    #[test]
    fn seeded_schedules_agree() {
        let timings = Timings::default();
        let mut a = RandomSchedule::new(&timings, Some(99));
        let mut b = RandomSchedule::new(&timings, Some(99));
        for _ in 0..10 {
            assert_eq!(a.think_time(), b.think_time());
        }
    }

    #[test]
    fn degenerate_range_is_constant() {
        let timings = Timings::from_millis((5, 5), (0, 0), 1);
        let mut schedule = RandomSchedule::new(&timings, None);
        assert_eq!(schedule.think_time(), Duration::from_millis(5));
        assert_eq!(schedule.hold_time(), Duration::ZERO);
    }
}
