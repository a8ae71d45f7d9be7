// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Source of elapsed time for poll time limits.
pub trait Clock {
    /// Time since some fixed point, only ever compared with itself.
    fn now(&self) -> Duration;
}

#[derive(Debug)]
pub struct StdClock {
    start: Instant,
}

impl Default for StdClock {
    fn default() -> Self {
        StdClock {
            start: Instant::now(),
        }
    }
}

impl Clock for StdClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// How long to keep polling a register before giving up.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct PollBudget {
    pub max_attempts: u32,
    #[serde(
        rename = "time-limit-ms",
        with = "duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub time_limit: Option<Duration>,
}

impl Default for PollBudget {
    fn default() -> Self {
        PollBudget {
            max_attempts: 1_000_000,
            time_limit: Some(Duration::from_secs(5)),
        }
    }
}

impl PollBudget {
    pub fn attempts(max_attempts: u32) -> PollBudget {
        PollBudget {
            max_attempts,
            time_limit: None,
        }
    }

    /// Call `poll` until it yields a value, fails, or the budget runs out.
    /// `poll` always runs at least once.
    pub fn run<T>(
        &self,
        clock: &dyn Clock,
        what: &'static str,
        mut poll: impl FnMut() -> Result<Option<T>, Error>,
    ) -> Result<T, Error> {
        let start = clock.now();
        let mut attempts = 0;
        loop {
            attempts += 1;
            if let Some(v) = poll()? {
                return Ok(v);
            }
            let spent = attempts >= self.max_attempts;
            let expired = self
                .time_limit
                .map_or(false, |limit| clock.now().saturating_sub(start) >= limit);
            if spent || expired {
                return Err(Error::Timeout { what, attempts });
            }
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        d.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Ticks(Cell<u64>);

    impl Clock for Ticks {
        fn now(&self) -> Duration {
            let t = self.0.get();
            self.0.set(t + 10);
            Duration::from_millis(t)
        }
    }

    #[test]
    fn poll_runs_at_least_once() {
        let budget = PollBudget::attempts(0);
        let mut calls = 0;
        let r = budget.run(&StdClock::default(), "nothing", || {
            calls += 1;
            Ok(None::<()>)
        });
        assert!(matches!(r, Err(Error::Timeout { attempts: 1, .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn succeeds_within_attempts() {
        let budget = PollBudget::attempts(5);
        let mut calls = 0;
        let v = budget
            .run(&StdClock::default(), "fifth poll", || {
                calls += 1;
                Ok((calls == 5).then_some(calls))
            })
            .unwrap();
        assert_eq!(v, 5);
    }

    #[test]
    fn time_limit_cuts_attempts_short() {
        let budget = PollBudget {
            max_attempts: 1000,
            time_limit: Some(Duration::from_millis(35)),
        };
        let clock = Ticks(Cell::new(0));
        let r = budget.run(&clock, "slow register", || Ok(None::<()>));
        match r {
            Err(Error::Timeout { what, attempts }) => {
                assert_eq!(what, "slow register");
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn poll_errors_propagate() {
        let budget = PollBudget::attempts(10);
        let r: Result<(), _> =
            budget.run(&StdClock::default(), "fault", || Err(Error::HardwareError(0x8000_0000)));
        assert!(matches!(r, Err(Error::HardwareError(0x8000_0000))));
    }
}
