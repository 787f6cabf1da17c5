//! Bounded polling budgets and socket timeouts.
//!
//! Every wait the supervisor performs is a fixed number of probes spaced by a
//! fixed interval. Tests shrink these to keep lifecycle scenarios fast.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `attempts` probes, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollBudget {
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl PollBudget {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Probe until `check` returns true or the budget is spent.
    ///
    /// Sleeps after every failed probe. Returns whether `check` succeeded.
    pub fn wait_for(&self, mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..self.attempts {
            if check() {
                return true;
            }
            std::thread::sleep(self.interval);
        }
        false
    }

    /// Upper bound on the time [`wait_for`](Self::wait_for) can take.
    pub fn total(&self) -> Duration {
        self.interval * self.attempts
    }
}

/// All tunable waits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Liveness probes after forking an instance
    pub start_probe: PollBudget,
    /// Exit probes after asking an instance to terminate
    pub stop_probe: PollBudget,
    /// Worker side: connect + write deadline for a report
    #[serde(with = "humantime_serde")]
    pub report_send_timeout: Duration,
    /// Supervisor side: wait for one worker's report connection
    #[serde(with = "humantime_serde")]
    pub report_accept_timeout: Duration,
    /// How often the serve loop re-checks pending signals while idle
    #[serde(with = "humantime_serde")]
    pub serve_tick: Duration,
    /// Liveness probes after detaching a daemon
    pub daemon_start_probe: PollBudget,
    /// Exit probes after signalling a daemon
    pub daemon_stop_probe: PollBudget,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            start_probe: PollBudget::new(3, Duration::from_millis(200)),
            stop_probe: PollBudget::new(10, Duration::from_millis(500)),
            report_send_timeout: Duration::from_millis(200),
            report_accept_timeout: Duration::from_millis(500),
            serve_tick: Duration::from_millis(50),
            daemon_start_probe: PollBudget::new(3, Duration::from_secs(1)),
            daemon_stop_probe: PollBudget::new(20, Duration::from_millis(500)),
        }
    }
}

impl Timings {
    /// Short budgets for tests.
    pub fn fast() -> Self {
        Self {
            start_probe: PollBudget::new(5, Duration::from_millis(20)),
            stop_probe: PollBudget::new(50, Duration::from_millis(20)),
            report_send_timeout: Duration::from_millis(200),
            report_accept_timeout: Duration::from_millis(500),
            serve_tick: Duration::from_millis(10),
            daemon_start_probe: PollBudget::new(50, Duration::from_millis(20)),
            daemon_stop_probe: PollBudget::new(100, Duration::from_millis(20)),
        }
    }
}

/// `Duration` as a humantime string (`"200ms"`, `"1s"`).
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_for_stops_at_success() {
        let budget = PollBudget::new(5, Duration::from_millis(1));
        let mut probes = 0;
        assert!(budget.wait_for(|| {
            probes += 1;
            probes == 3
        }));
        assert_eq!(probes, 3);
    }

    #[test]
    fn test_wait_for_exhausts_budget() {
        let budget = PollBudget::new(4, Duration::from_millis(5));
        let started = Instant::now();
        let mut probes = 0;
        assert!(!budget.wait_for(|| {
            probes += 1;
            false
        }));
        assert_eq!(probes, 4);
        assert!(started.elapsed() >= budget.total());
    }

    #[test]
    fn test_timings_from_yaml() {
        let timings: Timings = serde_yaml::from_str(
            "stop_probe: { attempts: 4, interval: 250ms }\nreport_accept_timeout: 1s\n",
        )
        .unwrap();
        assert_eq!(timings.stop_probe, PollBudget::new(4, Duration::from_millis(250)));
        assert_eq!(timings.report_accept_timeout, Duration::from_secs(1));
        assert_eq!(timings.start_probe, Timings::default().start_probe);
    }
}
