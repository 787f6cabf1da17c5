//! Data types shared between instances, services and the pool.

use serde::{Deserialize, Serialize};

/// Payload a worker pushes to the report address on `SIGUSR1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Worker process id
    pub pid: i32,
    /// Whether the worker has been asked to stop
    pub stopped: bool,
    /// Worker start time, `dd.mm.YYYY HH:MM:SS TZ`
    pub started_at: String,
    /// Whole seconds since `started_at`
    pub online: i64,
    /// Handler label
    pub handler: String,
    /// Instance name, `<service>-<seq>`
    pub name: String,
    /// Whatever the handler reported
    pub report: serde_json::Value,
}

/// Snapshot of one live instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub pid: Option<i32>,
    pub name: String,
    pub reported_count: u64,
}

/// Lifecycle transitions an instance announces to its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Started,
    Stopped,
}

/// A [`Lifecycle`] transition of the instance with sequence number `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub seq: u32,
    pub state: Lifecycle,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_report_fields() {
        let report = WorkerReport {
            pid: 4242,
            stopped: false,
            started_at: "01.02.2026 10:00:00 +00:00".into(),
            online: 12,
            handler: "Ticker".into(),
            name: "web-1".into(),
            report: json!({"status": 100}),
        };

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["pid"], 4242);
        assert_eq!(value["name"], "web-1");
        assert_eq!(value["report"]["status"], 100);
        assert_eq!(value.as_object().unwrap().len(), 7);
    }
}
