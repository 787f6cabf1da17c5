//! Aggregate reports and the internal collection socket.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read};
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use herd_core::{Address, HerdError, Result, format_timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ACCEPT_POLL: Duration = Duration::from_millis(5);

/// What the public report socket answers with.
///
/// A failed collection carries only `success: false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Whole seconds since `started_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<i64>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances_count: Option<usize>,
    /// Worker payloads keyed by instance name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instances: Option<BTreeMap<String, Value>>,
}

impl PoolReport {
    /// An empty successful report for a pool started at `started_at`.
    pub fn new(started_at: DateTime<Local>, instances_count: usize) -> Self {
        Self {
            started_at: Some(format_timestamp(started_at)),
            online: Some((Local::now() - started_at).num_seconds()),
            success: true,
            instances_count: Some(instances_count),
            instances: Some(BTreeMap::new()),
        }
    }

    pub fn failed() -> Self {
        Self {
            started_at: None,
            online: None,
            success: false,
            instances_count: None,
            instances: None,
        }
    }

    /// Store a worker payload under its own `name`, or `fallback` when it has none.
    pub fn insert(&mut self, fallback: &str, payload: Value) {
        let key = payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(fallback)
            .to_string();
        self.instances.get_or_insert_with(BTreeMap::new).insert(key, payload);
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"success":false}"#.to_string())
    }
}

/// Listener on the incoming address for the duration of one collection.
pub struct ReportCollector {
    listener: TcpListener,
    address: Address,
    timeout: Duration,
}

impl ReportCollector {
    /// Bind the incoming address. `timeout` bounds each [`receive`](Self::receive).
    pub fn bind(address: &Address, timeout: Duration) -> Result<Self> {
        let target = address.resolve()?;
        let listener = TcpListener::bind(target).map_err(|source| HerdError::Bind {
            address: address.to_string(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|e| HerdError::socket("configure", address, e))?;

        Ok(Self {
            listener,
            address: address.clone(),
            timeout,
        })
    }

    /// Accept one worker connection and parse what it sends.
    pub fn receive(&self, name: &str) -> Result<Value> {
        let deadline = Instant::now() + self.timeout;
        let mut stream = loop {
            match self.listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(HerdError::ReportTimeout {
                            name: name.to_string(),
                            timeout_ms: self.timeout.as_millis() as u64,
                        });
                    }
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(HerdError::socket("accept", &self.address, e)),
            }
        };

        stream
            .set_nonblocking(false)
            .and_then(|()| stream.set_read_timeout(Some(self.timeout)))
            .map_err(|e| HerdError::socket("configure", &self.address, e))?;

        let mut body = Vec::new();
        stream
            .read_to_end(&mut body)
            .map_err(|e| HerdError::socket("read", &self.address, e))?;

        serde_json::from_slice(&body).map_err(|e| HerdError::json_parse(format!("report from {name}"), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::net::TcpStream;

    fn free_address() -> Address {
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        Address::from(probe.local_addr().unwrap())
    }

    #[test]
    fn test_failed_report_shape() {
        assert_eq!(PoolReport::failed().to_json(), r#"{"success":false}"#);
    }

    #[test]
    fn test_insert_prefers_payload_name() {
        let mut report = PoolReport::new(Local::now(), 2);
        report.insert("web-1", json!({"name": "web-2", "pid": 2}));
        report.insert("web-1", json!({"pid": 1}));

        let instances = report.instances.unwrap();
        assert_eq!(instances["web-2"]["pid"], 2);
        assert_eq!(instances["web-1"]["pid"], 1);
    }

    #[test]
    fn test_report_fields() {
        let value: Value = serde_json::from_str(&PoolReport::new(Local::now(), 0).to_json()).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["instances_count"], 0);
        assert_eq!(value["online"], 0);
        assert!(value["instances"].as_object().unwrap().is_empty());
        assert!(value["started_at"].is_string());
    }

    #[test]
    fn test_receive_payload() {
        let address = free_address();
        let collector = ReportCollector::bind(&address, Duration::from_millis(500)).unwrap();

        let target = address.resolve().unwrap();
        let sender = thread::spawn(move || {
            let mut stream = TcpStream::connect(target).unwrap();
            stream.write_all(br#"{"name": "web-1", "report": {"status": 100}}"#).unwrap();
        });

        let payload = collector.receive("web-1").unwrap();
        sender.join().unwrap();
        assert_eq!(payload["report"]["status"], 100);
    }

    #[test]
    fn test_receive_timeout() {
        let collector = ReportCollector::bind(&free_address(), Duration::from_millis(50)).unwrap();
        let err = collector.receive("web-3").unwrap_err();
        assert!(matches!(err, HerdError::ReportTimeout { timeout_ms: 50, .. }));
    }

    #[test]
    fn test_receive_garbage() {
        let address = free_address();
        let collector = ReportCollector::bind(&address, Duration::from_millis(500)).unwrap();

        let target = address.resolve().unwrap();
        let sender = thread::spawn(move || {
            let mut stream = TcpStream::connect(target).unwrap();
            stream.write_all(b"not json").unwrap();
        });

        let err = collector.receive("web-1").unwrap_err();
        sender.join().unwrap();
        assert!(matches!(err, HerdError::JsonParse { .. }));
    }
}
