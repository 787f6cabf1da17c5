//! Dotted-namespace lookup over a YAML settings document.

use std::path::{Path, PathBuf};

use herd_core::{HerdError, Result};
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use tracing::debug;

/// A loaded settings document.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    root: Value,
    source: Option<PathBuf>,
}

impl Settings {
    /// Load settings from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                HerdError::config_not_found_with_source(path, e)
            } else {
                HerdError::io("reading settings", path, e)
            }
        })?;

        let root: Value = serde_yaml::from_str(&raw).map_err(|e| HerdError::ConfigInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        debug!(path = %path.display(), "settings loaded");
        Ok(Self {
            root,
            source: Some(path.to_path_buf()),
        })
    }

    /// Parse settings from a YAML string.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let root = serde_yaml::from_str(raw).map_err(|e| HerdError::ConfigInvalid {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        Ok(Self { root, source: None })
    }

    /// File the settings were read from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Raw value at `namespace`.
    pub fn get(&self, namespace: &str) -> Option<&Value> {
        namespace
            .split('.')
            .filter(|key| !key.is_empty())
            .try_fold(&self.root, |node, key| node.get(key))
    }

    /// Whether anything is configured at `namespace`.
    pub fn contains(&self, namespace: &str) -> bool {
        self.get(namespace).is_some_and(|v| !v.is_null())
    }

    /// Deserialize the section at `namespace`. `Ok(None)` when it is absent.
    pub fn section<T: DeserializeOwned>(&self, namespace: &str) -> Result<Option<T>> {
        match self.get(namespace) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_yaml::from_value(value.clone())
                .map(Some)
                .map_err(|e| HerdError::ConfigSection {
                    namespace: namespace.to_string(),
                    message: e.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::{DaemonConfig, PoolConfig};
    use std::io::Write;

    const SAMPLE: &str = r#"
daemon:
  herd:
    daemonise: true
    pid: /tmp/herd-test.pid
    umask: "022"
pool:
  web:
    report:
      incoming: ["127.0.0.1", 8881]
      outgoing: ["127.0.0.1", 8880]
"#;

    #[test]
    fn test_nested_lookup() {
        let settings = Settings::from_yaml(SAMPLE).unwrap();
        assert!(settings.contains("pool.web.report"));
        assert!(!settings.contains("pool.api"));
        assert_eq!(
            settings.get("pool.web.report.incoming").and_then(|v| v.get(1)).and_then(Value::as_u64),
            Some(8881)
        );
    }

    #[test]
    fn test_typed_sections() {
        let settings = Settings::from_yaml(SAMPLE).unwrap();

        let daemon: DaemonConfig = settings.section("daemon.herd").unwrap().unwrap();
        assert!(daemon.daemonise);
        assert_eq!(daemon.umask_bits().unwrap(), Some(0o022));

        let pool: PoolConfig = settings.section("pool.web").unwrap().unwrap();
        let report = pool.report.unwrap();
        assert_eq!(report.outgoing.port, 8880);

        let missing: Option<PoolConfig> = settings.section("pool.api").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_invalid_section() {
        let settings = Settings::from_yaml("pool:\n  web:\n    report: 12\n").unwrap();
        let err = settings.section::<PoolConfig>("pool.web").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.source(), Some(file.path()));
        assert!(settings.contains("daemon.herd"));

        let err = Settings::from_file("/nonexistent/herd.yaml").unwrap_err();
        assert!(matches!(err, HerdError::ConfigNotFound { .. }));
    }
}
