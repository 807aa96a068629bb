//! Configuration (`conveyor.toml` + environment overrides).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "conveyor.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// How the status client of a run reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportingMode {
    /// Into the run's own transaction.
    #[default]
    Local,
    /// Over HTTP to the ingestion endpoint.
    Remote,
}

impl std::str::FromStr for ReportingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            _ => Err(ConfigError::InvalidValue {
                key: "reporting",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConveyorConfig {
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub ingest: IngestConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Task-database identifier sent with remote pushes.
    pub database: String,
    pub reporting: ReportingMode,
    /// Outbound base URL of the ingestion endpoint (remote mode).
    pub base_url: Option<String>,
    pub http_timeout_secs: u64,
    /// Mirror stage/log lines of runs into tracing.
    pub mirror_logs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database: "conveyor".to_string(),
            reporting: ReportingMode::Local,
            base_url: None,
            http_timeout_secs: 120,
            mirror_logs: false,
        }
    }
}

impl EngineConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    pub path_prefix: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            path_prefix: "/conveyor".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl ConveyorConfig {
    pub fn from_toml_str(s: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&s, path)
    }

    /// Explicit path, else `./conveyor.toml` when present, else defaults;
    /// then `CONVEYOR_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let local = Path::new(DEFAULT_CONFIG_FILE);
                if local.exists() {
                    Self::from_file(local)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    /// Apply overrides from `lookup`; blank values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CONVEYOR_DATABASE") {
            self.engine.database = v.trim().to_string();
        }
        if let Some(v) = get("CONVEYOR_REPORTING") {
            self.engine.reporting = v.parse()?;
        }
        if let Some(v) = get("CONVEYOR_BASE_URL") {
            self.engine.base_url = Some(v.trim().to_string());
        }
        if let Some(v) = get("CONVEYOR_LOG_LEVEL") {
            self.logging.level = v.trim().to_string();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = ConveyorConfig::default();
        assert_eq!(cfg.engine.reporting, ReportingMode::Local);
        assert_eq!(cfg.engine.http_timeout(), Duration::from_secs(120));
        assert_eq!(cfg.scheduler.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.ingest.path_prefix, "/conveyor");
        assert_eq!(cfg.ingest.port, 0);
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[engine]
database = "prod"
reporting = "remote"
base_url = "http://erp:8069/conveyor"

[scheduler]
poll_interval_ms = 250
"#
        )
        .unwrap();

        let cfg = ConveyorConfig::from_file(file.path()).unwrap();
        assert_eq!(cfg.engine.database, "prod");
        assert_eq!(cfg.engine.reporting, ReportingMode::Remote);
        assert_eq!(cfg.engine.base_url.as_deref(), Some("http://erp:8069/conveyor"));
        assert_eq!(cfg.engine.http_timeout_secs, 120);
        assert_eq!(cfg.scheduler.poll_interval_ms, 250);
        assert_eq!(cfg.ingest, IngestConfig::default());
    }

    #[test]
    fn invalid_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nreporting = \"carrier-pigeon\"").unwrap();

        let err = ConveyorConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConveyorConfig::load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn env_overrides_apply_and_blank_is_ignored() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CONVEYOR_DATABASE", "staging"),
            ("CONVEYOR_REPORTING", "Remote"),
            ("CONVEYOR_BASE_URL", "  "),
            ("CONVEYOR_LOG_LEVEL", "debug"),
        ]);
        let mut cfg = ConveyorConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(cfg.engine.database, "staging");
        assert_eq!(cfg.engine.reporting, ReportingMode::Remote);
        assert_eq!(cfg.engine.base_url, None);
        assert_eq!(cfg.logging.level, "debug");
    }

    #[test]
    fn bad_reporting_override_is_rejected() {
        let mut cfg = ConveyorConfig::default();
        let err = cfg
            .apply_env(|k| (k == "CONVEYOR_REPORTING").then(|| "smoke".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "reporting", .. }));
    }
}
