//! Runtime configuration loaded from `~/.session-monitor/monitor.toml`.
//!
//! A missing file is not an error: every section falls back to defaults.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::MonitorError;
use crate::pipeline::CommandPipelineConfig;

const DEFAULT_STATE_DIR: &str = ".session-monitor";
const DEFAULT_CONFIG_FILE: &str = "monitor.toml";
const DEFAULT_STORE_FILE: &str = "sessions.db";

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pipeline: CommandPipelineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scheduler tuning.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Age after which a claim is treated as abandoned and may be taken over.
    #[serde(default = "default_stale_claim_after_secs")]
    pub stale_claim_after_secs: u64,
    /// Scheduled attempts per record. `0` disables the cap.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            stale_claim_after_secs: default_stale_claim_after_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn attempt_cap(&self) -> Option<u32> {
        (self.max_attempts > 0).then_some(self.max_attempts)
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    5
}

fn default_stale_claim_after_secs() -> u64 {
    600
}

fn default_max_attempts() -> u32 {
    5
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> Result<PathBuf, MonitorError> {
        match &self.path {
            Some(path) => Ok(path.clone()),
            None => default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// When set, logs are also written to daily files in this directory.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

fn state_dir() -> Result<PathBuf, MonitorError> {
    let home = dirs::home_dir().ok_or_else(|| MonitorError::Config {
        path: PathBuf::from("~"),
        details: "Home directory not found".to_string(),
    })?;
    Ok(home.join(DEFAULT_STATE_DIR))
}

pub fn default_config_path() -> Result<PathBuf, MonitorError> {
    Ok(state_dir()?.join(DEFAULT_CONFIG_FILE))
}

pub fn default_store_path() -> Result<PathBuf, MonitorError> {
    Ok(state_dir()?.join(DEFAULT_STORE_FILE))
}

pub fn load_runtime_config(path: Option<PathBuf>) -> Result<RuntimeConfig, MonitorError> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(RuntimeConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| MonitorError::Config {
        path: config_path.clone(),
        details: format!("Failed to read config: {}", err),
    })?;
    let config = toml::from_str::<RuntimeConfig>(&content).map_err(|err| MonitorError::Config {
        path: config_path.clone(),
        details: format!("Failed to parse config: {}", err),
    })?;

    if config.monitor.batch_size == 0 {
        return Err(MonitorError::Config {
            path: config_path,
            details: "monitor.batch_size must be at least 1".to_string(),
        });
    }
    if config.monitor.poll_interval_secs == 0 {
        return Err(MonitorError::Config {
            path: config_path,
            details: "monitor.poll_interval_secs must be at least 1".to_string(),
        });
    }
    // A claim must outlive the pipeline run, or a slow run looks abandoned.
    if config.pipeline.timeout_secs >= config.monitor.stale_claim_after_secs {
        return Err(MonitorError::Config {
            path: config_path,
            details: format!(
                "pipeline.timeout_secs ({}) must be below monitor.stale_claim_after_secs ({})",
                config.pipeline.timeout_secs, config.monitor.stale_claim_after_secs
            ),
        });
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().expect("tempdir");
        let config =
            load_runtime_config(Some(dir.path().join("absent.toml"))).expect("load config");
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.monitor.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.monitor.batch_size, 5);
        assert_eq!(config.monitor.attempt_cap(), Some(5));
        assert_eq!(config.pipeline.timeout_secs, 120);
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("monitor.toml");
        fs_err::write(
            &path,
            r#"
[monitor]
poll_interval_secs = 5
max_attempts = 0

[store]
path = "/var/lib/sessions.db"

[pipeline]
program = "/usr/local/bin/analyze-session"
args = ["--notify"]
"#,
        )
        .expect("write config");

        let config = load_runtime_config(Some(path)).expect("load config");
        assert_eq!(config.monitor.poll_interval_secs, 5);
        assert_eq!(config.monitor.batch_size, 5);
        assert_eq!(config.monitor.stale_claim_after_secs, 600);
        assert_eq!(config.monitor.attempt_cap(), None);
        assert_eq!(
            config.store.resolved_path().expect("store path"),
            PathBuf::from("/var/lib/sessions.db")
        );
        assert_eq!(
            config.pipeline.program.as_deref(),
            Some("/usr/local/bin/analyze-session")
        );
        assert_eq!(config.pipeline.args, vec!["--notify".to_string()]);
        assert!(config.logging.directory.is_none());
    }

    #[test]
    fn invalid_toml_reports_path() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("monitor.toml");
        fs_err::write(&path, "[monitor\npoll_interval_secs = ").expect("write config");

        let err = load_runtime_config(Some(path.clone())).expect_err("parse failure");
        match err {
            MonitorError::Config { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("monitor.toml");
        fs_err::write(&path, "[monitor]\nbatch_size = 0\n").expect("write config");

        assert!(matches!(
            load_runtime_config(Some(path)),
            Err(MonitorError::Config { .. })
        ));
    }

    #[test]
    fn pipeline_timeout_must_be_shorter_than_stale_threshold() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("monitor.toml");
        fs_err::write(
            &path,
            "[monitor]\nstale_claim_after_secs = 60\n\n[pipeline]\ntimeout_secs = 60\n",
        )
        .expect("write config");

        match load_runtime_config(Some(path.clone())) {
            Err(MonitorError::Config { path: reported, details }) => {
                assert_eq!(reported, path);
                assert!(details.contains("stale_claim_after_secs"));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        fs_err::write(
            &path,
            "[monitor]\nstale_claim_after_secs = 61\n\n[pipeline]\ntimeout_secs = 60\n",
        )
        .expect("write config");
        assert!(load_runtime_config(Some(path)).is_ok());
    }
}
