//! Application settings (`settings.yaml`).

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use super::ConfigLoader;
use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub data_dir: PathBuf,
    /// Process-wide secret used to derive the credential encryption key.
    pub secret_key: Option<SecretString>,
    pub default_tenant: String,
    pub logging: LoggingSettings,
    pub queue: QueueSettings,
    pub pipeline: PipelineSettings,
    pub agent: AgentSettings,
    pub watcher: WatcherSettings,
    pub sweep: SweepSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseSettings::default(),
            data_dir: default_data_dir(),
            secret_key: None,
            default_tenant: "default".to_string(),
            logging: LoggingSettings::default(),
            queue: QueueSettings::default(),
            pipeline: PipelineSettings::default(),
            agent: AgentSettings::default(),
            watcher: WatcherSettings::default(),
            sweep: SweepSettings::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("alice"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

impl Settings {
    /// Load `settings.yaml` through the layered loader.
    pub fn load(loader: &ConfigLoader) -> Result<Self, ConfigError> {
        loader.load("settings")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// Postgres URL. When unset the in-memory store is used.
    pub url: Option<SecretString>,
    pub pool_size: usize,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: None,
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "alice=info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_parallel: usize,
    pub shutdown_wait_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            shutdown_wait_secs: 30,
        }
    }
}

impl QueueSettings {
    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Attempts per stage before the run fails.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub stage_timeout_secs: u64,
    pub chunk_size: usize,
    pub language: Option<String>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 30_000,
            stage_timeout_secs: 30 * 60,
            chunk_size: 500,
            language: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_steps: usize,
    pub max_observation: usize,
    pub tool_timeout_secs: u64,
    pub llm_timeout_secs: u64,
    pub task_timeout_secs: u64,
    pub history_limit: usize,
    pub retrieval_top_k: usize,
    pub score_threshold: f32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_observation: 2000,
            tool_timeout_secs: 60,
            llm_timeout_secs: 300,
            task_timeout_secs: 600,
            history_limit: 10,
            retrieval_top_k: 5,
            score_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatcherSettings {
    pub interval_secs: u64,
    pub drain_interval_secs: u64,
    /// Pending items moved into the queue per drain.
    pub process_batch: usize,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            drain_interval_secs: 60,
            process_batch: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Cron expression (with seconds) for the failed-item sweep.
    pub schedule: String,
    /// Items with `retry_count` below this are reset to pending.
    pub max_retries: u32,
    /// Cron expression for the audio cleanup job.
    pub cleanup_schedule: String,
    pub audio_retention_days: i64,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            schedule: "0 0 3 * * *".to_string(),
            max_retries: 5,
            cleanup_schedule: "0 30 3 * * *".to_string(),
            audio_retention_days: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.queue.max_parallel, 2);
        assert_eq!(settings.agent.max_steps, 10);
        assert_eq!(settings.agent.max_observation, 2000);
        assert_eq!(settings.pipeline.chunk_size, 500);
        assert_eq!(settings.watcher.interval_secs, 300);
        assert!(settings.database.url.is_none());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("base")).unwrap();
        std::fs::write(
            dir.path().join("base/settings.yaml"),
            "queue:\n  max_parallel: 3\nagent:\n  max_steps: 4\n",
        )
        .unwrap();

        let loader = ConfigLoader::new(dir.path(), "test").with_overrides(vec![(
            "ALICE__SETTINGS__PIPELINE__MAX_ATTEMPTS".into(),
            "5".into(),
        )]);
        let settings = Settings::load(&loader).unwrap();

        assert_eq!(settings.queue.max_parallel, 3);
        assert_eq!(settings.queue.shutdown_wait_secs, 30);
        assert_eq!(settings.agent.max_steps, 4);
        assert_eq!(settings.agent.max_observation, 2000);
        assert_eq!(settings.pipeline.max_attempts, 5);
    }
}
