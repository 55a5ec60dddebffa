//! Configuration: layered YAML documents plus application settings.

mod documents;
mod layered;
mod settings;

pub use documents::{
    ControlPlaneConfig, ModelKind, ModelProfile, ModelsConfig, PromptsConfig, RateLimitSpec,
    ServiceEntry, ServicesConfig, ToolEntry, ToolsConfig,
};
pub use layered::{ConfigLoader, ENV_PREFIX, ENV_SEPARATOR, apply_overrides, deep_merge};
pub use settings::{
    AgentSettings, DatabaseSettings, LogFormat, LoggingSettings, PipelineSettings, QueueSettings,
    Settings, SweepSettings, WatcherSettings,
};

use crate::error::ConfigError;

/// Environment variable selecting the middle config layer.
pub const ENV_NAME_VAR: &str = "ALICE_ENV";

/// Default middle layer when `ALICE_ENV` is unset.
pub const DEFAULT_ENV: &str = "development";

impl ControlPlaneConfig {
    /// Load `models`, `prompts`, `tools` and `services` documents.
    pub fn load(loader: &ConfigLoader) -> Result<Self, ConfigError> {
        Ok(Self {
            models: loader.load("models")?,
            prompts: loader.load("prompts")?,
            tools: loader.load("tools")?,
            services: loader.load("services")?,
        })
    }
}

/// Name of the active environment layer.
pub fn current_env() -> String {
    std::env::var(ENV_NAME_VAR).unwrap_or_else(|_| DEFAULT_ENV.to_string())
}
