//! Typed forms of the four control-plane YAML documents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::Scene;
use crate::tools::ToolCategory;

/// Kind of model a profile describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Chat,
    Embedding,
    Asr,
}

/// Token bucket parameters for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub capacity: u32,
    pub refill_per_sec: f64,
}

/// One entry of `models.yaml` → `profiles`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub kind: ModelKind,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dim: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Profile id (e.g. `alice.chat.main`) to profile.
    #[serde(default)]
    pub profiles: BTreeMap<String, ModelProfile>,
    /// Task type to profile id.
    #[serde(default)]
    pub task_defaults: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptsConfig {
    #[serde(default)]
    pub prompts: BTreeMap<String, String>,
}

/// One entry of `tools.yaml` → `tools`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    pub name: String,
    /// Symbolic key into the compile-time tool catalogue.
    #[serde(rename = "impl")]
    pub impl_key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(rename = "unsafe", default)]
    pub is_unsafe: bool,
    /// Scenes the tool is declared for. Empty means every scene.
    #[serde(default)]
    pub scenes: Vec<Scene>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ToolCategory>,
}

fn default_true() -> bool {
    true
}

impl ToolEntry {
    pub fn declared_for(&self, scene: Scene) -> bool {
        self.scenes.is_empty() || self.scenes.contains(&scene)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub tools: Vec<ToolEntry>,
    /// Tool names offered by default per scene.
    #[serde(default)]
    pub scene_defaults: BTreeMap<Scene, Vec<String>>,
}

impl ToolsConfig {
    pub fn entry(&self, name: &str) -> Option<&ToolEntry> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// One entry of `services.yaml` → `services`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicesConfig {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceEntry>,
    /// Provider id to implementation key registered at startup.
    #[serde(default)]
    pub providers: BTreeMap<String, String>,
}

/// All four documents, loaded together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ControlPlaneConfig {
    pub models: ModelsConfig,
    pub prompts: PromptsConfig,
    pub tools: ToolsConfig,
    pub services: ServicesConfig,
}
