//! Per-tenant persona and tool scopes read from `alice.*` config keys.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::control_plane::{PromptStore, SYSTEM_BASE};
use crate::db::Database;
use crate::error::ConfigError;
use crate::models::{ConfigScope, Scene};

const KEY_PREFIX: &str = "alice.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaStyle {
    #[default]
    Friendly,
    Professional,
    Coach,
}

impl PersonaStyle {
    fn describe(&self) -> &'static str {
        match self {
            Self::Friendly => "You are warm and approachable, like a friend helping out.",
            Self::Professional => "You are precise and rigorous, and care about accuracy and depth.",
            Self::Coach => "You guide the user to think for themselves, asking questions that lead to insight.",
        }
    }
}

impl std::str::FromStr for PersonaStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "friendly" => Ok(Self::Friendly),
            "professional" => Ok(Self::Professional),
            "coach" => Ok(Self::Coach),
            other => Err(format!("unknown persona style '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub description: String,
    pub style: PersonaStyle,
    pub language: String,
    pub custom_instructions: Option<String>,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: "Alice".to_string(),
            description: "your personal learning assistant".to_string(),
            style: PersonaStyle::Friendly,
            language: "en".to_string(),
            custom_instructions: None,
        }
    }
}

/// Resolved identity for one tenant and scene.
#[derive(Debug, Clone)]
pub struct Identity {
    pub persona: Persona,
    pub system_prompt: String,
    /// Tools the tenant allows in this scene.
    pub allowed_tools: BTreeSet<String>,
    pub tool_scopes: BTreeMap<String, Vec<String>>,
}

/// Scene tool scopes used when the tenant configures none.
pub fn default_tool_scopes() -> BTreeMap<String, Vec<String>> {
    let scope = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    BTreeMap::from([
        (
            "chat".to_string(),
            scope(&["ask_video", "search_videos", "get_video_summary", "current_time", "submit_content"]),
        ),
        (
            "research".to_string(),
            scope(&[
                "ask_video",
                "search_videos",
                "search_graph",
                "deep_web_research",
                "generate_report",
                "current_time",
            ]),
        ),
        (
            "timeline".to_string(),
            scope(&["timeline_query", "get_timeline_summary", "search_videos", "current_time"]),
        ),
        (
            "library".to_string(),
            scope(&["search_videos", "get_video_summary", "ask_video", "submit_content", "current_time"]),
        ),
        (
            "video".to_string(),
            scope(&["ask_video", "get_video_summary", "current_time"]),
        ),
        (
            "graph".to_string(),
            scope(&["search_graph", "search_videos", "current_time"]),
        ),
        (
            "console".to_string(),
            scope(&[
                "ask_video",
                "search_videos",
                "get_video_summary",
                "search_graph",
                "timeline_query",
                "get_timeline_summary",
                "deep_web_research",
                "generate_report",
                "submit_content",
                "http_request",
                "current_time",
                "echo",
                "sleep",
                "shell",
            ]),
        ),
    ])
}

/// Parse a stored value that may be JSON or a comma-separated list.
fn parse_list(raw: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(list) => list,
        Err(_) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

pub struct IdentityService {
    db: Arc<dyn Database>,
    prompts: Arc<PromptStore>,
}

impl IdentityService {
    pub fn new(db: Arc<dyn Database>, prompts: Arc<PromptStore>) -> Self {
        Self { db, prompts }
    }

    pub async fn get_identity(
        &self,
        tenant_id: i64,
        user_id: Option<i64>,
        scene: Scene,
    ) -> Result<Identity, ConfigError> {
        let values: BTreeMap<String, String> = match self
            .db
            .list_config_values(ConfigScope::Tenant(tenant_id), KEY_PREFIX)
            .await
        {
            Ok(pairs) => pairs
                .into_iter()
                .filter_map(|(k, v)| k.strip_prefix(KEY_PREFIX).map(|sub| (sub.to_string(), v)))
                .collect(),
            Err(e) => {
                tracing::warn!(tenant_id, kind = %e.kind(), "Tenant identity config unavailable, using defaults: {}", e);
                BTreeMap::new()
            }
        };

        let defaults = Persona::default();
        let persona = Persona {
            name: values.get("name").cloned().unwrap_or(defaults.name),
            description: values.get("description").cloned().unwrap_or(defaults.description),
            style: match values.get("style") {
                Some(raw) => raw.parse().unwrap_or_else(|e| {
                    tracing::warn!(tenant_id, "{}, using friendly", e);
                    PersonaStyle::Friendly
                }),
                None => defaults.style,
            },
            language: values.get("language").cloned().unwrap_or(defaults.language),
            custom_instructions: values
                .get("custom_instructions")
                .filter(|s| !s.trim().is_empty())
                .cloned(),
        };

        let tool_scopes = match values.get("tool_scopes") {
            Some(raw) => serde_json::from_str::<BTreeMap<String, Vec<String>>>(raw).map_err(|e| {
                ConfigError::Invalid(format!("alice.tool_scopes for tenant {}: {}", tenant_id, e))
            })?,
            None => default_tool_scopes(),
        };

        let scoped: Vec<String> = tool_scopes
            .get(scene.as_str())
            .or_else(|| tool_scopes.get(Scene::Chat.as_str()))
            .cloned()
            .unwrap_or_default();
        let allowed_tools: BTreeSet<String> = match values.get("enabled_tools") {
            Some(raw) => {
                let enabled: BTreeSet<String> = parse_list(raw).into_iter().collect();
                scoped.into_iter().filter(|t| enabled.contains(t)).collect()
            }
            None => scoped.into_iter().collect(),
        };

        let system_prompt = self.render(&persona, tenant_id, user_id).await?;
        Ok(Identity {
            persona,
            system_prompt,
            allowed_tools,
            tool_scopes,
        })
    }

    async fn render(
        &self,
        persona: &Persona,
        tenant_id: i64,
        user_id: Option<i64>,
    ) -> Result<String, ConfigError> {
        let vars = std::collections::HashMap::from([
            ("name".to_string(), persona.name.clone()),
            ("description".to_string(), persona.description.clone()),
            ("language".to_string(), persona.language.clone()),
        ]);
        let base = self
            .prompts
            .get(SYSTEM_BASE, Some(tenant_id), user_id, &vars)
            .await?;

        let mut prompt = format!(
            "{}\n\n## About you\n{} is {}.\n\n## Style\n{}\nReply in the user's language (default: {}). \
Keep answers concise, say which video a fact comes from, and admit when you do not know.",
            base.trim_end(),
            persona.name,
            persona.description,
            persona.style.describe(),
            persona.language
        );
        if let Some(extra) = &persona.custom_instructions {
            prompt.push_str("\n\n## Special instructions\n");
            prompt.push_str(extra);
        }
        Ok(prompt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDatabase;
    use pretty_assertions::assert_eq;

    fn service(db: Arc<InMemoryDatabase>) -> IdentityService {
        IdentityService::new(db, Arc::new(PromptStore::new(BTreeMap::new())))
    }

    #[tokio::test]
    async fn test_defaults() {
        let db = Arc::new(InMemoryDatabase::new());
        let identity = service(db).get_identity(1, None, Scene::Research).await.unwrap();
        assert_eq!(identity.persona, Persona::default());
        assert!(identity.system_prompt.starts_with("You are Alice"));
        assert!(identity.allowed_tools.contains("deep_web_research"));
        assert!(!identity.allowed_tools.contains("shell"));
    }

    #[tokio::test]
    async fn test_tenant_persona_and_enabled_tools() {
        let db = Arc::new(InMemoryDatabase::new());
        let scope = ConfigScope::Tenant(3);
        db.set_config_value(scope, "alice.name", "Ada").await.unwrap();
        db.set_config_value(scope, "alice.style", "coach").await.unwrap();
        db.set_config_value(scope, "alice.custom_instructions", "Always end with a question.")
            .await
            .unwrap();
        db.set_config_value(scope, "alice.enabled_tools", r#"["ask_video","current_time"]"#)
            .await
            .unwrap();

        let identity = service(db).get_identity(3, None, Scene::Chat).await.unwrap();
        assert_eq!(identity.persona.name, "Ada");
        assert_eq!(identity.persona.style, PersonaStyle::Coach);
        assert!(identity.system_prompt.starts_with("You are Ada"));
        assert!(identity.system_prompt.contains("Always end with a question."));
        assert_eq!(
            identity.allowed_tools.into_iter().collect::<Vec<_>>(),
            vec!["ask_video", "current_time"]
        );
    }

    #[tokio::test]
    async fn test_invalid_scopes_rejected() {
        let db = Arc::new(InMemoryDatabase::new());
        db.set_config_value(ConfigScope::Tenant(1), "alice.tool_scopes", "not json")
            .await
            .unwrap();
        assert!(matches!(
            service(db).get_identity(1, None, Scene::Chat).await,
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_list_accepts_csv() {
        assert_eq!(parse_list("a, b ,,c"), vec!["a", "b", "c"]);
    }
}
