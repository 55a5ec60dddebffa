//! Prompt templates: YAML defaults, tenant and user overrides, and `{name}`
//! interpolation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::db::Database;
use crate::error::ConfigError;
use crate::models::ConfigScope;

pub const SYSTEM_BASE: &str = "alice.system.base";
pub const SYSTEM_RESEARCH: &str = "alice.system.research";
pub const TASK_SUMMARY: &str = "alice.task.summary";
pub const TASK_REPORT: &str = "alice.task.report";
pub const AGENT_PLANNER_SYSTEM: &str = "alice.agent.planner_system";
pub const AGENT_PLANNER_USER: &str = "alice.agent.planner_user";
pub const AGENT_REACT: &str = "alice.agent.react";
pub const AGENT_NEXT_STEP: &str = "alice.agent.next_step";
pub const AGENT_FINAL_ANSWER: &str = "alice.agent.final_answer";

/// Old short keys still accepted by callers and stored overrides.
const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("chat", "alice.task.chat"),
    ("summary", TASK_SUMMARY),
    ("knowledge", "alice.task.knowledge"),
    ("mindmap", "alice.task.mindmap"),
    ("tagger", "alice.task.tagger"),
    ("context_compress", "alice.task.context_compress"),
    ("system", SYSTEM_BASE),
    ("research", SYSTEM_RESEARCH),
    ("asr", "alice.task.asr"),
    ("summary_quick", "alice.task.summary_quick"),
    ("tagger_concepts", "alice.task.tagger_concepts"),
    ("report", TASK_REPORT),
];

/// Templates compiled in so the agent works without a prompts document.
const BUILTIN: &[(&str, &str)] = &[
    (
        SYSTEM_BASE,
        "You are {name}, a personal assistant for the user's video and podcast library. \
Answer from the user's processed content when it is relevant and say so when it is not.",
    ),
    (
        SYSTEM_RESEARCH,
        "You are a careful research analyst. Combine the user's library with web sources \
and cite where each claim comes from.",
    ),
    (
        TASK_SUMMARY,
        crate::pipeline::DEFAULT_ANALYSIS_PROMPT,
    ),
    (
        TASK_REPORT,
        "Write a well-structured {format} report on the topic below. Use the notes when \
given and do not invent facts.\n\nTopic: {topic}\n\nNotes:\n{notes}",
    ),
    (
        AGENT_PLANNER_SYSTEM,
        "You break a user request into a short plan. Reply with JSON only: \
{\"title\": \"...\", \"steps\": [\"...\"]}. Use at most 10 steps. Steps describe \
intent, not tool calls.",
    ),
    (
        AGENT_PLANNER_USER,
        "Available tools:\n{tools_description}\n\nRequest: {query}",
    ),
    (
        AGENT_REACT,
        "## Plan\n{plan}\n\n## Tools\n{tools}\n\n## Reply format\nReply with one JSON object \
and nothing else. To call a tool:\n\
{\"thought\": \"...\", \"action\": \"tool_name\", \"action_input\": {\"param\": \"value\"}}\n\
To answer:\n{\"thought\": \"...\", \"final_answer\": \"...\"}",
    ),
    (
        AGENT_NEXT_STEP,
        "User question: {query}\n\n{observations}\n\nDecide the next action. Call a tool if \
you need more information, otherwise give the final answer.",
    ),
    (
        AGENT_FINAL_ANSWER,
        "User question: {query}\n\nObservations so far:\n{observations}\n\nNo more tools can \
be called. Please produce a final answer from what is known.",
    ),
];

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Canonical key for `key`.
pub fn canonical_key(key: &str) -> &str {
    LEGACY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(key)
}

fn legacy_alias(canonical: &str) -> Option<&'static str> {
    LEGACY_ALIASES
        .iter()
        .find(|(_, c)| *c == canonical)
        .map(|(alias, _)| *alias)
}

/// Replace `{name}` placeholders from `vars`.
///
/// When any placeholder has no value the template comes back unchanged.
/// Braces that are not placeholders (JSON examples) are left alone.
pub fn interpolate(template: &str, vars: &HashMap<String, String>) -> String {
    if vars.is_empty() {
        return template.to_string();
    }
    let complete = PLACEHOLDER
        .captures_iter(template)
        .all(|caps| vars.contains_key(&caps[1]));
    if !complete {
        return template.to_string();
    }
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| vars[&caps[1]].clone())
        .into_owned()
}

/// Config-store key holding a prompt override.
pub fn override_key(key: &str) -> String {
    format!("prompt.{}", key)
}

pub struct PromptStore {
    prompts: BTreeMap<String, String>,
    db: Option<Arc<dyn Database>>,
}

impl PromptStore {
    /// `prompts` from the YAML document layered over the compiled-in defaults.
    pub fn new(prompts: BTreeMap<String, String>) -> Self {
        let mut merged: BTreeMap<String, String> = BUILTIN
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (key, value) in prompts {
            merged.insert(canonical_key(&key).to_string(), value);
        }
        Self { prompts: merged, db: None }
    }

    pub fn with_store(mut self, db: Arc<dyn Database>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn keys(&self) -> Vec<&str> {
        self.prompts.keys().map(String::as_str).collect()
    }

    /// YAML (or compiled-in) template, ignoring overrides.
    pub fn get_default(&self, key: &str) -> Option<&str> {
        self.prompts.get(canonical_key(key)).map(String::as_str)
    }

    async fn stored(&self, scope: ConfigScope, key: &str) -> Option<String> {
        let db = self.db.as_ref()?;
        let mut candidates = vec![override_key(key)];
        if let Some(alias) = legacy_alias(key) {
            candidates.push(override_key(alias));
        }
        for candidate in candidates {
            match db.get_config_value(scope, &candidate).await {
                Ok(Some(value)) if !value.trim().is_empty() => return Some(value),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key, kind = %e.kind(), "Prompt override lookup failed: {}", e);
                    return None;
                }
            }
        }
        None
    }

    /// Resolve `key` (user override, tenant override, default) and fill in `vars`.
    pub async fn get(
        &self,
        key: &str,
        tenant_id: Option<i64>,
        user_id: Option<i64>,
        vars: &HashMap<String, String>,
    ) -> Result<String, ConfigError> {
        let key = canonical_key(key);
        let mut template = None;
        if let Some(user_id) = user_id {
            template = self.stored(ConfigScope::User(user_id), key).await;
        }
        if template.is_none()
            && let Some(tenant_id) = tenant_id
        {
            template = self.stored(ConfigScope::Tenant(tenant_id), key).await;
        }
        let template = match template {
            Some(t) => t,
            None => self
                .prompts
                .get(key)
                .cloned()
                .ok_or_else(|| ConfigError::PromptNotFound(key.to_string()))?,
        };
        Ok(interpolate(&template, vars))
    }
}

/// Build a variables map from pairs.
pub fn vars<const N: usize>(pairs: [(&str, &str); N]) -> HashMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
