//! Model resolution: which profile, provider and credentials serve a task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::config::{ModelKind, ModelProfile, ModelsConfig, RateLimitSpec};
use crate::crypto::SecretBox;
use crate::db::Database;
use crate::error::{ConfigError, LlmError};
use crate::llm::{GuardedProvider, LlmProvider, OpenAiConfig, OpenAiProvider, RateLimiter};
use crate::models::ConfigScope;
use crate::retrieval::{EmbeddingProvider, MockEmbeddings, OpenAiEmbeddings};

/// Task types callers may resolve.
pub const TASK_TYPES: &[&str] = &[
    "chat", "summary", "embedding", "asr", "tagger", "compress", "planner", "mindmap",
];

/// Last profile tried before giving up.
pub const TERMINAL_FALLBACK: &str = "alice.chat.main";

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Config-store key holding a per-tenant or per-user model override.
pub fn override_key(task_type: &str) -> String {
    format!("model.{}", task_type)
}

const USER_BASE_URL_KEY: &str = "llm.base_url";
const USER_API_KEY_KEY: &str = "llm.api_key";

fn kind_for_task(task_type: &str) -> ModelKind {
    match task_type {
        "embedding" => ModelKind::Embedding,
        "asr" => ModelKind::Asr,
        _ => ModelKind::Chat,
    }
}

/// A profile with runtime connection details merged in.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedModel {
    pub profile_id: String,
    pub provider: String,
    pub model: String,
    pub kind: ModelKind,
    pub max_input_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub embedding_dim: Option<usize>,
    pub base_url: Option<String>,
    #[serde(skip)]
    pub api_key: Option<SecretString>,
    #[serde(skip)]
    pub rate_limit: Option<RateLimitSpec>,
}

impl ResolvedModel {
    fn from_profile(profile_id: &str, profile: &ModelProfile) -> Self {
        Self {
            profile_id: profile_id.to_string(),
            provider: profile.provider.clone(),
            model: profile.model.clone(),
            kind: profile.kind,
            max_input_tokens: profile.max_input_tokens,
            max_output_tokens: profile.max_output_tokens,
            embedding_dim: profile.embedding_dim,
            base_url: profile.base_url.clone(),
            api_key: None,
            rate_limit: profile.rate_limit,
        }
    }

    pub fn base_url_or_default(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }
}

/// Provider credentials from the environment: `<PROVIDER>_API_KEY` and
/// `<PROVIDER>_BASE_URL`, falling back to the `OPENAI_*` pair.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    vars: HashMap<String, String>,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            vars: std::env::vars()
                .filter(|(k, _)| k.ends_with("_API_KEY") || k.ends_with("_BASE_URL"))
                .collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    fn lookup(&self, provider: &str, suffix: &str) -> Option<String> {
        let prefix = provider.to_uppercase().replace(['-', '.'], "_");
        self.vars
            .get(&format!("{}_{}", prefix, suffix))
            .or_else(|| self.vars.get(&format!("OPENAI_{}", suffix)))
            .filter(|v| !v.trim().is_empty())
            .cloned()
    }

    pub fn api_key(&self, provider: &str) -> Option<SecretString> {
        self.lookup(provider, "API_KEY").map(SecretString::from)
    }

    pub fn base_url(&self, provider: &str) -> Option<String> {
        self.lookup(provider, "BASE_URL")
    }

    /// `<PROVIDER>_API_KEY` only, for non-OpenAI-compatible services.
    pub fn own_api_key(&self, provider: &str) -> Option<SecretString> {
        let var = format!("{}_API_KEY", provider.to_uppercase().replace(['-', '.'], "_"));
        self.vars
            .get(&var)
            .filter(|v| !v.trim().is_empty())
            .map(|v| SecretString::from(v.clone()))
    }
}

/// Resolves task types to models: user override, tenant override, task
/// default, first profile of the task's kind, then [`TERMINAL_FALLBACK`].
pub struct ModelResolver {
    config: ModelsConfig,
    credentials: Credentials,
    db: Option<Arc<dyn Database>>,
    secrets: Option<Arc<SecretBox>>,
}

impl ModelResolver {
    pub fn new(config: ModelsConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
            db: None,
            secrets: None,
        }
    }

    /// Enable tenant and user overrides from the config store.
    pub fn with_store(mut self, db: Arc<dyn Database>) -> Self {
        self.db = Some(db);
        self
    }

    /// Decrypt user API keys stored with [`SecretBox`].
    pub fn with_secrets(mut self, secrets: Arc<SecretBox>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn config(&self) -> &ModelsConfig {
        &self.config
    }

    /// Every profile, optionally filtered by kind.
    pub fn list_profiles(&self, kind: Option<ModelKind>) -> Vec<(&str, &ModelProfile)> {
        self.config
            .profiles
            .iter()
            .filter(|(_, p)| kind.is_none_or(|k| p.kind == k))
            .map(|(id, p)| (id.as_str(), p))
            .collect()
    }

    async fn stored_value(&self, scope: ConfigScope, key: &str) -> Option<String> {
        let db = self.db.as_ref()?;
        match db.get_config_value(scope, key).await {
            Ok(value) => value.filter(|v| !v.trim().is_empty()),
            Err(e) => {
                tracing::warn!(key, kind = %e.kind(), "Config override lookup failed: {}", e);
                None
            }
        }
    }

    /// An override value is a profile id, or `provider/model` for an ad-hoc model.
    fn from_override(&self, task_type: &str, value: &str, scope: &str) -> Option<ResolvedModel> {
        if let Some(profile) = self.config.profiles.get(value) {
            return Some(ResolvedModel::from_profile(value, profile));
        }
        let (provider, model) = value.split_once('/')?;
        Some(ResolvedModel {
            profile_id: format!("{}.{}", scope, task_type),
            provider: provider.to_string(),
            model: model.to_string(),
            kind: kind_for_task(task_type),
            max_input_tokens: None,
            max_output_tokens: None,
            embedding_dim: None,
            base_url: None,
            api_key: None,
            rate_limit: None,
        })
    }

    fn default_for(&self, task_type: &str) -> Result<ResolvedModel, ConfigError> {
        let kind = kind_for_task(task_type);
        let profile_id = self
            .config
            .task_defaults
            .get(task_type)
            .filter(|id| self.config.profiles.contains_key(*id))
            .cloned()
            .or_else(|| {
                self.config
                    .profiles
                    .iter()
                    .find(|(_, p)| p.kind == kind)
                    .map(|(id, _)| id.clone())
            })
            .or_else(|| {
                self.config
                    .profiles
                    .contains_key(TERMINAL_FALLBACK)
                    .then(|| TERMINAL_FALLBACK.to_string())
            })
            .ok_or_else(|| ConfigError::Unresolvable(task_type.to_string()))?;

        let profile = self
            .config
            .profiles
            .get(&profile_id)
            .ok_or_else(|| ConfigError::ModelNotFound(profile_id.clone()))?;
        Ok(ResolvedModel::from_profile(&profile_id, profile))
    }

    pub async fn resolve(
        &self,
        task_type: &str,
        tenant_id: Option<i64>,
        user_id: Option<i64>,
    ) -> Result<ResolvedModel, ConfigError> {
        let key = override_key(task_type);
        let mut resolved = None;
        if let Some(user_id) = user_id
            && let Some(value) = self.stored_value(ConfigScope::User(user_id), &key).await
        {
            resolved = self.from_override(task_type, &value, &format!("user.{}", user_id));
        }
        if resolved.is_none()
            && let Some(tenant_id) = tenant_id
            && let Some(value) = self.stored_value(ConfigScope::Tenant(tenant_id), &key).await
        {
            resolved = self.from_override(task_type, &value, &format!("tenant.{}", tenant_id));
        }
        let mut resolved = match resolved {
            Some(r) => r,
            None => self.default_for(task_type)?,
        };

        if resolved.base_url.is_none() {
            resolved.base_url = self.credentials.base_url(&resolved.provider);
        }
        resolved.api_key = self.credentials.api_key(&resolved.provider);

        if let Some(user_id) = user_id {
            let scope = ConfigScope::User(user_id);
            if let Some(url) = self.stored_value(scope, USER_BASE_URL_KEY).await {
                resolved.base_url = Some(url);
            }
            if let Some(stored) = self.stored_value(scope, USER_API_KEY_KEY).await {
                resolved.api_key = Some(SecretString::from(self.reveal(&stored)));
            }
        }

        tracing::debug!(
            task_type,
            profile = %resolved.profile_id,
            provider = %resolved.provider,
            model = %resolved.model,
            "Resolved model"
        );
        Ok(resolved)
    }

    fn reveal(&self, stored: &str) -> String {
        match &self.secrets {
            Some(secrets) => secrets.decrypt(stored).unwrap_or_else(|e| {
                tracing::warn!("Stored API key could not be decrypted: {}", e);
                stored.to_string()
            }),
            None => stored.to_string(),
        }
    }
}

/// Builds providers for resolved models.
pub trait LlmFactory: Send + Sync {
    fn chat(&self, model: &ResolvedModel) -> Result<Arc<dyn LlmProvider>, LlmError>;

    fn embeddings(&self, model: &ResolvedModel) -> Result<Arc<dyn EmbeddingProvider>, LlmError>;
}

/// OpenAI-compatible providers behind a shared per-provider rate limiter.
pub struct DefaultLlmFactory {
    timeout: Duration,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl DefaultLlmFactory {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    fn limiter(&self, model: &ResolvedModel) -> Option<Arc<RateLimiter>> {
        let spec = model.rate_limit?;
        let mut limiters = self.limiters.lock().unwrap_or_else(PoisonError::into_inner);
        Some(Arc::clone(
            limiters
                .entry(model.provider.clone())
                .or_insert_with(|| Arc::new(RateLimiter::new(model.provider.clone(), &spec))),
        ))
    }
}

impl LlmFactory for DefaultLlmFactory {
    fn chat(&self, model: &ResolvedModel) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let inner = OpenAiProvider::new(OpenAiConfig {
            provider: model.provider.clone(),
            model: model.model.clone(),
            base_url: model.base_url_or_default().to_string(),
            api_key: model.api_key.clone(),
            timeout: self.timeout,
            max_output_tokens: model.max_output_tokens,
        })?;
        let mut guarded = GuardedProvider::new(Arc::new(inner), self.timeout);
        if let Some(limiter) = self.limiter(model) {
            guarded = guarded.with_limiter(limiter);
        }
        Ok(Arc::new(guarded))
    }

    fn embeddings(&self, model: &ResolvedModel) -> Result<Arc<dyn EmbeddingProvider>, LlmError> {
        let api_key = model.api_key.clone().ok_or_else(|| LlmError::AuthFailed {
            provider: model.provider.clone(),
        })?;
        Ok(Arc::new(OpenAiEmbeddings::new(
            api_key,
            model.base_url_or_default(),
            model.model.clone(),
            model.embedding_dim.unwrap_or(1536),
        )))
    }
}

/// Hands out the same provider for every model.
pub struct StaticLlmFactory {
    llm: Arc<dyn LlmProvider>,
    embedding_dim: usize,
}

impl StaticLlmFactory {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self {
            llm,
            embedding_dim: 64,
        }
    }

    pub fn with_embedding_dim(mut self, dim: usize) -> Self {
        self.embedding_dim = dim;
        self
    }
}

impl LlmFactory for StaticLlmFactory {
    fn chat(&self, _model: &ResolvedModel) -> Result<Arc<dyn LlmProvider>, LlmError> {
        Ok(Arc::clone(&self.llm))
    }

    fn embeddings(&self, model: &ResolvedModel) -> Result<Arc<dyn EmbeddingProvider>, LlmError> {
        Ok(Arc::new(MockEmbeddings::new(
            model.embedding_dim.unwrap_or(self.embedding_dim),
        )))
    }
}

/// Redacted view for logs and the `models` command.
pub fn describe(model: &ResolvedModel) -> String {
    format!(
        "{} -> {}/{} ({:?}{})",
        model.profile_id,
        model.provider,
        model.model,
        model.kind,
        if model.api_key.as_ref().is_some_and(|k| !k.expose_secret().is_empty()) {
            ", key set"
        } else {
            ""
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDatabase;
    use pretty_assertions::assert_eq;

    fn config() -> ModelsConfig {
        serde_yaml::from_str(
            r#"
profiles:
  alice.chat.main:
    kind: chat
    provider: openai
    model: gpt-4o-mini
  alice.chat.strong:
    kind: chat
    provider: deepseek
    model: deepseek-chat
  alice.embedding.main:
    kind: embedding
    provider: openai
    model: text-embedding-3-small
    embedding_dim: 1536
task_defaults:
  chat: alice.chat.main
  summary: alice.chat.strong
"#,
        )
        .unwrap()
    }

    fn resolver() -> ModelResolver {
        ModelResolver::new(
            config(),
            Credentials::from_pairs([
                ("OPENAI_API_KEY", "sk-openai"),
                ("DEEPSEEK_API_KEY", "sk-deepseek"),
                ("DEEPSEEK_BASE_URL", "https://api.deepseek.com/v1"),
            ]),
        )
    }

    #[tokio::test]
    async fn test_task_default_and_credentials() {
        let resolved = resolver().resolve("summary", None, None).await.unwrap();
        assert_eq!(resolved.profile_id, "alice.chat.strong");
        assert_eq!(resolved.base_url.as_deref(), Some("https://api.deepseek.com/v1"));
        assert_eq!(resolved.api_key.unwrap().expose_secret(), "sk-deepseek");
    }

    #[tokio::test]
    async fn test_kind_fallback() {
        let r = resolver();
        let embedding = r.resolve("embedding", None, None).await.unwrap();
        assert_eq!(embedding.profile_id, "alice.embedding.main");
        assert_eq!(embedding.embedding_dim, Some(1536));

        // planner has no task default; the first chat profile wins
        let planner = r.resolve("planner", None, None).await.unwrap();
        assert_eq!(planner.kind, ModelKind::Chat);
        assert_eq!(planner.profile_id, "alice.chat.main");
    }

    #[tokio::test]
    async fn test_unresolvable_without_profiles() {
        let r = ModelResolver::new(ModelsConfig::default(), Credentials::default());
        let err = r.resolve("chat", None, None).await.unwrap_err();
        assert!(matches!(err, ConfigError::Unresolvable(_)));
    }

    #[tokio::test]
    async fn test_user_override_beats_tenant() {
        let db = Arc::new(InMemoryDatabase::new());
        db.set_config_value(ConfigScope::Tenant(1), "model.chat", "alice.chat.strong")
            .await
            .unwrap();
        let r = resolver().with_store(db.clone());
        assert_eq!(
            r.resolve("chat", Some(1), Some(9)).await.unwrap().profile_id,
            "alice.chat.strong"
        );

        db.set_config_value(ConfigScope::User(9), "model.chat", "openai/gpt-4.1")
            .await
            .unwrap();
        db.set_config_value(ConfigScope::User(9), "llm.api_key", "sk-user")
            .await
            .unwrap();
        let resolved = r.resolve("chat", Some(1), Some(9)).await.unwrap();
        assert_eq!(resolved.profile_id, "user.9.chat");
        assert_eq!(resolved.model, "gpt-4.1");
        assert_eq!(resolved.api_key.unwrap().expose_secret(), "sk-user");
    }

    #[test]
    fn test_static_factory_embedding_dim() {
        let factory = StaticLlmFactory::new(Arc::new(crate::llm::MockLlm::new()));
        let model = ResolvedModel::from_profile("alice.embedding.main", &config().profiles["alice.embedding.main"]);
        assert_eq!(factory.embeddings(&model).unwrap().dimension(), 1536);
    }
}
