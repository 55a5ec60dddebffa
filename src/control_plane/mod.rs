//! The control plane: one place to ask which model, prompt, tools and
//! service backends an operation should use for a tenant, user and scene.

mod models;
mod prompts;
mod services;
mod tools;

pub use models::{
    Credentials, DEFAULT_BASE_URL, DefaultLlmFactory, LlmFactory, ModelResolver, ResolvedModel,
    StaticLlmFactory, TASK_TYPES, TERMINAL_FALLBACK, describe,
};
pub use prompts::{
    AGENT_FINAL_ANSWER, AGENT_NEXT_STEP, AGENT_PLANNER_SYSTEM, AGENT_PLANNER_USER, AGENT_REACT,
    PromptStore, SYSTEM_BASE, SYSTEM_RESEARCH, TASK_REPORT, TASK_SUMMARY, canonical_key,
    interpolate, vars,
};
pub use services::{BuildRequest, SERVICE_NAMES, Service, ServiceBuilder, ServiceRegistry};
pub use tools::ToolCatalog;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

use crate::error::{ConfigError, LlmError};
use crate::llm::LlmProvider;
use crate::models::{Scene, UserRole};
use crate::retrieval::EmbeddingProvider;
use crate::tools::Tool;

static GLOBAL: OnceLock<Arc<ControlPlane>> = OnceLock::new();

pub struct ControlPlane {
    models: ModelResolver,
    prompts: Arc<PromptStore>,
    tools: ToolCatalog,
    services: ServiceRegistry,
    llm_factory: Arc<dyn LlmFactory>,
}

impl ControlPlane {
    pub fn new(
        models: ModelResolver,
        prompts: PromptStore,
        tools: ToolCatalog,
        services: ServiceRegistry,
        llm_factory: Arc<dyn LlmFactory>,
    ) -> Self {
        Self {
            models,
            prompts: Arc::new(prompts),
            tools,
            services,
            llm_factory,
        }
    }

    /// Install the process-wide instance. Returns the one already installed
    /// when called twice.
    pub fn install(plane: Arc<ControlPlane>) -> Arc<ControlPlane> {
        Arc::clone(GLOBAL.get_or_init(|| plane))
    }

    pub fn global() -> Option<Arc<ControlPlane>> {
        GLOBAL.get().cloned()
    }

    pub fn models(&self) -> &ModelResolver {
        &self.models
    }

    pub fn prompts(&self) -> &Arc<PromptStore> {
        &self.prompts
    }

    pub fn tools(&self) -> &ToolCatalog {
        &self.tools
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub async fn resolve_model(
        &self,
        task_type: &str,
        tenant_id: Option<i64>,
        user_id: Option<i64>,
    ) -> Result<ResolvedModel, ConfigError> {
        self.models.resolve(task_type, tenant_id, user_id).await
    }

    pub async fn get_prompt(
        &self,
        key: &str,
        tenant_id: Option<i64>,
        user_id: Option<i64>,
        vars: &HashMap<String, String>,
    ) -> Result<String, ConfigError> {
        self.prompts.get(key, tenant_id, user_id, vars).await
    }

    pub fn create_tools(
        &self,
        scene: Scene,
        tenant_id: Option<i64>,
        role: UserRole,
        allowlist: Option<&BTreeSet<String>>,
        include_unsafe: bool,
    ) -> Vec<Arc<dyn Tool>> {
        self.tools
            .create_tools(scene, tenant_id, role, allowlist, include_unsafe)
    }

    pub fn get_service(&self, name: &str, tenant_id: Option<i64>) -> Result<Service, ConfigError> {
        self.services.get_service(name, tenant_id)
    }

    /// Chat provider for a task type.
    pub async fn llm_for_task(
        &self,
        task_type: &str,
        tenant_id: Option<i64>,
        user_id: Option<i64>,
    ) -> Result<Arc<dyn LlmProvider>, crate::error::Error> {
        let resolved = self.resolve_model(task_type, tenant_id, user_id).await?;
        let llm = self.llm_factory.chat(&resolved)?;
        Ok(llm)
    }

    pub async fn embeddings_for_tenant(
        &self,
        tenant_id: Option<i64>,
    ) -> Result<Arc<dyn EmbeddingProvider>, crate::error::Error> {
        let resolved = self.resolve_model("embedding", tenant_id, None).await?;
        Ok(self.llm_factory.embeddings(&resolved)?)
    }

    pub fn llm_factory(&self) -> &Arc<dyn LlmFactory> {
        &self.llm_factory
    }

    /// Build directly from a resolved model.
    pub fn chat_provider(&self, model: &ResolvedModel) -> Result<Arc<dyn LlmProvider>, LlmError> {
        self.llm_factory.chat(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelsConfig, ServicesConfig, ToolsConfig};
    use crate::llm::MockLlm;
    use crate::tools::ToolRouter;
    use crate::tools::builtin::CurrentTimeTool;
    use std::collections::BTreeMap;

    fn plane() -> ControlPlane {
        let models: ModelsConfig = serde_yaml::from_str(
            r#"
profiles:
  alice.chat.main: {kind: chat, provider: openai, model: gpt-4o-mini}
  alice.embedding.main: {kind: embedding, provider: openai, model: emb, embedding_dim: 32}
"#,
        )
        .unwrap();
        let mut available: BTreeMap<String, Arc<dyn Tool>> = BTreeMap::new();
        available.insert("builtin.current_time".into(), Arc::new(CurrentTimeTool));
        ControlPlane::new(
            ModelResolver::new(models, Credentials::default()),
            PromptStore::new(BTreeMap::new()),
            ToolCatalog::new(Arc::new(ToolRouter::new()), ToolsConfig::default(), available),
            ServiceRegistry::new(ServicesConfig::default()),
            Arc::new(StaticLlmFactory::new(Arc::new(MockLlm::new()))),
        )
    }

    #[tokio::test]
    async fn test_single_consult_point() {
        let plane = plane();
        let llm = plane.llm_for_task("planner", Some(1), None).await.unwrap();
        assert_eq!(llm.model_name(), "mock-model");
        assert_eq!(plane.embeddings_for_tenant(Some(1)).await.unwrap().dimension(), 32);

        let prompt = plane
            .get_prompt("system", Some(1), None, &vars([("name", "Alice")]))
            .await
            .unwrap();
        assert!(prompt.starts_with("You are Alice"));

        let tools = plane.create_tools(Scene::Chat, Some(1), UserRole::Normal, None, false);
        assert_eq!(tools.len(), 1);
        assert!(matches!(
            plane.get_service("rag", Some(1)),
            Err(ConfigError::UnknownService(_))
        ));
    }
}
