//! System context: builds every long-lived component once and hands out
//! shared handles.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use deadpool_postgres::Pool;
use secrecy::SecretString;

use crate::agent::AgentCore;
use crate::config::{ConfigLoader, ControlPlaneConfig, Settings};
use crate::context::{AssemblerConfig, ContextAssembler, TimelineService};
use crate::control_plane::{
    ControlPlane, Credentials, DefaultLlmFactory, LlmFactory, ModelResolver, PromptStore,
    Service, ServiceRegistry, TASK_REPORT, TASK_SUMMARY, ToolCatalog,
};
use crate::crypto::SecretBox;
use crate::db::{Database, InMemoryDatabase, PgStore};
use crate::error::{ConfigError, Error};
use crate::llm::LlmProvider;
use crate::pipeline::{
    ArtifactStore, LlmAnalyzer, PipelineEngine, ProcessingQueue, RetryPolicy, Scheduler,
    SchedulerConfig, SourceDownloaders, WhisperApiTranscriber,
};
use crate::retrieval::{
    FallbackRetrieval, InMemoryVectorIndex, MockEmbeddings, PgVectorIndex, ResilientRetrieval,
    RetrievalService, VectorIndex, VectorRetrieval,
};
use crate::search::{MockSearch, ResearchService, TavilySearch};
use crate::tools::builtin::{BuiltinDeps, builtin_catalog};
use crate::tools::{ToolRouter, clients_from_env};
use crate::watcher::FolderWatcher;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// Everything a command or embedding host needs.
pub struct AppContext {
    pub settings: Settings,
    pub db: Arc<dyn Database>,
    pub plane: Arc<ControlPlane>,
    pub retrieval: Arc<dyn RetrievalService>,
    pub timeline: Arc<TimelineService>,
    pub engine: Arc<PipelineEngine>,
    pub queue: Arc<ProcessingQueue>,
    pub watcher: Arc<FolderWatcher>,
    pub agent: Arc<AgentCore>,
}

impl AppContext {
    /// Scheduler over this context's queue and watcher.
    pub fn scheduler(&self) -> Result<Scheduler, ConfigError> {
        let config = SchedulerConfig::from_settings(&self.settings.watcher, &self.settings.sweep)?;
        Ok(Scheduler::new(config, Arc::clone(&self.db), Arc::clone(&self.queue))
            .with_watcher(Arc::clone(&self.watcher)))
    }
}

/// Connect the relational store: Postgres when a URL is configured,
/// otherwise in memory.
pub async fn connect_database(settings: &Settings) -> Result<(Arc<dyn Database>, Option<Pool>), Error> {
    match &settings.database.url {
        Some(url) => {
            let store = PgStore::new(url, settings.database.pool_size).await?;
            store.run_migrations().await?;
            let pool = store.pool();
            Ok((Arc::new(store), Some(pool)))
        }
        None => {
            tracing::warn!("No database URL configured, using the in-memory store");
            Ok((Arc::new(InMemoryDatabase::new()), None))
        }
    }
}

pub struct AppBuilder {
    config_root: PathBuf,
    env: String,
    settings: Option<Settings>,
    db: Option<Arc<dyn Database>>,
    llm_factory: Option<Arc<dyn LlmFactory>>,
    credentials: Option<Credentials>,
}

impl AppBuilder {
    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self {
            config_root: config_root.into(),
            env: crate::config::current_env(),
            settings: None,
            db: None,
            llm_factory: None,
            credentials: None,
        }
    }

    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn with_database(mut self, db: Arc<dyn Database>) -> Self {
        self.db = Some(db);
        self
    }

    pub fn with_llm_factory(mut self, factory: Arc<dyn LlmFactory>) -> Self {
        self.llm_factory = Some(factory);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn loader(&self) -> ConfigLoader {
        ConfigLoader::new(&self.config_root, &self.env).with_process_env()
    }

    pub async fn build(self) -> Result<AppContext, Error> {
        let loader = self.loader();
        let settings = match self.settings {
            Some(s) => s,
            None => Settings::load(&loader)?,
        };
        let config = ControlPlaneConfig::load(&loader)?;
        tracing::info!(env = %loader.env(), root = %loader.root().display(), "Configuration loaded");

        let (db, pg) = match self.db {
            Some(db) => (db, None),
            None => connect_database(&settings).await?,
        };

        let secrets = match &settings.secret_key {
            Some(key) => Some(Arc::new(
                SecretBox::new(key).map_err(|e| ConfigError::Invalid(e.to_string()))?,
            )),
            None => None,
        };
        let credentials = self.credentials.unwrap_or_else(Credentials::from_env);
        let mut models = ModelResolver::new(config.models, credentials.clone()).with_store(Arc::clone(&db));
        if let Some(secrets) = secrets {
            models = models.with_secrets(secrets);
        }
        let factory: Arc<dyn LlmFactory> = self.llm_factory.unwrap_or_else(|| {
            Arc::new(DefaultLlmFactory::new(Duration::from_secs(settings.agent.llm_timeout_secs)))
        });

        let chat: Arc<dyn LlmProvider> = factory.chat(&models.resolve("chat", None, None).await?)?;
        let retrieval = build_retrieval(&models, factory.as_ref(), &db, pg.as_ref(), &chat).await;
        let timeline = Arc::new(TimelineService::new(Arc::clone(&db)));

        let mut services = service_registry(config.services, &credentials, Arc::clone(&retrieval), Arc::clone(&db));
        let research = services
            .get_service("search", None)
            .ok()
            .and_then(Service::into_search);
        let downloader = services
            .get_service("downloader", None)
            .ok()
            .and_then(Service::into_downloader)
            .unwrap_or_else(|| Arc::new(SourceDownloaders::standard()));
        let transcriber = services
            .get_service("asr", None)?
            .into_asr()
            .ok_or_else(|| ConfigError::UnknownService("asr".into()))?;

        let prompts = PromptStore::new(config.prompts.prompts).with_store(Arc::clone(&db));
        let mut analyzer = LlmAnalyzer::new(Arc::clone(&chat));
        if let Some(prompt) = prompts.get_default(TASK_SUMMARY) {
            analyzer = analyzer.with_prompt(prompt);
        }

        let engine = Arc::new(
            PipelineEngine::new(
                Arc::clone(&db),
                Arc::clone(&retrieval),
                ArtifactStore::new(&settings.data_dir),
                downloader,
                transcriber,
            )
            .with_analyzer(Arc::new(analyzer))
            .with_timeline(Arc::clone(&timeline))
            .with_retry(RetryPolicy::from_settings(&settings.pipeline))
            .with_stage_timeout(Duration::from_secs(settings.pipeline.stage_timeout_secs))
            .with_language(settings.pipeline.language.clone()),
        );
        engine.artifacts().ensure_dirs().await?;
        let pipeline = Arc::clone(&engine);
        services.register("pipeline.default", move |_| Ok(Service::Pipeline(Arc::clone(&pipeline))));
        let queue = ProcessingQueue::new(Arc::clone(&engine), settings.queue.max_parallel);

        let deps = BuiltinDeps {
            db: Arc::clone(&db),
            retrieval: Arc::clone(&retrieval),
            timeline: Arc::clone(&timeline),
            llm: Arc::clone(&chat),
            research,
            queue: Some(Arc::clone(&queue)),
            report_prompt: prompts.get_default(TASK_REPORT).map(str::to_string),
        };
        let router = Arc::new(
            ToolRouter::new().with_timeout(Duration::from_secs(settings.agent.tool_timeout_secs)),
        );
        let catalog = ToolCatalog::new(Arc::clone(&router), config.tools, builtin_catalog(&deps));
        for client in clients_from_env() {
            let added = router.connect_foreign(client).await;
            tracing::info!(tools = added, "Foreign tool endpoint connected");
        }

        let plane = ControlPlane::install(Arc::new(ControlPlane::new(
            models, prompts, catalog, services, factory,
        )));

        let assembler = Arc::new(
            ContextAssembler::new(Arc::clone(&db), Arc::clone(&retrieval), Arc::clone(&timeline))
                .with_config(AssemblerConfig::from_settings(&settings.agent)),
        );
        let agent = Arc::new(
            AgentCore::new(Arc::clone(&plane), Arc::clone(&db), assembler, Arc::clone(&timeline))
                .with_settings(settings.agent.clone()),
        );

        let sessdata = std::env::var("BILIBILI_SESSDATA").ok().map(SecretString::from);
        let watcher = Arc::new(FolderWatcher::new(Arc::clone(&db)).with_bilibili(sessdata));

        tracing::info!(tools = router.len(), "Application context ready");
        Ok(AppContext {
            settings,
            db,
            plane,
            retrieval,
            timeline,
            engine,
            queue,
            watcher,
            agent,
        })
    }
}

/// Vector retrieval backed by the database title search. Without a usable
/// embedding model only the title search remains.
async fn build_retrieval(
    models: &ModelResolver,
    factory: &dyn LlmFactory,
    db: &Arc<dyn Database>,
    pg: Option<&Pool>,
    chat: &Arc<dyn LlmProvider>,
) -> Arc<dyn RetrievalService> {
    let fallback: Arc<dyn RetrievalService> = Arc::new(FallbackRetrieval::new(Arc::clone(db)));
    let embeddings = match models.resolve("embedding", None, None).await {
        Ok(resolved) => factory.embeddings(&resolved).map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    let embeddings = match embeddings {
        Ok(e) => e,
        Err(reason) => {
            tracing::warn!(component = "retrieval", "Embeddings unavailable, using title search only: {}", reason);
            return fallback;
        }
    };
    let index: Arc<dyn VectorIndex> = match pg {
        Some(pool) => Arc::new(PgVectorIndex::new(pool.clone())),
        None => Arc::new(InMemoryVectorIndex::new()),
    };
    let vector = VectorRetrieval::new(index, embeddings).with_llm(Arc::clone(chat));
    Arc::new(ResilientRetrieval::new(Arc::new(vector), fallback))
}

/// Implementation keys every deployment can name in `services.yaml`.
fn service_registry(
    config: crate::config::ServicesConfig,
    credentials: &Credentials,
    retrieval: Arc<dyn RetrievalService>,
    db: Arc<dyn Database>,
) -> ServiceRegistry {
    let tavily_key = credentials.own_api_key("tavily");
    let openai_key = credentials.api_key("openai");
    let openai_url = credentials
        .base_url("openai")
        .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());

    ServiceRegistry::new(config)
        .with("retrieval.vector", move |_| Ok(Service::Rag(Arc::clone(&retrieval))))
        .with("retrieval.fallback", move |_| {
            Ok(Service::Rag(Arc::new(FallbackRetrieval::new(Arc::clone(&db)))))
        })
        .with("search.tavily", move |_| {
            let key = tavily_key.clone().ok_or("TAVILY_API_KEY is not set")?;
            Ok(Service::Search(Arc::new(ResearchService::new(Arc::new(TavilySearch::new(key))))))
        })
        .with("search.mock", |_| Ok(Service::Search(Arc::new(ResearchService::new(Arc::new(MockSearch))))))
        .with("asr.whisper_api", move |req| {
            let key = openai_key.clone().ok_or("OPENAI_API_KEY is not set")?;
            let model = req.options.get("model").map(String::as_str).unwrap_or("whisper-1");
            Ok(Service::Asr(Arc::new(WhisperApiTranscriber::new(&openai_url, key, model))))
        })
        .with("downloader.standard", |_| Ok(Service::Downloader(Arc::new(SourceDownloaders::standard()))))
        .with("embedding.mock", |req| {
            let dim = req
                .options
                .get("dimension")
                .and_then(|d| d.parse().ok())
                .unwrap_or(64);
            Ok(Service::Embedding(Arc::new(MockEmbeddings::new(dim))))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::StaticLlmFactory;
    use crate::llm::MockLlm;
    use crate::models::Scene;
    use pretty_assertions::assert_eq;

    fn write_config(root: &std::path::Path) {
        let base = root.join("base");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::write(
            base.join("models.yaml"),
            "profiles:\n  alice.chat.main: {kind: chat, provider: openai, model: gpt-4o-mini}\n  alice.embedding.main: {kind: embedding, provider: openai, model: emb, embedding_dim: 16}\n",
        )
        .unwrap();
        std::fs::write(
            base.join("services.yaml"),
            "services:\n  search: {provider: mock}\n  asr: {provider: whisper_api}\nproviders:\n  mock: search.mock\n  whisper_api: asr.whisper_api\n",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_build_wires_agent_and_tools() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path());
        let settings = Settings {
            data_dir: dir.path().join("data"),
            ..Settings::default()
        };

        let app = AppBuilder::new(dir.path())
            .with_env("test")
            .with_settings(settings)
            .with_database(Arc::new(InMemoryDatabase::new()))
            .with_llm_factory(Arc::new(StaticLlmFactory::new(Arc::new(MockLlm::new()))))
            .with_credentials(Credentials::from_pairs([("OPENAI_API_KEY", "sk-test")]))
            .build()
            .await
            .unwrap();

        let tools = app.plane.tools().scene_tools(Scene::Research);
        assert!(tools.contains(&"deep_web_research".to_string()));
        assert!(tools.contains(&"ask_video".to_string()));
        assert!(app.engine.artifacts().audio_dir().exists());
        assert_eq!(app.plane.services().provider_of("search"), Some("mock"));
    }
}
