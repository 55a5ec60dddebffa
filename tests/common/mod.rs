//! Shared in-memory fixture for the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use alice::agent::AgentCore;
use alice::config::{AgentSettings, ModelsConfig, ServicesConfig, ToolsConfig};
use alice::context::{ContextAssembler, TimelineService};
use alice::control_plane::{
    ControlPlane, Credentials, ModelResolver, PromptStore, ServiceRegistry, StaticLlmFactory,
    ToolCatalog,
};
use alice::db::{Database, InMemoryDatabase};
use alice::llm::MockLlm;
use alice::models::ContentAnalysis;
use alice::pipeline::{
    ArtifactStore, CopyExtractor, PipelineEngine, ProcessingQueue, RetryPolicy, StubAnalyzer,
    StubDownloader, StubTranscriber,
};
use alice::retrieval::{InMemoryVectorIndex, MockEmbeddings, RetrievalService, VectorRetrieval};
use alice::search::{MockSearch, ResearchService};
use alice::tools::builtin::{BuiltinDeps, builtin_catalog};
use alice::tools::ToolRouter;

pub const TRANSCRIPT: &str = "Rust ownership means every value has a single owner. \
Borrowing lets code use a value without taking ownership. \
The borrow checker rejects dangling references at compile time.";

pub struct Harness {
    pub db: Arc<InMemoryDatabase>,
    pub retrieval: Arc<dyn RetrievalService>,
    pub timeline: Arc<TimelineService>,
    pub llm: Arc<MockLlm>,
    pub router: Arc<ToolRouter>,
    pub plane: Arc<ControlPlane>,
    pub engine: Arc<PipelineEngine>,
    pub queue: Arc<ProcessingQueue>,
    pub agent: AgentCore,
    pub transcriber: Arc<StubTranscriber>,
    _dir: tempfile::TempDir,
}

pub struct HarnessBuilder {
    llm: MockLlm,
    transcriber: StubTranscriber,
    settings: AgentSettings,
    max_parallel: usize,
}

impl HarnessBuilder {
    pub fn llm(mut self, llm: MockLlm) -> Self {
        self.llm = llm;
        self
    }

    pub fn transcriber(mut self, transcriber: StubTranscriber) -> Self {
        self.transcriber = transcriber;
        self
    }

    pub fn settings(mut self, settings: AgentSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn max_parallel(mut self, n: usize) -> Self {
        self.max_parallel = n;
        self
    }

    pub fn build(self) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(InMemoryDatabase::new());
        let llm = Arc::new(self.llm);
        let retrieval: Arc<dyn RetrievalService> = Arc::new(VectorRetrieval::new(
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(MockEmbeddings::new(64)),
        ));
        let timeline = Arc::new(TimelineService::new(db.clone()));
        let transcriber = Arc::new(self.transcriber);

        let engine = Arc::new(
            PipelineEngine::new(
                db.clone(),
                retrieval.clone(),
                ArtifactStore::new(dir.path()),
                Arc::new(StubDownloader::new()),
                transcriber.clone(),
            )
            .with_extractor(Arc::new(CopyExtractor))
            .with_analyzer(Arc::new(StubAnalyzer::new(ContentAnalysis {
                summary: "An introduction to ownership and borrowing in Rust.".into(),
                key_points: vec!["Single owner".into(), "Borrowing".into()],
                concepts: vec!["ownership".into(), "borrowing".into()],
                tags: vec!["rust".into()],
            })))
            .with_timeline(timeline.clone())
            .with_retry(RetryPolicy {
                max_attempts: 3,
                base: Duration::from_millis(1),
                cap: Duration::from_millis(5),
            }),
        );
        let queue = ProcessingQueue::new(engine.clone(), self.max_parallel);

        let deps = BuiltinDeps {
            db: db.clone(),
            retrieval: retrieval.clone(),
            timeline: timeline.clone(),
            llm: llm.clone(),
            research: Some(Arc::new(ResearchService::new(Arc::new(MockSearch)))),
            queue: Some(queue.clone()),
            report_prompt: None,
        };
        let models: ModelsConfig = serde_yaml::from_str(
            "profiles:\n  alice.chat.main: {kind: chat, provider: openai, model: gpt-4o-mini}\n",
        )
        .unwrap();
        let router = Arc::new(ToolRouter::new());
        let plane = Arc::new(ControlPlane::new(
            ModelResolver::new(models, Credentials::default()).with_store(db.clone()),
            PromptStore::new(BTreeMap::new()).with_store(db.clone()),
            ToolCatalog::new(router.clone(), ToolsConfig::default(), builtin_catalog(&deps)),
            ServiceRegistry::new(ServicesConfig::default()),
            Arc::new(StaticLlmFactory::new(llm.clone())),
        ));
        let assembler = Arc::new(ContextAssembler::new(db.clone(), retrieval.clone(), timeline.clone()));
        let agent = AgentCore::new(plane.clone(), db.clone(), assembler, timeline.clone())
            .with_settings(self.settings);

        Harness {
            db,
            retrieval,
            timeline,
            llm,
            router,
            plane,
            engine,
            queue,
            agent,
            transcriber,
            _dir: dir,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            llm: MockLlm::new(),
            transcriber: StubTranscriber::new(TRANSCRIPT),
            settings: AgentSettings::default(),
            max_parallel: 2,
        }
    }

    pub fn new(llm: MockLlm) -> Self {
        Self::builder().llm(llm).build()
    }

    pub fn database(&self) -> Arc<dyn Database> {
        self.db.clone()
    }
}
