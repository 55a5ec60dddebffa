//! Service backends by name, built through providers registered at startup
//! and cached per `(name, tenant)`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::{ServiceEntry, ServicesConfig};
use crate::error::ConfigError;
use crate::pipeline::{Downloader, PipelineEngine, Transcriber};
use crate::retrieval::{EmbeddingProvider, RetrievalService};
use crate::search::ResearchService;

/// Service names `get_service` accepts.
pub const SERVICE_NAMES: &[&str] = &["rag", "search", "asr", "downloader", "embedding", "pipeline"];

/// A built service instance.
#[derive(Clone)]
pub enum Service {
    Rag(Arc<dyn RetrievalService>),
    Search(Arc<ResearchService>),
    Asr(Arc<dyn Transcriber>),
    Downloader(Arc<dyn Downloader>),
    Embedding(Arc<dyn EmbeddingProvider>),
    Pipeline(Arc<PipelineEngine>),
}

impl Service {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rag(_) => "rag",
            Self::Search(_) => "search",
            Self::Asr(_) => "asr",
            Self::Downloader(_) => "downloader",
            Self::Embedding(_) => "embedding",
            Self::Pipeline(_) => "pipeline",
        }
    }

    pub fn into_rag(self) -> Option<Arc<dyn RetrievalService>> {
        match self {
            Self::Rag(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_search(self) -> Option<Arc<ResearchService>> {
        match self {
            Self::Search(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_asr(self) -> Option<Arc<dyn Transcriber>> {
        match self {
            Self::Asr(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_downloader(self) -> Option<Arc<dyn Downloader>> {
        match self {
            Self::Downloader(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_embedding(self) -> Option<Arc<dyn EmbeddingProvider>> {
        match self {
            Self::Embedding(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_pipeline(self) -> Option<Arc<PipelineEngine>> {
        match self {
            Self::Pipeline(s) => Some(s),
            _ => None,
        }
    }
}

/// What a builder gets to work with.
pub struct BuildRequest<'a> {
    pub service: &'a str,
    pub provider: &'a str,
    pub tenant_id: Option<i64>,
    pub options: &'a BTreeMap<String, String>,
}

pub type ServiceBuilder =
    Arc<dyn Fn(&BuildRequest<'_>) -> Result<Service, String> + Send + Sync>;

pub struct ServiceRegistry {
    config: ServicesConfig,
    builders: HashMap<String, ServiceBuilder>,
    cache: Mutex<HashMap<(String, Option<i64>), Service>>,
}

impl ServiceRegistry {
    pub fn new(config: ServicesConfig) -> Self {
        Self {
            config,
            builders: HashMap::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Register the implementation behind an implementation key such as
    /// `retrieval.vector`.
    pub fn register<F>(&mut self, impl_key: impl Into<String>, builder: F)
    where
        F: Fn(&BuildRequest<'_>) -> Result<Service, String> + Send + Sync + 'static,
    {
        self.builders.insert(impl_key.into(), Arc::new(builder));
    }

    pub fn with<F>(mut self, impl_key: impl Into<String>, builder: F) -> Self
    where
        F: Fn(&BuildRequest<'_>) -> Result<Service, String> + Send + Sync + 'static,
    {
        self.register(impl_key, builder);
        self
    }

    pub fn config(&self) -> &ServicesConfig {
        &self.config
    }

    /// Provider currently configured for `service`.
    pub fn provider_of(&self, service: &str) -> Option<&str> {
        self.config.services.get(service).map(|e| e.provider.as_str())
    }

    fn build_with(
        &self,
        service: &str,
        provider: &str,
        entry: &ServiceEntry,
        tenant_id: Option<i64>,
    ) -> Result<Service, String> {
        let impl_key = self
            .config
            .providers
            .get(provider)
            .map(String::as_str)
            .unwrap_or(provider);
        let builder = self
            .builders
            .get(impl_key)
            .ok_or_else(|| format!("no implementation registered for '{}'", impl_key))?;
        let built = builder(&BuildRequest {
            service,
            provider,
            tenant_id,
            options: &entry.options,
        })?;
        if built.name() != service {
            return Err(format!(
                "provider '{}' built a {} service, expected {}",
                provider,
                built.name(),
                service
            ));
        }
        Ok(built)
    }

    /// Cached instance of `name` for `tenant_id`. Falls back to the entry's
    /// `fallback` provider when the primary cannot be built.
    pub fn get_service(&self, name: &str, tenant_id: Option<i64>) -> Result<Service, ConfigError> {
        if !SERVICE_NAMES.contains(&name) {
            return Err(ConfigError::UnknownService(name.to_string()));
        }
        let key = (name.to_string(), tenant_id);
        if let Some(hit) = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(hit.clone());
        }

        let entry = self
            .config
            .services
            .get(name)
            .ok_or_else(|| ConfigError::UnknownService(name.to_string()))?;

        let built = match self.build_with(name, &entry.provider, entry, tenant_id) {
            Ok(service) => service,
            Err(primary) => {
                let Some(fallback) = &entry.fallback else {
                    return Err(ConfigError::ServiceUnavailable {
                        service: name.to_string(),
                        reason: primary,
                    });
                };
                tracing::warn!(
                    service = name,
                    provider = %entry.provider,
                    fallback = %fallback,
                    "Service provider unavailable, using fallback: {}",
                    primary
                );
                self.build_with(name, fallback, entry, tenant_id)
                    .map_err(|reason| ConfigError::ServiceUnavailable {
                        service: name.to_string(),
                        reason: format!("{}; fallback: {}", primary, reason),
                    })?
            }
        };

        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, built.clone());
        Ok(built)
    }

    /// Drop cached instances built for `tenant_id`.
    pub fn evict_tenant(&self, tenant_id: i64) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(_, t), _| *t != Some(tenant_id));
    }

    pub fn clear_cache(&self) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
