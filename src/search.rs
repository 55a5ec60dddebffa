//! Web search backends and the multi-query research service behind
//! `deep_web_research`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::tools::ToolError;

/// Sources kept after aggregation.
const MAX_SOURCES: usize = 10;

/// Sub-queries produced by decomposition.
const MAX_SUB_QUERIES: usize = 3;

const DEFAULT_DECOMPOSE_PROMPT: &str = "Split the question below into at most 3 short web \
search queries. Reply with a JSON array of strings only.\n\nQuestion: {query}";

const DEFAULT_SYNTHESIS_PROMPT: &str = "Answer the question using the numbered sources. \
Cite sources as [n].\n\nQuestion: {query}\n\nSources:\n{sources}";

/// Words suggesting a question needs several searches.
const DECOMPOSE_HINTS: &[&str] = &[
    " vs ", "compare", "difference", "history", "impact", "cause", "对比", "区别", "历史",
    "发展", "原因", "影响",
];

/// Filler stripped from research questions.
const FILLER_PHRASES: &[&str] = &["please tell me", "can you tell me", "i want to know", "请问", "帮我", "我想知道", "能告诉我"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSearchResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// A web search backend.
#[async_trait]
pub trait WebSearch: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<WebSearchResult>, ToolError>;
}

/// Tavily search API.
pub struct TavilySearch {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
}

impl TavilySearch {
    pub fn new(api_key: SecretString) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key,
            base_url: "https://api.tavily.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyItem>,
}

#[derive(Debug, Deserialize)]
struct TavilyItem {
    #[serde(default)]
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    score: Option<f32>,
}

#[async_trait]
impl WebSearch for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<WebSearchResult>, ToolError> {
        let response = self
            .client
            .post(format!("{}/search", self.base_url.trim_end_matches('/')))
            .json(&serde_json::json!({
                "api_key": self.api_key.expose_secret(),
                "query": query,
                "search_depth": "basic",
                "max_results": top_k,
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ToolError::Timeout(Duration::from_secs(30))
                } else {
                    ToolError::ExternalService(e.to_string())
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ToolError::RateLimited(None));
        }
        if !status.is_success() {
            return Err(ToolError::ExternalService(format!(
                "search returned HTTP {}",
                status
            )));
        }

        let parsed: TavilyResponse = response
            .json()
            .await
            .map_err(|e| ToolError::ExternalService(format!("invalid search response: {}", e)))?;

        Ok(parsed
            .results
            .into_iter()
            .map(|item| WebSearchResult {
                url: item.url,
                title: item.title,
                snippet: item.content,
                score: item.score,
            })
            .collect())
    }
}

/// Deterministic results for tests and offline use.
#[derive(Debug, Default)]
pub struct MockSearch;

#[async_trait]
impl WebSearch for MockSearch {
    fn name(&self) -> &str {
        "mock"
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<WebSearchResult>, ToolError> {
        let short: String = query.chars().take(30).collect();
        Ok((0..top_k.min(3))
            .map(|i| WebSearchResult {
                url: format!("https://example.com/result/{}", i),
                title: format!("Search Result {} for: {}", i, short),
                snippet: format!("Mock search result snippet for query: {}", query),
                score: Some(1.0 - i as f32 * 0.1),
            })
            .collect())
    }
}

/// Output of [`ResearchService::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    pub query: String,
    pub sub_queries: Vec<String>,
    pub sources: Vec<WebSearchResult>,
    pub answer: String,
}

/// Multi-query web research: clean up the question, split it, search each
/// part, merge sources and synthesise an answer.
pub struct ResearchService {
    search: Arc<dyn WebSearch>,
    llm: Option<Arc<dyn LlmProvider>>,
    decompose_prompt: String,
    synthesis_prompt: String,
}

impl ResearchService {
    pub fn new(search: Arc<dyn WebSearch>) -> Self {
        Self {
            search,
            llm: None,
            decompose_prompt: DEFAULT_DECOMPOSE_PROMPT.to_string(),
            synthesis_prompt: DEFAULT_SYNTHESIS_PROMPT.to_string(),
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// Templates using `{query}` and, for synthesis, `{sources}`.
    pub fn with_prompts(mut self, decompose: impl Into<String>, synthesis: impl Into<String>) -> Self {
        self.decompose_prompt = decompose.into();
        self.synthesis_prompt = synthesis.into();
        self
    }

    pub fn backend(&self) -> &str {
        self.search.name()
    }

    pub async fn run(&self, query: &str, max_steps: usize) -> Result<ResearchResult, ToolError> {
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return Err(ToolError::InvalidParameters("query must not be empty".into()));
        }

        let mut sub_queries = self.decompose(&normalized).await;
        sub_queries.truncate(max_steps.max(1));
        tracing::debug!(query = %normalized, parts = sub_queries.len(), "Researching");

        let mut all = Vec::new();
        for sub in &sub_queries {
            all.extend(self.search.search(sub, 5).await?);
        }
        let sources = aggregate_sources(all);
        let answer = self.synthesize(&normalized, &sources).await;

        Ok(ResearchResult {
            query: normalized,
            sub_queries,
            sources,
            answer,
        })
    }

    async fn decompose(&self, query: &str) -> Vec<String> {
        let lowered = query.to_lowercase();
        let wants_split = query.chars().count() > 20
            && DECOMPOSE_HINTS.iter().any(|hint| lowered.contains(hint));
        let Some(llm) = self.llm.as_ref().filter(|_| wants_split) else {
            return vec![query.to_string()];
        };

        let prompt = self.decompose_prompt.replace("{query}", query);
        match llm
            .complete(CompletionRequest::new(vec![ChatMessage::user(prompt)]))
            .await
        {
            Ok(response) => parse_query_list(&response.content)
                .filter(|list| !list.is_empty())
                .map(|mut list| {
                    list.truncate(MAX_SUB_QUERIES);
                    list
                })
                .unwrap_or_else(|| vec![query.to_string()]),
            Err(e) => {
                tracing::warn!(kind = %e.kind(), "Query decomposition failed: {}", e);
                vec![query.to_string()]
            }
        }
    }

    async fn synthesize(&self, query: &str, sources: &[WebSearchResult]) -> String {
        if sources.is_empty() {
            return "No relevant search results were found.".to_string();
        }
        let listing = format_sources(sources);
        let Some(llm) = &self.llm else {
            return format!("Found {} sources:\n\n{}", sources.len(), listing);
        };

        let prompt = self
            .synthesis_prompt
            .replace("{query}", query)
            .replace("{sources}", &listing);
        match llm
            .complete(CompletionRequest::new(vec![ChatMessage::user(prompt)]))
            .await
        {
            Ok(response) => response.content,
            Err(e) => {
                tracing::warn!(kind = %e.kind(), "Answer synthesis failed: {}", e);
                format!(
                    "Found {} sources but could not write a combined answer.\n\n{}",
                    sources.len(),
                    listing
                )
            }
        }
    }
}

fn normalize_query(query: &str) -> String {
    let mut out = query.trim().to_string();
    for phrase in FILLER_PHRASES {
        let lowered = out.to_lowercase();
        if let Some(pos) = lowered.find(phrase) {
            out.replace_range(pos..pos + phrase.len(), "");
        }
    }
    out.trim().to_string()
}

fn parse_query_list(text: &str) -> Option<Vec<String>> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Vec<String>>(&text[start..=end]).ok()
}

/// Dedup by URL, best score first, capped.
fn aggregate_sources(all: Vec<WebSearchResult>) -> Vec<WebSearchResult> {
    let mut seen = HashSet::new();
    let mut unique: Vec<WebSearchResult> = all
        .into_iter()
        .filter(|s| seen.insert(s.url.clone()))
        .collect();
    unique.sort_by(|a, b| {
        b.score
            .unwrap_or(0.0)
            .partial_cmp(&a.score.unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    unique.truncate(MAX_SOURCES);
    unique
}

fn format_sources(sources: &[WebSearchResult]) -> String {
    sources
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let title = if s.title.is_empty() { "Untitled" } else { &s.title };
            format!("[{}] {}\n    URL: {}\n    {}\n", i + 1, title, s.url, s.snippet)
        })
        .collect::<Vec<_>>()
        .join("\n")
}
