//! Builds the message sequence and citations a task starts from.

use std::sync::Arc;

use crate::agent::{AgentTask, Citation, CitationType, merge_citations, truncate_chars};
use crate::config::AgentSettings;
use crate::context::timeline::TimelineService;
use crate::db::Database;
use crate::llm::{ChatMessage, Role};
use crate::models::{Scene, TimelineFilter};
use crate::retrieval::{ConceptIndex, RetrievalService, SearchHit};

/// Bounds for one assembly.
#[derive(Debug, Clone, Copy)]
pub struct AssemblerConfig {
    pub history_limit: usize,
    pub top_k: usize,
    pub score_threshold: f32,
    pub concept_limit: usize,
    pub timeline_limit: usize,
    pub timeline_days: i64,
    /// Characters of each excerpt placed in the retrieval block.
    pub excerpt_chars: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            history_limit: 10,
            top_k: 5,
            score_threshold: 0.3,
            concept_limit: 5,
            timeline_limit: 10,
            timeline_days: 7,
            excerpt_chars: 600,
        }
    }
}

impl AssemblerConfig {
    pub fn from_settings(settings: &AgentSettings) -> Self {
        Self {
            history_limit: settings.history_limit,
            top_k: settings.retrieval_top_k.max(1),
            score_threshold: settings.score_threshold,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    /// Formatted retrieval block, empty when nothing was found.
    pub retrieval_block: String,
    /// Prior conversation, oldest first, without system messages.
    pub history: Vec<ChatMessage>,
    pub query: String,
    pub citations: Vec<Citation>,
    /// Set when a retrieval source failed and was left out.
    pub degraded: bool,
}

impl AssembledContext {
    /// System block first, then history, then the query.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        if !self.retrieval_block.is_empty() {
            messages.push(ChatMessage::system(self.retrieval_block.clone()));
        }
        messages.extend(self.history.iter().cloned());
        messages.push(ChatMessage::user(self.query.clone()));
        messages
    }
}

pub struct ContextAssembler {
    db: Arc<dyn Database>,
    retrieval: Arc<dyn RetrievalService>,
    concepts: ConceptIndex,
    timeline: Arc<TimelineService>,
    config: AssemblerConfig,
}

impl ContextAssembler {
    pub fn new(
        db: Arc<dyn Database>,
        retrieval: Arc<dyn RetrievalService>,
        timeline: Arc<TimelineService>,
    ) -> Self {
        Self {
            concepts: ConceptIndex::new(Arc::clone(&db)),
            db,
            retrieval,
            timeline,
            config: AssemblerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AssemblerConfig) -> Self {
        self.config = config;
        self
    }

    pub async fn assemble(&self, task: &AgentTask) -> AssembledContext {
        let mut ctx = AssembledContext {
            query: match &task.selection {
                Some(selection) if !selection.trim().is_empty() => {
                    format!("{}\n\nSelected text:\n{}", task.query, selection)
                }
                _ => task.query.clone(),
            },
            ..AssembledContext::default()
        };

        if let Some(conversation_id) = task.conversation_id {
            match self
                .db
                .recent_conversation_messages(conversation_id, self.config.history_limit)
                .await
            {
                Ok(messages) => {
                    ctx.history = messages
                        .into_iter()
                        .map(|m| ChatMessage {
                            role: Role::from_stored(&m.role),
                            content: m.content,
                        })
                        .filter(|m| m.role != Role::System)
                        .collect();
                }
                Err(e) => {
                    tracing::warn!(conversation_id, kind = %e.kind(), "Conversation history unavailable: {}", e);
                    ctx.degraded = true;
                }
            }
        }

        let mut sections = Vec::new();
        let hits = self.search(task, &mut ctx.degraded).await;
        if !hits.is_empty() {
            let mut block = String::from("Relevant excerpts from the user's library:\n");
            for (i, hit) in hits.iter().enumerate() {
                block.push_str(&format!(
                    "[{}] {} (video {})\n{}\n",
                    i + 1,
                    hit.title,
                    hit.content_id,
                    truncate_chars(&hit.content, self.config.excerpt_chars)
                ));
            }
            sections.push(block);
            merge_citations(
                &mut ctx.citations,
                hits.iter()
                    .map(|h| Citation::new(CitationType::Video, h.content_id.to_string(), &h.title, &h.content)),
            );
        }

        if matches!(task.scene, Scene::Graph | Scene::Research) {
            match self
                .concepts
                .search(task.tenant_id, &task.query, self.config.concept_limit)
                .await
            {
                Ok(concepts) if !concepts.is_empty() => {
                    let mut block = String::from("Related concepts:\n");
                    for hit in &concepts {
                        block.push_str(&format!("- {}: {}\n", hit.concept, hit.titles.join(", ")));
                    }
                    sections.push(block);
                    merge_citations(
                        &mut ctx.citations,
                        concepts.iter().map(|h| {
                            Citation::new(CitationType::Concept, &h.concept, &h.concept, &h.titles.join(", "))
                        }),
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(tenant_id = task.tenant_id, kind = %e.kind(), "Concept lookup failed: {}", e);
                    ctx.degraded = true;
                }
            }
        }

        if matches!(task.scene, Scene::Timeline | Scene::Research) {
            let filter = TimelineFilter {
                user_id: task.user_id,
                since: Some(chrono::Utc::now() - chrono::Duration::days(super::clamp_days(self.config.timeline_days))),
                limit: self.config.timeline_limit,
                ..TimelineFilter::for_tenant(task.tenant_id)
            };
            match self.timeline.list_events(&filter).await {
                Ok(events) if !events.is_empty() => {
                    let mut block = String::from("Recent activity:\n");
                    for event in &events {
                        block.push_str(&format!(
                            "- {} {} {}\n",
                            event.created_at.format("%Y-%m-%d %H:%M"),
                            event.event_type.as_str(),
                            event.title.as_deref().unwrap_or("")
                        ));
                    }
                    sections.push(block);
                    merge_citations(
                        &mut ctx.citations,
                        events.iter().map(|e| {
                            let title = e.title.clone().unwrap_or_else(|| e.event_type.as_str().to_string());
                            Citation::new(CitationType::Timeline, e.id.to_string(), title.clone(), &title)
                        }),
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(tenant_id = task.tenant_id, kind = %e.kind(), "Timeline lookup failed: {}", e);
                    ctx.degraded = true;
                }
            }
        }

        ctx.retrieval_block = sections.join("\n");
        tracing::debug!(
            tenant_id = task.tenant_id,
            scene = %task.scene.as_str(),
            history = ctx.history.len(),
            citations = ctx.citations.len(),
            degraded = ctx.degraded,
            "Context assembled"
        );
        ctx
    }

    async fn search(&self, task: &AgentTask, degraded: &mut bool) -> Vec<SearchHit> {
        let result = async {
            let partition = self.retrieval.get_or_create_partition(task.tenant_id).await?;
            self.retrieval
                .search_filtered(&partition, &task.query, self.config.top_k, task.content_id)
                .await
        }
        .await;
        match result {
            Ok(hits) => hits
                .into_iter()
                .filter(|h| h.score >= self.config.score_threshold)
                .collect(),
            Err(e) => {
                tracing::warn!(tenant_id = task.tenant_id, kind = %e.kind(), "Retrieval failed, continuing without it: {}", e);
                *degraded = true;
                Vec::new()
            }
        }
    }
}
