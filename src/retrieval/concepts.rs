//! Concept index built from the `concepts` of analysed content items.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::DatabaseError;
use crate::models::ContentStatus;

/// Items scanned per lookup.
const SCAN_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConceptHit {
    pub concept: String,
    pub content_ids: Vec<i64>,
    pub titles: Vec<String>,
}

/// Concept lookup over the relational store.
pub struct ConceptIndex {
    db: Arc<dyn Database>,
}

impl ConceptIndex {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Concepts matching any query term, most widely shared first.
    pub async fn search(
        &self,
        tenant_id: i64,
        query: &str,
        limit: usize,
    ) -> Result<Vec<ConceptHit>, DatabaseError> {
        let query = query.to_lowercase();
        let terms: Vec<&str> = query
            .split(|c: char| c.is_whitespace() || c.is_ascii_punctuation())
            .filter(|t| t.chars().count() >= 2)
            .collect();

        let items = self
            .db
            .list_content_items(tenant_id, Some(ContentStatus::Done), SCAN_LIMIT)
            .await?;

        let mut grouped: BTreeMap<String, ConceptHit> = BTreeMap::new();
        for item in &items {
            let Some(analysis) = &item.analysis else {
                continue;
            };
            for concept in &analysis.concepts {
                let lowered = concept.to_lowercase();
                let matched = query.contains(&lowered)
                    || terms.iter().any(|t| lowered.contains(t));
                if !matched {
                    continue;
                }
                let hit = grouped.entry(lowered).or_insert_with(|| ConceptHit {
                    concept: concept.clone(),
                    content_ids: Vec::new(),
                    titles: Vec::new(),
                });
                if !hit.content_ids.contains(&item.id) {
                    hit.content_ids.push(item.id);
                    hit.titles.push(item.title.clone());
                }
            }
        }

        let mut hits: Vec<ConceptHit> = grouped.into_values().collect();
        hits.sort_by(|a, b| b.content_ids.len().cmp(&a.content_ids.len()));
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::InMemoryDatabase;
    use crate::models::{ContentAnalysis, NewContentItem, SourceType};

    #[tokio::test]
    async fn test_concepts_group_across_items() {
        let db = Arc::new(InMemoryDatabase::new());
        for (sid, title) in [("a", "Intro to Rust"), ("b", "Async Rust")] {
            let (item, _) = db
                .insert_content_item(&NewContentItem::new(1, SourceType::Youtube, sid, title))
                .await
                .unwrap();
            db.save_content_analysis(
                item.id,
                &ContentAnalysis {
                    concepts: vec!["Ownership".into(), format!("topic-{}", sid)],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            db.mark_content_done(item.id).await.unwrap();
        }

        let index = ConceptIndex::new(db);
        let hits = index.search(1, "how does ownership work", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].concept, "Ownership");
        assert_eq!(hits[0].content_ids.len(), 2);
    }
}
