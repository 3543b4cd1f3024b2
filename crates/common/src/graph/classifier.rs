//! Embedding-based section classifier

use crate::db::{parse_embedding, Repository};
use crate::embeddings::{cosine_similarity, Embedder};
use crate::errors::Result;
use crate::metrics;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default similarity a match must reach
pub const DEFAULT_THRESHOLD: f32 = 0.85;

/// Classification outcome
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Classification {
    /// Matched custom section, if the best score reached the threshold
    pub custom_section_id: Option<Uuid>,
    /// Best similarity among candidates
    pub best_score: Option<f32>,
}

/// Assigns section text to the closest node of a custom template
#[derive(Clone)]
pub struct SectionClassifier {
    repo: Repository,
    embedder: Arc<dyn Embedder>,
    threshold: f32,
}

impl SectionClassifier {
    pub fn new(repo: Repository, embedder: Arc<dyn Embedder>, threshold: f32) -> Self {
        Self {
            repo,
            embedder,
            threshold,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Matched custom section id, if any
    pub async fn classify(&self, text: &str, custom_template_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.classify_scored(text, custom_template_id).await?.custom_section_id)
    }

    /// Classify and keep the best score.
    ///
    /// Provider failures degrade to "no match"; database errors propagate.
    pub async fn classify_scored(&self, text: &str, custom_template_id: Uuid) -> Result<Classification> {
        if text.trim().is_empty() {
            return Ok(Classification::default());
        }

        let query = match self.embedder.embed(text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Classification embedding failed, leaving section unclassified");
                metrics::record_classification(false);
                return Ok(Classification::default());
            }
        };

        let candidates: Vec<(Uuid, Vec<f32>)> = self
            .repo
            .classification_candidates(custom_template_id)
            .await?
            .into_iter()
            .filter_map(|(id, raw)| parse_embedding(&raw).map(|e| (id, e)))
            .collect();

        let scores = rank(&query, &candidates);
        let best_score = best(&scores).map(|(_, score)| score);
        let custom_section_id = select_match(&scores, self.threshold).map(|(id, _)| id);

        debug!(
            candidates = candidates.len(),
            best_score = ?best_score,
            matched = ?custom_section_id,
            "Section classified"
        );
        metrics::record_classification(custom_section_id.is_some());

        Ok(Classification {
            custom_section_id,
            best_score,
        })
    }
}

/// Cosine similarity of the query against every candidate
pub fn rank(query: &[f32], candidates: &[(Uuid, Vec<f32>)]) -> Vec<(Uuid, f32)> {
    candidates
        .iter()
        .map(|(id, embedding)| (*id, cosine_similarity(query, embedding)))
        .collect()
}

/// Highest score; equal scores resolve to the smallest id
fn best(scores: &[(Uuid, f32)]) -> Option<(Uuid, f32)> {
    scores.iter().copied().fold(None, |acc, (id, score)| match acc {
        None => Some((id, score)),
        Some((best_id, best_score)) => {
            if score > best_score || (score == best_score && id < best_id) {
                Some((id, score))
            } else {
                Some((best_id, best_score))
            }
        }
    })
}

/// Best candidate if it reaches `threshold` (inclusive)
pub fn select_match(scores: &[(Uuid, f32)], threshold: f32) -> Option<(Uuid, f32)> {
    best(scores).filter(|(_, score)| *score >= threshold)
}
