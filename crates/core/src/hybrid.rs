//! Hybrid retrieval: lexical BM25 and vector similarity fused into one
//! ranking.
//!
//! The two channels score on incompatible scales (unbounded BM25 vs bounded
//! cosine distance), so each is squashed into `[0, 1]` before a weighted sum
//! combines them. Filtering happens *before* fusion: a node that fails a
//! filter can never ride a high score past it.

use crate::vector::VectorIndex;
use crate::{canonical_tag, lexical, KnowledgeGraph, Node, NodeId, NodeKind, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use tracing::warn;

/// Relative weight of each scoring channel. The defaults favour the vector
/// channel — lexical overlap is treated as a precision signal on top of
/// semantic similarity, not the other way round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchWeights {
    pub lexical: f32,
    pub vector: f32,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            lexical: 0.3,
            vector: 0.7,
        }
    }
}

/// Structured constraints applied before scoring. All populated fields must
/// hold simultaneously (strict AND).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Hierarchy-aware: a filter tag matches a node tagged with it *or* with
    /// any of its descendants, the same subtree rule `by_tag` uses.
    pub tags: Vec<String>,
    /// Inclusive calendar-date bounds on `created_at`.
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub kind: Option<NodeKind>,
    pub source: Option<String>,
}

/// One ranked search result. `score` is the fused value, in `[0, 1]` for the
/// default weights (any weights summing to at most 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: NodeId,
    pub title: String,
    pub score: f32,
    pub snippet: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// The text handed to the embedding provider at ingestion: the body prefixed
/// with a header naming title and tags, so short bodies inherit their
/// organisational context ("transformer" under `ai/ml` embeds differently
/// from "transformer" under `hardware/electrical`).
pub fn contextual_text(title: &str, tags: &[String], body: &str) -> String {
    format!("Title: {title}\nTags: {}\n\n{body}", tags.join(", "))
}

impl KnowledgeGraph {
    /// Hybrid search over content nodes.
    ///
    /// `query_embedding` and `vector_index` are optional collaborators: when
    /// either is absent, or the index query fails, ranking degrades to
    /// lexical-only rather than erroring. An empty or whitespace query (or
    /// `limit == 0`) returns no hits.
    ///
    /// Results are sorted by fused score descending; ties break by
    /// `created_at` descending, then by id, so the same state always produces
    /// the same ordering.
    pub fn search_hybrid(
        &self,
        query: &str,
        query_embedding: Option<&[f32]>,
        vector_index: Option<&dyn VectorIndex>,
        filters: &SearchFilters,
        weights: SearchWeights,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let corpus = self.all_nodes()?;
        let corpus_size = corpus.len();

        let tag_subtrees: Vec<BTreeSet<String>> = filters
            .tags
            .iter()
            .map(|t| self.descendant_tags(t))
            .collect::<Result<_>>()?;

        let content: Vec<Node> = corpus
            .into_iter()
            .filter(|n| !n.kind.is_structural())
            .collect();
        if content.is_empty() {
            return Ok(Vec::new());
        }

        // Lexical channel, max-normalised so the top BM25 hit anchors 1.0.
        // Both channels score the full content corpus; filters drop hits
        // afterwards. Scoring a filtered subcorpus would shift document
        // frequencies (and the normalisation anchor) with the filter set, so
        // two surviving candidates could swap order depending on what was
        // filtered away.
        let lexical_hits = lexical::rank(&content, query, content.len())?;
        let max_lex = lexical_hits
            .iter()
            .map(|(_, s)| *s)
            .fold(0.0_f32, f32::max);
        let mut lex_scores: HashMap<NodeId, f32> = HashMap::new();
        if max_lex > 0.0 {
            for (id, score) in lexical_hits {
                lex_scores.insert(id, score / max_lex);
            }
        }

        // Vector channel: distance d becomes similarity 1/(1+d). The index is
        // asked for the whole corpus so that post-filter candidates can't be
        // crowded out of a short neighbour list by filtered-away nodes.
        let mut vec_scores: HashMap<NodeId, f32> = HashMap::new();
        if let (Some(embedding), Some(index)) = (query_embedding, vector_index) {
            match index.query(embedding, corpus_size) {
                Ok(neighbours) => {
                    for (id, distance) in neighbours {
                        vec_scores.insert(id, 1.0 / (1.0 + distance.max(0.0)));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "vector index unavailable, degrading to lexical-only");
                }
            }
        }

        let mut hits: Vec<SearchHit> = Vec::new();
        for node in content
            .iter()
            .filter(|n| passes_filters(n, filters, &tag_subtrees))
        {
            let lex = lex_scores.get(&node.id).copied().unwrap_or(0.0);
            let vec = vec_scores.get(&node.id).copied().unwrap_or(0.0);
            if lex == 0.0 && vec == 0.0 {
                continue; // absent from both rankings
            }
            let summary = node.summary();
            hits.push(SearchHit {
                id: node.id.clone(),
                title: node.title.clone(),
                score: weights.lexical * lex + weights.vector * vec,
                snippet: summary.snippet,
                created_at: node.created_at,
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

fn passes_filters(node: &Node, filters: &SearchFilters, tag_subtrees: &[BTreeSet<String>]) -> bool {
    for subtree in tag_subtrees {
        let matched = node
            .tags
            .iter()
            .any(|t| canonical_tag(t).is_some_and(|c| subtree.contains(&c)));
        if !matched {
            return false;
        }
    }
    if let Some(from) = filters.date_from {
        if node.created_at.date_naive() < from {
            return false;
        }
    }
    if let Some(to) = filters.date_to {
        if node.created_at.date_naive() > to {
            return false;
        }
    }
    if let Some(kind) = filters.kind {
        if node.kind != kind {
            return false;
        }
    }
    if let Some(source) = &filters.source {
        if node.source.as_deref() != Some(source.as_str()) {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
