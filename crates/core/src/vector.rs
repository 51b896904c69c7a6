//! Vector search contracts and a flat in-process index.
//!
//! The engine never generates embeddings and never talks to a vector store
//! directly — both concerns sit behind traits so a remote service (or a test
//! double) can be swapped in. [`FlatVectorIndex`] is the built-in default:
//! brute-force cosine distance over in-memory vectors, which is exact and
//! fast enough at hundreds-to-low-thousands of nodes. An approximate index
//! only becomes worth its complexity well beyond that scale.

use crate::{NodeId, NotegraphError, Result};

/// Produces embedding vectors for text.
///
/// Called at ingestion on the contextualised document (see
/// [`contextual_text`](crate::contextual_text)) and at query time on the bare
/// query string. Implementations that call a remote model own their own
/// timeout; any `Err` is treated by the search path as "collaborator
/// unavailable" and triggers lexical-only degradation.
pub trait EmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Stores embeddings by node id and answers nearest-neighbour queries.
pub trait VectorIndex {
    /// Insert or replace the embedding for `id`.
    fn upsert(&mut self, id: &NodeId, embedding: &[f32]) -> Result<()>;

    /// Up to `k` nearest stored vectors as `(id, distance)` pairs, closest
    /// first. Distances are non-negative; `0.0` means identical direction.
    fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>>;

    /// Remove the embedding for `id`. No-op if absent.
    fn remove(&mut self, id: &NodeId) -> Result<()>;
}

#[derive(Debug, Clone)]
struct Entry {
    id: NodeId,
    embedding: Vec<f32>,
}

/// Flat (brute-force) cosine-distance index.
///
/// Held entirely in memory and not persisted — embeddings are re-populated by
/// the owning layer on startup, which keeps the storage format decoupled from
/// any one embedding model's dimension.
#[derive(Debug, Default, Clone)]
pub struct FlatVectorIndex {
    entries: Vec<Entry>,
    /// Expected embedding dimension. Set on first upsert; later upserts and
    /// queries are validated against it.
    dim: Option<usize>,
}

impl FlatVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn check_dim(&mut self, embedding: &[f32]) -> Result<()> {
        if embedding.is_empty() {
            return Err(NotegraphError::InvalidEmbedding(
                "embedding must not be empty".to_string(),
            ));
        }
        match self.dim {
            None => {
                self.dim = Some(embedding.len());
                Ok(())
            }
            Some(d) if d == embedding.len() => Ok(()),
            Some(d) => Err(NotegraphError::InvalidEmbedding(format!(
                "dimension mismatch: expected {d}, got {}",
                embedding.len()
            ))),
        }
    }
}

impl VectorIndex for FlatVectorIndex {
    fn upsert(&mut self, id: &NodeId, embedding: &[f32]) -> Result<()> {
        self.check_dim(embedding)?;
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == *id) {
            entry.embedding = embedding.to_vec();
        } else {
            self.entries.push(Entry {
                id: id.clone(),
                embedding: embedding.to_vec(),
            });
        }
        Ok(())
    }

    fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<(NodeId, f32)>> {
        if k == 0 || self.entries.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(d) = self.dim {
            if embedding.len() != d {
                return Err(NotegraphError::InvalidEmbedding(format!(
                    "dimension mismatch: expected {d}, got {}",
                    embedding.len()
                )));
            }
        }

        let query_norm = l2_norm(embedding);
        if query_norm == 0.0 {
            // Zero vector has no direction — undefined cosine distance.
            return Ok(Vec::new());
        }

        let mut scored: Vec<(NodeId, f32)> = self
            .entries
            .iter()
            .map(|e| {
                let distance = 1.0 - cosine_similarity(embedding, &e.embedding, query_norm);
                (e.id.clone(), distance)
            })
            .collect();

        // Full sort is fine at this scale; tie on id so equal distances rank
        // deterministically.
        scored.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        Ok(scored)
    }

    fn remove(&mut self, id: &NodeId) -> Result<()> {
        if let Some(pos) = self.entries.iter().position(|e| &e.id == id) {
            // Swap-remove: ordering doesn't matter, results are re-ranked.
            self.entries.swap_remove(pos);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Math helpers
// ---------------------------------------------------------------------------

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity between `a` and `b`. `a_norm` is pre-computed by the
/// caller to avoid redundant work when one query is scored against many
/// entries. Returns `0.0` for a zero `b` or a length mismatch — `zip` would
/// otherwise silently truncate and produce a wrong score.
fn cosine_similarity(a: &[f32], b: &[f32], a_norm: f32) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let b_norm = l2_norm(b);
    if b_norm == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    dot / (a_norm * b_norm)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ids(n: usize) -> Vec<NodeId> {
        (0..n).map(|_| NodeId::new()).collect()
    }

    #[test]
    fn test_l2_norm_unit_vector() {
        let v = vec![1.0f32, 0.0, 0.0];
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_identical_vectors() {
        let v = vec![1.0f32, 2.0, 3.0];
        let norm = l2_norm(&v);
        assert!((cosine_similarity(&v, &v, norm) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal_vectors() {
        let a = vec![1.0f32, 0.0];
        let b = vec![0.0f32, 1.0];
        let norm_a = l2_norm(&a);
        assert!((cosine_similarity(&a, &b, norm_a)).abs() < 1e-6);
    }

    #[test]
    fn test_upsert_replaces_existing_id() {
        let mut idx = FlatVectorIndex::new();
        let id = NodeId::new();
        idx.upsert(&id, &[1.0, 0.0, 0.0]).unwrap();
        idx.upsert(&id, &[0.0, 1.0, 0.0]).unwrap();
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn test_upsert_empty_embedding_is_rejected() {
        let mut idx = FlatVectorIndex::new();
        let result = idx.upsert(&NodeId::new(), &[]);
        assert!(matches!(result, Err(NotegraphError::InvalidEmbedding(_))));
    }

    #[test]
    fn test_upsert_dimension_mismatch_is_rejected() {
        let mut idx = FlatVectorIndex::new();
        idx.upsert(&NodeId::new(), &[1.0, 0.0]).unwrap();
        let result = idx.upsert(&NodeId::new(), &[1.0, 0.0, 0.0]);
        assert!(matches!(result, Err(NotegraphError::InvalidEmbedding(_))));
    }

    #[test]
    fn test_remove_existing_and_nonexistent() {
        let mut idx = FlatVectorIndex::new();
        let id = NodeId::new();
        idx.upsert(&id, &[1.0, 0.0]).unwrap();
        idx.remove(&NodeId::new()).unwrap(); // absent id is a no-op
        assert_eq!(idx.len(), 1);
        idx.remove(&id).unwrap();
        assert!(idx.is_empty());
    }

    #[test]
    fn test_query_orders_by_distance() {
        let mut idx = FlatVectorIndex::new();
        let ids = make_ids(3);

        // Relative to query [1,0,0]:
        //   ids[0] → [1,0,0]  distance = 0.0 (best)
        //   ids[1] → [0,1,0]  distance = 1.0
        //   ids[2] → [-1,0,0] distance = 2.0 (worst)
        idx.upsert(&ids[0], &[1.0, 0.0, 0.0]).unwrap();
        idx.upsert(&ids[1], &[0.0, 1.0, 0.0]).unwrap();
        idx.upsert(&ids[2], &[-1.0, 0.0, 0.0]).unwrap();

        let results = idx.query(&[1.0, 0.0, 0.0], 3).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, ids[0]);
        assert!(results[0].1.abs() < 1e-6);
        assert_eq!(results[1].0, ids[1]);
        assert_eq!(results[2].0, ids[2]);
        assert!((results[2].1 - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_query_truncates_to_k() {
        let mut idx = FlatVectorIndex::new();
        for id in make_ids(5) {
            idx.upsert(&id, &[1.0, 0.0]).unwrap();
        }
        assert_eq!(idx.query(&[1.0, 0.0], 3).unwrap().len(), 3);
        assert!(idx.query(&[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn test_query_zero_vector_returns_empty() {
        let mut idx = FlatVectorIndex::new();
        idx.upsert(&NodeId::new(), &[1.0, 0.0]).unwrap();
        assert!(idx.query(&[0.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_query_equal_distances_tie_break_on_id() {
        let mut idx = FlatVectorIndex::new();
        let mut ids = make_ids(3);
        for id in &ids {
            idx.upsert(id, &[1.0, 0.0]).unwrap();
        }
        ids.sort();
        let results = idx.query(&[1.0, 0.0], 3).unwrap();
        let returned: Vec<NodeId> = results.into_iter().map(|(id, _)| id).collect();
        assert_eq!(returned, ids);
    }
}
