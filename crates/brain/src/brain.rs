//! High-level knowledge surface over the notegraph engine.
//!
//! [`Brain`] is what the surrounding system talks to: it owns the embedding
//! provider and the vector index, wires them into the core engine, and keeps
//! the two stores consistent across ingest and delete. The graph itself never
//! sees an embedding model — it only receives vectors through the
//! [`VectorIndex`] trait.
//!
//! Collaborator failures are absorbed here: a down embedder or vector store
//! downgrades ingestion and search to lexical-only, it never fails them.
//! Storage failures from the graph are the one class of error that
//! propagates.

use chrono::NaiveDate;
use notegraph::{
    contextual_text, EmbeddingProvider, FlatVectorIndex, GraphStats, KnowledgeGraph, Node, NodeId,
    NodeSummary, NoteInput, RelatedNode, SearchFilters, SearchHit, SearchWeights, VectorIndex,
};
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

pub use notegraph::NotegraphError as Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Personal knowledge base: graph storage plus semantic retrieval.
pub struct Brain {
    graph: KnowledgeGraph,
    embedder: Option<Box<dyn EmbeddingProvider + Send>>,
    /// In-memory; rebuilt by re-embedding on startup when an embedder is
    /// configured. Mutex rather than RwLock because upserts and queries are
    /// both short and the index is not the contended path.
    vectors: Mutex<Box<dyn VectorIndex + Send>>,
}

impl Brain {
    /// Open or create a knowledge base at `path`. No embedder is configured;
    /// search runs lexical-only until [`with_embedder`](Self::with_embedder)
    /// is called.
    pub fn open(path: &str) -> Result<Self> {
        Ok(Self::from_graph(KnowledgeGraph::open(path)?))
    }

    /// In-memory knowledge base for tests and ephemeral sessions.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_graph(KnowledgeGraph::open_in_memory()?))
    }

    fn from_graph(graph: KnowledgeGraph) -> Self {
        Self {
            graph,
            embedder: None,
            vectors: Mutex::new(Box::new(FlatVectorIndex::new())),
        }
    }

    /// Configure the embedding provider used at ingest and query time.
    pub fn with_embedder(mut self, embedder: Box<dyn EmbeddingProvider + Send>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Replace the default flat index with an external vector store adapter.
    pub fn with_vector_index(mut self, index: Box<dyn VectorIndex + Send>) -> Self {
        self.vectors = Mutex::new(index);
        self
    }

    /// Direct access to the underlying graph, for callers that need
    /// lower-level queries than this surface exposes.
    pub fn graph(&self) -> &KnowledgeGraph {
        &self.graph
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Ingest one piece of content and index its embedding.
    ///
    /// The graph write is the source of truth: once it commits, embedding or
    /// vector-store failures are logged and swallowed — the node simply stays
    /// lexical-only until the next re-index.
    pub fn ingest(&self, input: NoteInput) -> Result<NodeId> {
        let title = input.title.clone();
        let tags = input.tags.clone();
        let body = input.body.clone().unwrap_or_default();

        let id = self.graph.ingest(input)?;

        if let Some(embedder) = &self.embedder {
            let document = contextual_text(&title, &tags, &body);
            match embedder.embed(&document) {
                Ok(embedding) => {
                    let mut vectors = self.lock_vectors()?;
                    if let Err(e) = vectors.upsert(&id, &embedding) {
                        warn!(node = %id, error = %e, "vector upsert failed, node stays lexical-only");
                    }
                }
                Err(e) => {
                    warn!(node = %id, error = %e, "embedding failed, node stays lexical-only");
                }
            }
        }
        Ok(id)
    }

    /// Delete a node, its edges, and its embedding.
    pub fn delete(&self, id: &NodeId) -> Result<()> {
        self.graph.remove_node(id)?;
        let mut vectors = self.lock_vectors()?;
        if let Err(e) = vectors.remove(id) {
            warn!(node = %id, error = %e, "vector removal failed after node deletion");
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Hybrid search. `weights` of `None` uses the default lexical/vector
    /// balance. Degrades to lexical-only when no embedder is configured or
    /// the embedding call fails.
    pub fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
        weights: Option<SearchWeights>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let query_embedding = match &self.embedder {
            Some(embedder) => match embedder.embed(query) {
                Ok(v) => Some(v),
                Err(e) => {
                    warn!(error = %e, "query embedding failed, searching lexical-only");
                    None
                }
            },
            None => None,
        };

        let vectors = self.lock_vectors()?;
        self.graph.search_hybrid(
            query,
            query_embedding.as_deref(),
            Some(&**vectors),
            filters,
            weights.unwrap_or_default(),
            limit,
        )
    }

    pub fn node(&self, id: &NodeId) -> Result<Node> {
        self.graph.node(id)
    }

    /// Everything that mentions the given node.
    pub fn backlinks(&self, id: &NodeId) -> Result<Vec<NodeSummary>> {
        self.graph.backlinks(id)
    }

    /// Content under a tag, including its descendant subtree.
    pub fn by_tag(&self, tag: &str) -> Result<Vec<NodeSummary>> {
        self.graph.by_tag(tag)
    }

    /// Everything ingested on a given calendar date.
    pub fn daily(&self, date: NaiveDate) -> Result<Vec<NodeSummary>> {
        self.graph.daily(date)
    }

    /// Graph neighbourhood of a node, both edge directions, depth-bounded.
    pub fn related(&self, id: &NodeId, max_depth: usize) -> Result<Vec<RelatedNode>> {
        self.graph.related(id, max_depth)
    }

    pub fn stats(&self) -> Result<GraphStats> {
        self.graph.stats()
    }

    fn lock_vectors(&self) -> Result<MutexGuard<'_, Box<dyn VectorIndex + Send>>> {
        self.vectors
            .lock()
            .map_err(|_| Error::Internal("vector index lock poisoned".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
