//! Notegraph — embedded knowledge graph with hybrid retrieval.
//!
//! The core primitive is a [`Node`]: an addressable unit of content (a note,
//! an article, a video summary) or structure (a tag, a daily anchor, a
//! placeholder for an unresolved reference). Nodes are connected by typed,
//! directed [`Edge`]s, and the engine enforces the graph's consistency rules —
//! symmetric mention pairs, deduplicated tag chains, one daily anchor per
//! calendar date — rather than leaving them to the application.
//!
//! All state lives in a single `redb` database file. redb serialises write
//! transactions and gives readers MVCC snapshots, so there is exactly one
//! logical owner of graph state per file: concurrent writers queue behind the
//! storage layer instead of clobbering each other's in-memory copies.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use notegraph::{KnowledgeGraph, NodeKind, NoteInput};
//!
//! let graph = KnowledgeGraph::open("my-notes.notegraph").unwrap();
//!
//! // Ingest a note: [[references]] are resolved, tags expanded, the daily
//! // anchor linked — all as one logical unit.
//! let input = NoteInput::new("Intro to Graphs", NodeKind::Note)
//!     .with_body("Graphs are everywhere. See [[Adjacency Lists]].")
//!     .with_tags(["cs/theory"]);
//! let id = graph.ingest(input).unwrap();
//!
//! // Hierarchy-aware tag query: "cs" finds content tagged "cs/theory".
//! let hits = graph.by_tag("cs").unwrap();
//! assert_eq!(hits[0].id, id);
//! ```

mod hybrid;
mod lexical;
mod vector;

pub use hybrid::{contextual_text, SearchFilters, SearchHit, SearchWeights};
pub use vector::{EmbeddingProvider, FlatVectorIndex, VectorIndex};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::OnceLock;
use tracing::debug;
use ulid::Ulid;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NotegraphError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for NotegraphError {
    fn from(e: redb::DatabaseError) -> Self {
        NotegraphError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for NotegraphError {
    fn from(e: redb::TransactionError) -> Self {
        NotegraphError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for NotegraphError {
    fn from(e: redb::TableError) -> Self {
        NotegraphError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for NotegraphError {
    fn from(e: redb::StorageError) -> Self {
        NotegraphError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for NotegraphError {
    fn from(e: redb::CommitError) -> Self {
        NotegraphError::Storage(e.to_string())
    }
}
impl From<tantivy::TantivyError> for NotegraphError {
    fn from(e: tantivy::TantivyError) -> Self {
        NotegraphError::Search(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NotegraphError>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// A stable string identifier for a [`Node`].
///
/// Content and placeholder nodes get time-sortable ULIDs. Structural nodes use
/// deterministic ids (`tag:<path>`, `daily:<date>`) so that get-or-create is
/// naturally idempotent: the same tag or date always maps to the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    pub(crate) fn for_tag(path: &str) -> Self {
        Self(format!("tag:{}", path.to_lowercase()))
    }

    pub(crate) fn for_day(date: NaiveDate) -> Self {
        Self(format!("daily:{}", date.format("%Y-%m-%d")))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a node *is*. Closed set — edge traversal and ingestion match on this
/// exhaustively, so adding a kind is a compile-visible change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    /// A plain note authored by the user.
    Note,
    /// Saved web/article content.
    Article,
    /// A video summary or transcript digest.
    Video,
    /// Created to satisfy a `[[reference]]` whose title has no node yet.
    Placeholder,
    /// One per calendar date; everything ingested that day links to it.
    DailyAnchor,
    /// One per hierarchical tag path segment chain.
    Tag,
}

impl NodeKind {
    /// Content kinds are the ones callers ingest directly and queries return.
    pub fn is_content(self) -> bool {
        matches!(self, NodeKind::Note | NodeKind::Article | NodeKind::Video)
    }

    /// Structural kinds exist to organise content, never to be ranked.
    pub fn is_structural(self) -> bool {
        matches!(self, NodeKind::DailyAnchor | NodeKind::Tag)
    }
}

/// The closed set of relationship kinds.
///
/// `Mentions`/`MentionedBy` are always created as a symmetric pair.
/// `ParentTag` and `Temporal` are one-directional. `RelatedTo` pairs are
/// produced by the tag-overlap heuristic at ingestion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    Mentions,
    MentionedBy,
    ParentTag,
    Temporal,
    RelatedTo,
}

impl EdgeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeKind::Mentions => "mentions",
            EdgeKind::MentionedBy => "mentioned-by",
            EdgeKind::ParentTag => "parent-tag",
            EdgeKind::Temporal => "temporal",
            EdgeKind::RelatedTo => "related-to",
        }
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in the graph. Owned exclusively by the [`KnowledgeGraph`]; every
/// other component refers to nodes by [`NodeId`] only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub title: String,
    pub kind: NodeKind,
    /// Tags as given at ingestion. Hierarchy membership is *not* materialised
    /// here — a node tagged `a/b/c` carries only `a/b/c`; ancestor queries
    /// traverse `parent-tag` edges instead.
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub body: Option<String>,
    /// Provenance: where the content came from (URL, channel, "journal", ...).
    pub source: Option<String>,
}

impl Node {
    pub fn summary(&self) -> NodeSummary {
        NodeSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            kind: self.kind,
            tags: self.tags.clone(),
            created_at: self.created_at,
            snippet: self
                .body
                .as_ref()
                .map(|b| b.chars().take(SNIPPET_CHARS).collect()),
        }
    }
}

/// A typed, directed relationship. Identity is the `(source, target, kind)`
/// triple — re-adding the same triple is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub kind: EdgeKind,
    pub created_at: DateTime<Utc>,
}

/// Lightweight view of a node for query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub title: String,
    pub kind: NodeKind,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub snippet: Option<String>,
}

/// A neighbour reached by [`KnowledgeGraph::related`], with the kind of the
/// first edge that connected it and its BFS depth from the origin.
#[derive(Debug, Clone)]
pub struct RelatedNode {
    pub node: NodeSummary,
    pub kind: EdgeKind,
    pub depth: usize,
}

/// Node/edge counts and tag frequencies, most-used tag first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes: usize,
    pub edges: usize,
    pub tags: Vec<(String, usize)>,
}

/// Everything needed to ingest one piece of content.
#[derive(Debug, Clone)]
pub struct NoteInput {
    pub title: String,
    pub body: Option<String>,
    pub tags: Vec<String>,
    pub kind: NodeKind,
    pub source: Option<String>,
    pub metadata: BTreeMap<String, String>,
    /// Which daily anchor to attach to. Defaults to today (UTC). When given,
    /// the node's `created_at` is pinned to midnight of this date so that
    /// date-range filters and the daily anchor agree.
    pub date: Option<NaiveDate>,
}

impl NoteInput {
    pub fn new(title: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            title: title.into(),
            body: None,
            tags: Vec::new(),
            kind,
            source: None,
            metadata: BTreeMap::new(),
            date: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }
}

const SNIPPET_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// Tag helpers
// ---------------------------------------------------------------------------

/// Ordered prefixes of a slash-delimited tag: `"a/b/c"` → `["a", "a/b",
/// "a/b/c"]`. Empty segments (`"a//b"`) are skipped.
pub fn tag_prefixes(tag: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut path = String::new();
    for segment in tag.split('/').map(str::trim).filter(|s| !s.is_empty()) {
        if !path.is_empty() {
            path.push('/');
        }
        path.push_str(segment);
        prefixes.push(path.clone());
    }
    prefixes
}

/// Canonical (lowercased, segment-trimmed) form of a tag path, or `None` if
/// the tag has no non-empty segment.
pub(crate) fn canonical_tag(tag: &str) -> Option<String> {
    tag_prefixes(tag).pop().map(|p| p.to_lowercase())
}

/// Canonical prefixes of every tag in the list, for overlap checks.
fn expanded_tag_set(tags: &[String]) -> BTreeSet<String> {
    tags.iter()
        .flat_map(|t| tag_prefixes(t))
        .map(|p| p.to_lowercase())
        .collect()
}

// ---------------------------------------------------------------------------
// Link syntax
// ---------------------------------------------------------------------------

static WIKI_LINK_RE: OnceLock<Regex> = OnceLock::new();

/// `[[Title]]` — an unterminated `[[` simply never matches, so malformed
/// syntax is ignored rather than rejected.
fn wiki_link_re() -> &'static Regex {
    WIKI_LINK_RE.get_or_init(|| Regex::new(r"\[\[([^\]]+)\]\]").expect("static pattern is valid"))
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Node rows keyed by node id, value is the JSON-serialised [`Node`].
const NODES: TableDefinition<&str, &str> = TableDefinition::new("nodes");

/// Edge rows keyed by `"{source}\x1f{kind}\x1f{target}"`, value is the
/// JSON-serialised [`Edge`]. Keying by the identity triple makes duplicate
/// edge creation an overwrite-free no-op, and gives outgoing-edge lookups a
/// prefix scan. Incoming-edge lookups scan the table; at this engine's scale
/// that is the same strategy the node table uses everywhere else.
const EDGES: TableDefinition<&str, &str> = TableDefinition::new("edges");

/// Key separator for the edges table. Node ids are ULIDs or `tag:`/`daily:`
/// prefixed paths and never contain a unit separator.
const KEY_SEP: char = '\u{1f}';

fn edge_key(source: &NodeId, kind: EdgeKind, target: &NodeId) -> String {
    format!(
        "{}{KEY_SEP}{}{KEY_SEP}{}",
        source.0,
        kind.as_str(),
        target.0
    )
}

/// Embedded knowledge graph.
///
/// All writes are ACID (backed by `redb`). The database file uses the
/// `.notegraph` extension by convention.
pub struct KnowledgeGraph {
    db: Database,
}

impl KnowledgeGraph {
    /// Open or create a notegraph database at the given path.
    pub fn open(path: &str) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory database (no file I/O). Useful for tests and
    /// ephemeral workloads; data is lost when the instance is dropped.
    pub fn open_in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(NODES)?;
            write_txn.open_table(EDGES)?;
            write_txn.commit()?;
        }
        Ok(Self { db })
    }

    // ------------------------------------------------------------------
    // Node access
    // ------------------------------------------------------------------

    /// Retrieve a node by id.
    pub fn node(&self, id: &NodeId) -> Result<Node> {
        self.try_node(id)?
            .ok_or_else(|| NotegraphError::NotFound(format!("node {id}")))
    }

    fn try_node(&self, id: &NodeId) -> Result<Option<Node>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(NODES)?;
        match table.get(id.0.as_str())? {
            Some(guard) => Ok(Some(serde_json::from_str(guard.value())?)),
            None => Ok(None),
        }
    }

    pub(crate) fn all_nodes(&self) -> Result<Vec<Node>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(NODES)?;
        let mut nodes = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            nodes.push(serde_json::from_str(v.value())?);
        }
        Ok(nodes)
    }

    fn put_node(&self, node: &Node) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(NODES)?;
            table.insert(node.id.0.as_str(), serde_json::to_string(node)?.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// First node whose title matches `title` case-insensitively. Scan order
    /// is key order; ULIDs are time-sortable, so the earliest-created match
    /// wins consistently — re-resolving the same title always yields the same
    /// node.
    fn find_by_title(&self, title: &str) -> Result<Option<Node>> {
        let wanted = title.to_lowercase();
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(NODES)?;
        for entry in table.iter()? {
            let (_k, v) = entry?;
            let node: Node = serde_json::from_str(v.value())?;
            if node.title.to_lowercase() == wanted {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Remove a node and every edge touching it, in one transaction. There is
    /// no soft-delete: content removal must leave no dangling edges.
    pub fn remove_node(&self, id: &NodeId) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut nodes = write_txn.open_table(NODES)?;
            if nodes.remove(id.0.as_str())?.is_none() {
                return Err(NotegraphError::NotFound(format!("node {id}")));
            }
        }
        {
            let mut edges = write_txn.open_table(EDGES)?;
            let mut doomed = Vec::new();
            for entry in edges.iter()? {
                let (k, v) = entry?;
                let edge: Edge = serde_json::from_str(v.value())?;
                if edge.source == *id || edge.target == *id {
                    doomed.push(k.value().to_string());
                }
            }
            for key in &doomed {
                edges.remove(key.as_str())?;
            }
        }
        write_txn.commit()?;
        debug!(node = %id, "removed node and touching edges");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Edge access
    // ------------------------------------------------------------------

    /// Insert an edge row if the `(source, kind, target)` triple is absent.
    /// Returns whether a row was written.
    fn add_edge_in_txn(
        write_txn: &redb::WriteTransaction,
        source: &NodeId,
        kind: EdgeKind,
        target: &NodeId,
    ) -> Result<bool> {
        let key = edge_key(source, kind, target);
        let mut table = write_txn.open_table(EDGES)?;
        if table.get(key.as_str())?.is_some() {
            return Ok(false);
        }
        let edge = Edge {
            source: source.clone(),
            target: target.clone(),
            kind,
            created_at: Utc::now(),
        };
        table.insert(key.as_str(), serde_json::to_string(&edge)?.as_str())?;
        Ok(true)
    }

    /// Create the symmetric `mentions`/`mentioned-by` pair in one transaction.
    /// The two edges commit together or not at all.
    fn add_mention_pair(&self, source: &NodeId, target: &NodeId) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        Self::add_edge_in_txn(&write_txn, source, EdgeKind::Mentions, target)?;
        Self::add_edge_in_txn(&write_txn, target, EdgeKind::MentionedBy, source)?;
        write_txn.commit()?;
        Ok(())
    }

    /// Create the symmetric `related-to` pair in one transaction.
    fn add_related_pair(&self, a: &NodeId, b: &NodeId) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        Self::add_edge_in_txn(&write_txn, a, EdgeKind::RelatedTo, b)?;
        Self::add_edge_in_txn(&write_txn, b, EdgeKind::RelatedTo, a)?;
        write_txn.commit()?;
        Ok(())
    }

    pub(crate) fn all_edges(&self) -> Result<Vec<Edge>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EDGES)?;
        let mut edges = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            edges.push(serde_json::from_str(v.value())?);
        }
        Ok(edges)
    }

    /// Targets of outgoing `kind` edges from `id` (prefix scan).
    pub(crate) fn edges_from(&self, id: &NodeId, kind: EdgeKind) -> Result<Vec<NodeId>> {
        let prefix = format!("{}{KEY_SEP}{}{KEY_SEP}", id.0, kind.as_str());
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EDGES)?;
        let mut targets = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            if k.value().starts_with(prefix.as_str()) {
                let edge: Edge = serde_json::from_str(v.value())?;
                targets.push(edge.target);
            }
        }
        Ok(targets)
    }

    /// Sources of incoming `kind` edges into `id`.
    pub(crate) fn edges_into(&self, id: &NodeId, kind: EdgeKind) -> Result<Vec<NodeId>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EDGES)?;
        let mut sources = Vec::new();
        for entry in table.iter()? {
            let (_k, v) = entry?;
            let edge: Edge = serde_json::from_str(v.value())?;
            if edge.kind == kind && edge.target == *id {
                sources.push(edge.source);
            }
        }
        Ok(sources)
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Ingest one piece of content: write the node, expand its tag chains,
    /// resolve `[[references]]`, attach the daily anchor, and cross-link by
    /// tag overlap.
    ///
    /// Each step is its own ACID transaction and every step is idempotent, so
    /// a retried ingest converges to the same graph (the same pattern as a
    /// correction: a sequence of small serialised writes, not one giant
    /// transaction).
    ///
    /// Re-ingesting identical content (same title and body, case-insensitive
    /// title match) keeps the existing node id, merges in any newly supplied
    /// tags, metadata, and source, and re-runs the pipeline steps.
    /// Ingesting content whose title matches an existing *placeholder*
    /// upgrades that placeholder in place, keeping its id and therefore every
    /// backlink already pointing at it.
    pub fn ingest(&self, input: NoteInput) -> Result<NodeId> {
        if !input.kind.is_content() {
            return Err(NotegraphError::InvalidInput(format!(
                "cannot ingest structural kind {:?}; only note/article/video content",
                input.kind
            )));
        }

        let explicit_date = input.date;
        let created_at = match input.date {
            Some(d) => d.and_time(NaiveTime::MIN).and_utc(),
            None => Utc::now(),
        };

        let node = match self.find_by_title(&input.title)? {
            Some(existing) if existing.kind == NodeKind::Placeholder => {
                debug!(node = %existing.id, title = %input.title, "upgrading placeholder");
                Node {
                    id: existing.id,
                    title: input.title,
                    kind: input.kind,
                    tags: input.tags,
                    created_at,
                    metadata: input.metadata,
                    body: input.body,
                    source: input.source,
                }
            }
            Some(existing) if existing.kind == input.kind && existing.body == input.body => {
                // Duplicate content merges rather than short-circuits: tags,
                // metadata, and source supplied on a re-ingest must land, and
                // the pipeline steps below must re-run so a retry that died
                // between put_node and the later steps still converges.
                debug!(node = %existing.id, title = %existing.title, "duplicate content, merging into existing node");
                let mut tags = existing.tags;
                for tag in input.tags {
                    if !tags.iter().any(|t| t.eq_ignore_ascii_case(&tag)) {
                        tags.push(tag);
                    }
                }
                let mut metadata = existing.metadata;
                metadata.extend(input.metadata);
                Node {
                    id: existing.id,
                    title: existing.title,
                    kind: existing.kind,
                    tags,
                    created_at: existing.created_at,
                    metadata,
                    body: existing.body,
                    source: input.source.or(existing.source),
                }
            }
            _ => Node {
                id: NodeId::new(),
                title: input.title,
                kind: input.kind,
                tags: input.tags,
                created_at,
                metadata: input.metadata,
                body: input.body,
                source: input.source,
            },
        };

        // Anchor to the explicit date, or to the node's own creation date so a
        // merge does not attach yesterday's note to today's anchor.
        let anchor_date = explicit_date.unwrap_or_else(|| node.created_at.date_naive());

        debug!(node = %node.id, title = %node.title, "ingesting");
        self.put_node(&node)?;

        for tag in &node.tags {
            self.ensure_tag_chain(tag)?;
        }
        self.resolve_links(&node)?;
        self.link_to_day(&node.id, anchor_date)?;
        self.auto_link_related(&node)?;

        Ok(node.id)
    }

    /// Scan `body + title` for `[[Title]]` references, resolve each to an
    /// existing node or a fresh placeholder, and create the symmetric mention
    /// pair. Self-references are resolved but never linked — a node may not
    /// edge to itself.
    fn resolve_links(&self, node: &Node) -> Result<()> {
        let mut haystack = String::new();
        if let Some(body) = &node.body {
            haystack.push_str(body);
            haystack.push(' ');
        }
        haystack.push_str(&node.title);

        for cap in wiki_link_re().captures_iter(&haystack) {
            let link = cap[1].trim();
            if link.is_empty() {
                continue;
            }
            let target = match self.find_by_title(link)? {
                Some(existing) => existing.id,
                None => self.create_placeholder(link)?,
            };
            if target == node.id {
                continue;
            }
            self.add_mention_pair(&node.id, &target)?;
        }
        Ok(())
    }

    fn create_placeholder(&self, title: &str) -> Result<NodeId> {
        let node = Node {
            id: NodeId::new(),
            title: title.to_string(),
            kind: NodeKind::Placeholder,
            tags: Vec::new(),
            created_at: Utc::now(),
            metadata: BTreeMap::new(),
            body: None,
            source: None,
        };
        self.put_node(&node)?;
        debug!(node = %node.id, title = %title, "created placeholder for unresolved reference");
        Ok(node.id)
    }

    /// Ensure the full tag chain for a slash-delimited tag exists: one tag
    /// node per prefix and a `parent-tag` edge from each prefix to its
    /// immediate predecessor. Idempotent — re-tagging writes nothing.
    pub(crate) fn ensure_tag_chain(&self, tag: &str) -> Result<()> {
        let prefixes = tag_prefixes(tag);
        if prefixes.is_empty() {
            return Ok(());
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut nodes = write_txn.open_table(NODES)?;
            let mut edges = write_txn.open_table(EDGES)?;
            let mut parent: Option<NodeId> = None;

            for prefix in &prefixes {
                let id = NodeId::for_tag(prefix);
                if nodes.get(id.0.as_str())?.is_none() {
                    let tag_node = Node {
                        id: id.clone(),
                        title: prefix.clone(),
                        kind: NodeKind::Tag,
                        tags: Vec::new(),
                        created_at: Utc::now(),
                        metadata: BTreeMap::new(),
                        body: None,
                        source: None,
                    };
                    nodes.insert(id.0.as_str(), serde_json::to_string(&tag_node)?.as_str())?;
                }

                if let Some(parent_id) = &parent {
                    let key = edge_key(&id, EdgeKind::ParentTag, parent_id);
                    if edges.get(key.as_str())?.is_none() {
                        let edge = Edge {
                            source: id.clone(),
                            target: parent_id.clone(),
                            kind: EdgeKind::ParentTag,
                            created_at: Utc::now(),
                        };
                        edges.insert(key.as_str(), serde_json::to_string(&edge)?.as_str())?;
                    }
                }
                parent = Some(id);
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get-or-create the daily anchor for `date` and link `id` to it. The
    /// anchor's deterministic id guarantees exactly one node per calendar
    /// date, created lazily on first use.
    fn link_to_day(&self, id: &NodeId, date: NaiveDate) -> Result<()> {
        let anchor_id = NodeId::for_day(date);
        let write_txn = self.db.begin_write()?;
        {
            let mut nodes = write_txn.open_table(NODES)?;
            if nodes.get(anchor_id.0.as_str())?.is_none() {
                let anchor = Node {
                    id: anchor_id.clone(),
                    title: date.format("%Y-%m-%d").to_string(),
                    kind: NodeKind::DailyAnchor,
                    tags: Vec::new(),
                    created_at: Utc::now(),
                    metadata: BTreeMap::new(),
                    body: None,
                    source: None,
                };
                nodes.insert(anchor_id.0.as_str(), serde_json::to_string(&anchor)?.as_str())?;
            }
        }
        Self::add_edge_in_txn(&write_txn, id, EdgeKind::Temporal, &anchor_id)?;
        write_txn.commit()?;
        Ok(())
    }

    /// Cross-link the new node to existing content sharing any expanded tag
    /// prefix, as a symmetric `related-to` pair per neighbour.
    fn auto_link_related(&self, node: &Node) -> Result<()> {
        if node.tags.is_empty() {
            return Ok(());
        }
        let mine = expanded_tag_set(&node.tags);
        for other in self.all_nodes()? {
            if other.id == node.id || !other.kind.is_content() || other.tags.is_empty() {
                continue;
            }
            let theirs = expanded_tag_set(&other.tags);
            if mine.intersection(&theirs).next().is_some() {
                self.add_related_pair(&node.id, &other.id)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// All nodes with a `mentions` edge pointing at `id`.
    ///
    /// Only the canonical `mentions` direction is consulted — both edges of a
    /// symmetric pair encode the same relationship, so reading both would
    /// double-count.
    pub fn backlinks(&self, id: &NodeId) -> Result<Vec<NodeSummary>> {
        let sources = self.edges_into(id, EdgeKind::Mentions)?;
        self.summaries(sources)
    }

    /// Content attached to `tag` or to any tag in its descendant subtree.
    ///
    /// Storage points `parent-tag` edges upward (child → parent); this query
    /// walks them in reverse to collect the full subtree, so `by_tag("a")`
    /// includes content tagged `a/b/c`.
    pub fn by_tag(&self, tag: &str) -> Result<Vec<NodeSummary>> {
        let wanted = self.descendant_tags(tag)?;
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits: Vec<NodeSummary> = self
            .all_nodes()?
            .into_iter()
            .filter(|n| n.kind.is_content())
            .filter(|n| {
                n.tags
                    .iter()
                    .any(|t| canonical_tag(t).is_some_and(|c| wanted.contains(&c)))
            })
            .map(|n| n.summary())
            .collect();
        sort_summaries(&mut hits);
        Ok(hits)
    }

    /// The queried tag plus every tag reachable downward from it, canonical
    /// form. BFS over reversed `parent-tag` edges.
    pub(crate) fn descendant_tags(&self, tag: &str) -> Result<BTreeSet<String>> {
        let Some(root) = canonical_tag(tag) else {
            return Ok(BTreeSet::new());
        };

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for edge in self.all_edges()? {
            if edge.kind != EdgeKind::ParentTag {
                continue;
            }
            let (Some(child), Some(parent)) = (
                edge.source.0.strip_prefix("tag:"),
                edge.target.0.strip_prefix("tag:"),
            ) else {
                continue;
            };
            children
                .entry(parent.to_string())
                .or_default()
                .push(child.to_string());
        }

        let mut wanted = BTreeSet::new();
        let mut queue = VecDeque::from([root.clone()]);
        wanted.insert(root);
        while let Some(current) = queue.pop_front() {
            for child in children.get(&current).into_iter().flatten() {
                if wanted.insert(child.clone()) {
                    queue.push_back(child.clone());
                }
            }
        }
        Ok(wanted)
    }

    /// Everything attached to the daily anchor for `date` — the predecessors
    /// of the anchor along `temporal` edges, not a property on the content.
    pub fn daily(&self, date: NaiveDate) -> Result<Vec<NodeSummary>> {
        let anchor_id = NodeId::for_day(date);
        let sources = self.edges_into(&anchor_id, EdgeKind::Temporal)?;
        self.summaries(sources)
    }

    /// Nodes connected to `id` within `max_depth` hops, following edges in
    /// both directions. Returns BFS order; an unknown id yields an empty list.
    pub fn related(&self, id: &NodeId, max_depth: usize) -> Result<Vec<RelatedNode>> {
        if self.try_node(id)?.is_none() {
            return Ok(Vec::new());
        }

        let mut adjacency: HashMap<NodeId, Vec<(NodeId, EdgeKind)>> = HashMap::new();
        for edge in self.all_edges()? {
            adjacency
                .entry(edge.source.clone())
                .or_default()
                .push((edge.target.clone(), edge.kind));
            adjacency
                .entry(edge.target)
                .or_default()
                .push((edge.source, edge.kind));
        }

        let mut visited: HashSet<NodeId> = HashSet::from([id.clone()]);
        let mut queue = VecDeque::from([(id.clone(), 0_usize)]);
        let mut out = Vec::new();

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            for (neighbour, kind) in adjacency.get(&current).into_iter().flatten() {
                if visited.insert(neighbour.clone()) {
                    queue.push_back((neighbour.clone(), depth + 1));
                    out.push(RelatedNode {
                        node: self.node(neighbour)?.summary(),
                        kind: *kind,
                        depth: depth + 1,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Graph statistics: counts plus tag frequencies over content nodes.
    pub fn stats(&self) -> Result<GraphStats> {
        let nodes = self.all_nodes()?;
        let edges = self.all_edges()?;

        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for node in &nodes {
            for tag in &node.tags {
                if let Some(canonical) = canonical_tag(tag) {
                    *counts.entry(canonical).or_insert(0) += 1;
                }
            }
        }
        let mut tags: Vec<(String, usize)> = counts.into_iter().collect();
        tags.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Ok(GraphStats {
            nodes: nodes.len(),
            edges: edges.len(),
            tags,
        })
    }

    fn summaries(&self, ids: Vec<NodeId>) -> Result<Vec<NodeSummary>> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.node(&id)?.summary());
        }
        sort_summaries(&mut out);
        Ok(out)
    }
}

/// Canonical result order: newest first, then id, so equal timestamps still
/// rank deterministically.
fn sort_summaries(summaries: &mut [NodeSummary]) {
    summaries.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> KnowledgeGraph {
        KnowledgeGraph::open_in_memory().unwrap()
    }

    fn note(title: &str) -> NoteInput {
        NoteInput::new(title, NodeKind::Note)
    }

    fn day(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn ingest_and_retrieve_node() {
        let g = graph();
        let id = g
            .ingest(
                note("Intro to Graphs")
                    .with_body("Graphs are everywhere.")
                    .with_tags(["cs/theory"])
                    .with_source("manual"),
            )
            .unwrap();

        let node = g.node(&id).unwrap();
        assert_eq!(node.title, "Intro to Graphs");
        assert_eq!(node.kind, NodeKind::Note);
        assert_eq!(node.tags, vec!["cs/theory"]);
        assert_eq!(node.source.as_deref(), Some("manual"));
    }

    #[test]
    fn ingest_rejects_structural_kinds() {
        let g = graph();
        let result = g.ingest(NoteInput::new("sneaky", NodeKind::Tag));
        assert!(matches!(result, Err(NotegraphError::InvalidInput(_))));
    }

    #[test]
    fn duplicate_content_reuses_node() {
        let g = graph();
        let first = g.ingest(note("Same").with_body("identical body")).unwrap();
        let second = g.ingest(note("Same").with_body("identical body")).unwrap();
        assert_eq!(first, second, "identical content must not fork the graph");

        let content_nodes = g
            .all_nodes()
            .unwrap()
            .into_iter()
            .filter(|n| n.kind.is_content())
            .count();
        assert_eq!(content_nodes, 1);
    }

    #[test]
    fn reingest_merges_tags_and_completes_the_pipeline() {
        let g = graph();
        let first = g
            .ingest(note("Same").with_body("identical body"))
            .unwrap();
        let second = g
            .ingest(
                note("Same")
                    .with_body("identical body")
                    .with_tags(["cs/theory"])
                    .with_source("web"),
            )
            .unwrap();
        assert_eq!(first, second);

        // Newly supplied fields landed on the existing node...
        let node = g.node(&first).unwrap();
        assert_eq!(node.tags, vec!["cs/theory"]);
        assert_eq!(node.source.as_deref(), Some("web"));

        // ...and the tag chain was actually built, not skipped.
        let hits = g.by_tag("cs").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, first);
    }

    // ── Link resolver ──────────────────────────────────────────────────

    #[test]
    fn mention_edges_are_symmetric() {
        let g = graph();
        let b = g.ingest(note("Graphs").with_body("the real note")).unwrap();
        let a = g
            .ingest(note("Reading list").with_body("Start with [[Graphs]]"))
            .unwrap();

        assert_eq!(g.edges_from(&a, EdgeKind::Mentions).unwrap(), vec![b.clone()]);
        assert_eq!(g.edges_from(&b, EdgeKind::MentionedBy).unwrap(), vec![a.clone()]);
        assert_eq!(g.edges_into(&b, EdgeKind::Mentions).unwrap(), vec![a]);
    }

    #[test]
    fn unresolved_reference_creates_placeholder() {
        let g = graph();
        g.ingest(note("Note").with_body("see [[Missing Topic]]"))
            .unwrap();

        let placeholder = g.find_by_title("missing topic").unwrap().unwrap();
        assert_eq!(placeholder.kind, NodeKind::Placeholder);
        assert!(placeholder.body.is_none());
    }

    #[test]
    fn repeated_reference_resolves_to_same_placeholder() {
        let g = graph();
        g.ingest(note("First").with_body("about [[Foo]]")).unwrap();
        g.ingest(note("Second").with_body("also [[foo]]")).unwrap();

        let placeholders: Vec<Node> = g
            .all_nodes()
            .unwrap()
            .into_iter()
            .filter(|n| n.kind == NodeKind::Placeholder)
            .collect();
        assert_eq!(placeholders.len(), 1, "one title, one placeholder");

        let backlinks = g.backlinks(&placeholders[0].id).unwrap();
        assert_eq!(backlinks.len(), 2);
    }

    #[test]
    fn self_reference_is_resolved_but_not_linked() {
        let g = graph();
        let id = g
            .ingest(note("Recursion").with_body("see [[Recursion]]"))
            .unwrap();

        assert!(g.edges_from(&id, EdgeKind::Mentions).unwrap().is_empty());
        assert!(g.backlinks(&id).unwrap().is_empty());
        // No placeholder was synthesized for the node's own title.
        let nodes = g.all_nodes().unwrap();
        assert!(!nodes.iter().any(|n| n.kind == NodeKind::Placeholder));
    }

    #[test]
    fn unterminated_link_syntax_is_ignored() {
        let g = graph();
        g.ingest(note("Broken").with_body("this [[never closes"))
            .unwrap();

        let nodes = g.all_nodes().unwrap();
        assert!(
            !nodes.iter().any(|n| n.kind == NodeKind::Placeholder),
            "partial matches must never resolve"
        );
    }

    #[test]
    fn ingesting_over_placeholder_upgrades_in_place() {
        let g = graph();
        let a = g.ingest(note("A").with_body("see [[Graphs]]")).unwrap();

        let placeholder_id = g.find_by_title("Graphs").unwrap().unwrap().id;
        let upgraded = g
            .ingest(note("Graphs").with_body("now a real note"))
            .unwrap();

        assert_eq!(upgraded, placeholder_id, "id must survive the upgrade");
        let node = g.node(&upgraded).unwrap();
        assert_eq!(node.kind, NodeKind::Note);
        assert_eq!(node.body.as_deref(), Some("now a real note"));

        // Backlinks created against the placeholder still hold.
        let backlinks = g.backlinks(&upgraded).unwrap();
        assert_eq!(backlinks.len(), 1);
        assert_eq!(backlinks[0].id, a);
    }

    // ── Tag hierarchy ──────────────────────────────────────────────────

    #[test]
    fn tag_prefixes_expand_in_order() {
        assert_eq!(tag_prefixes("a/b/c"), vec!["a", "a/b", "a/b/c"]);
        assert_eq!(tag_prefixes("solo"), vec!["solo"]);
        assert_eq!(tag_prefixes("a//b"), vec!["a", "a/b"]);
        assert!(tag_prefixes("///").is_empty());
    }

    #[test]
    fn tag_chain_creates_nodes_and_parent_edges() {
        let g = graph();
        g.ingest(note("n").with_tags(["ai/ml/nlp"])).unwrap();

        let tag_nodes: Vec<Node> = g
            .all_nodes()
            .unwrap()
            .into_iter()
            .filter(|n| n.kind == NodeKind::Tag)
            .collect();
        assert_eq!(tag_nodes.len(), 3, "three segments, three tag nodes");

        let parent_edges: Vec<Edge> = g
            .all_edges()
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EdgeKind::ParentTag)
            .collect();
        assert_eq!(parent_edges.len(), 2, "n segments, n-1 parent edges");

        // Chain direction: most specific points at its immediate predecessor.
        let ml = NodeId::for_tag("ai/ml");
        assert_eq!(
            g.edges_from(&NodeId::for_tag("ai/ml/nlp"), EdgeKind::ParentTag)
                .unwrap(),
            vec![ml]
        );
    }

    #[test]
    fn retagging_is_idempotent() {
        let g = graph();
        g.ingest(note("n").with_tags(["a/b/c"])).unwrap();
        let before = g.stats().unwrap();

        g.ensure_tag_chain("a/b/c").unwrap();
        g.ensure_tag_chain("a/b/c").unwrap();

        let after = g.stats().unwrap();
        assert_eq!(before.nodes, after.nodes);
        assert_eq!(before.edges, after.edges);
    }

    #[test]
    fn by_tag_includes_descendant_subtree() {
        let g = graph();
        let a = g.ingest(note("A").with_tags(["cs/theory"])).unwrap();
        let b = g
            .ingest(note("B").with_tags(["cs/theory/algorithms"]))
            .unwrap();
        let c = g.ingest(note("C").with_tags(["biology"])).unwrap();

        let cs: Vec<NodeId> = g.by_tag("cs").unwrap().into_iter().map(|s| s.id).collect();
        assert!(cs.contains(&a));
        assert!(cs.contains(&b));
        assert!(!cs.contains(&c));

        // Hierarchy inclusion: by_tag("cs") ⊇ by_tag("cs/theory").
        let theory: Vec<NodeId> = g
            .by_tag("cs/theory")
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert!(theory.iter().all(|id| cs.contains(id)));
    }

    #[test]
    fn by_tag_is_case_insensitive() {
        let g = graph();
        let id = g.ingest(note("n").with_tags(["AI/ML"])).unwrap();
        let hits = g.by_tag("ai").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
    }

    #[test]
    fn by_tag_unknown_tag_is_empty() {
        let g = graph();
        g.ingest(note("n").with_tags(["a"])).unwrap();
        assert!(g.by_tag("zzz").unwrap().is_empty());
    }

    // ── Temporal linker ────────────────────────────────────────────────

    #[test]
    fn daily_anchor_is_unique_per_date() {
        let g = graph();
        let d = day("2026-03-01");
        g.ingest(note("one").with_date(d)).unwrap();
        g.ingest(note("two").with_date(d)).unwrap();

        let anchors: Vec<Node> = g
            .all_nodes()
            .unwrap()
            .into_iter()
            .filter(|n| n.kind == NodeKind::DailyAnchor)
            .collect();
        assert_eq!(anchors.len(), 1, "exactly one anchor per calendar date");
        assert_eq!(anchors[0].title, "2026-03-01");
    }

    #[test]
    fn daily_returns_items_linked_to_that_date() {
        let g = graph();
        let d1 = day("2026-03-01");
        let d2 = day("2026-03-02");
        let one = g.ingest(note("one").with_date(d1)).unwrap();
        let two = g.ingest(note("two").with_date(d2)).unwrap();

        let march_first: Vec<NodeId> = g.daily(d1).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(march_first, vec![one]);

        let march_second: Vec<NodeId> = g.daily(d2).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(march_second, vec![two]);
    }

    #[test]
    fn daily_for_unused_date_is_empty() {
        let g = graph();
        assert!(g.daily(day("1999-01-01")).unwrap().is_empty());
    }

    // ── Related-to heuristic ───────────────────────────────────────────

    #[test]
    fn shared_tag_prefix_creates_related_pair() {
        let g = graph();
        let a = g.ingest(note("A").with_tags(["ai/ml"])).unwrap();
        let b = g.ingest(note("B").with_tags(["ai/vision"])).unwrap();

        assert_eq!(g.edges_from(&b, EdgeKind::RelatedTo).unwrap(), vec![a.clone()]);
        assert_eq!(g.edges_from(&a, EdgeKind::RelatedTo).unwrap(), vec![b]);
    }

    #[test]
    fn disjoint_tags_are_not_related() {
        let g = graph();
        let a = g.ingest(note("A").with_tags(["cooking"])).unwrap();
        let b = g.ingest(note("B").with_tags(["chemistry"])).unwrap();
        assert!(g.edges_from(&a, EdgeKind::RelatedTo).unwrap().is_empty());
        assert!(g.edges_from(&b, EdgeKind::RelatedTo).unwrap().is_empty());
    }

    // ── Deletion ───────────────────────────────────────────────────────

    #[test]
    fn remove_node_leaves_no_dangling_edges() {
        let g = graph();
        let b = g.ingest(note("Target").with_body("plain")).unwrap();
        let a = g
            .ingest(note("Source").with_body("links to [[Target]]"))
            .unwrap();

        g.remove_node(&a).unwrap();

        assert!(g.backlinks(&b).unwrap().is_empty());
        let touching = g
            .all_edges()
            .unwrap()
            .into_iter()
            .filter(|e| e.source == a || e.target == a)
            .count();
        assert_eq!(touching, 0, "no edge may survive its node");
        assert!(matches!(g.node(&a), Err(NotegraphError::NotFound(_))));
    }

    #[test]
    fn remove_unknown_node_is_not_found() {
        let g = graph();
        let bogus = NodeId::new();
        assert!(matches!(
            g.remove_node(&bogus),
            Err(NotegraphError::NotFound(_))
        ));
    }

    // ── Traversal & stats ──────────────────────────────────────────────

    #[test]
    fn related_walks_both_directions_within_depth() {
        let g = graph();
        let b = g.ingest(note("B").with_body("mentions [[C]]")).unwrap();
        let a = g.ingest(note("A").with_body("mentions [[B]]")).unwrap();

        let depth_one = g.related(&a, 1).unwrap();
        assert!(depth_one.iter().any(|r| r.node.id == b));
        assert!(depth_one.iter().all(|r| r.depth == 1));

        let depth_two = g.related(&a, 2).unwrap();
        let c = g.find_by_title("C").unwrap().unwrap().id;
        assert!(depth_two.iter().any(|r| r.node.id == c && r.depth == 2));
    }

    #[test]
    fn related_unknown_node_is_empty() {
        let g = graph();
        assert!(g.related(&NodeId::new(), 2).unwrap().is_empty());
    }

    #[test]
    fn stats_count_nodes_edges_and_tags() {
        let g = graph();
        g.ingest(note("A").with_tags(["ai/ml"])).unwrap();
        g.ingest(note("B").with_tags(["ai/ml", "rust"])).unwrap();

        let stats = g.stats().unwrap();
        // 2 content + 3 tag nodes (ai, ai/ml, rust) + 1 daily anchor.
        assert_eq!(stats.nodes, 6);
        assert!(stats.edges > 0);
        assert_eq!(stats.tags[0], ("ai/ml".to_string(), 2));
    }

    // ── Durability ─────────────────────────────────────────────────────

    #[test]
    fn graph_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("reopen.notegraph");
        let path_str = path.to_str().unwrap();

        let id = {
            let g = KnowledgeGraph::open(path_str).unwrap();
            g.ingest(note("Persistent").with_body("see [[Other]]").with_tags(["a/b"]))
                .unwrap()
        };

        let g = KnowledgeGraph::open(path_str).unwrap();
        let node = g.node(&id).unwrap();
        assert_eq!(node.title, "Persistent");

        let other = g.find_by_title("Other").unwrap().unwrap();
        assert_eq!(g.backlinks(&other.id).unwrap().len(), 1);
        assert_eq!(g.by_tag("a").unwrap().len(), 1);
    }
}
