//! Query-time lexical scoring.
//!
//! Builds an in-memory tantivy index over the candidate nodes at query time
//! and ranks them with tantivy's default BM25 similarity. Rebuilding per query
//! keeps the lexical channel self-contained: mutations never touch a
//! secondary index, and the corpus sizes this engine targets (hundreds to low
//! thousands of nodes) index in milliseconds.

use crate::{Node, NodeId, Result};
use std::collections::HashMap;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, FuzzyTermQuery, Occur, QueryParser};
use tantivy::schema::{Field, Schema, Value as TantivyValueTrait, STORED, STRING, TEXT};
use tantivy::{doc, Index, Term};

/// Rank `nodes` against `query`, best first. Scores are raw BM25 — the hybrid
/// layer normalises them. Returns at most `limit` hits.
///
/// Never fails on malformed query syntax: stray `[[`, unbalanced quotes and
/// the like are parsed leniently, salvaging whatever terms remain.
pub(crate) fn rank(nodes: &[Node], query: &str, limit: usize) -> Result<Vec<(NodeId, f32)>> {
    if query.trim().is_empty() || limit == 0 || nodes.is_empty() {
        return Ok(Vec::new());
    }

    let (index, id_field, content_field) = build_index(nodes)?;
    let reader = index.reader()?;
    let searcher = reader.searcher();

    let parser = QueryParser::for_index(&index, vec![content_field]);
    let (parsed, _errors) = parser.parse_query_lenient(query);
    let mut top_docs = searcher.search(&parsed, &TopDocs::with_limit(limit))?;

    // Fuzzy fallback for typo-heavy queries (e.g. "grpahs").
    if top_docs.is_empty() {
        let fuzzy = build_fuzzy_query(query, content_field);
        top_docs = searcher.search(&fuzzy, &TopDocs::with_limit(limit))?;
    }

    let ids_by_str: HashMap<&str, &NodeId> =
        nodes.iter().map(|n| (n.id.0.as_str(), &n.id)).collect();
    let mut hits = Vec::with_capacity(top_docs.len());

    for (score, addr) in top_docs {
        let retrieved = searcher.doc::<tantivy::schema::TantivyDocument>(addr)?;
        if let Some(id_val) = retrieved.get_first(id_field).and_then(|v| v.as_str()) {
            if let Some(id) = ids_by_str.get(id_val) {
                hits.push(((*id).clone(), score));
            }
        }
    }

    Ok(hits)
}

fn build_index(nodes: &[Node]) -> Result<(Index, Field, Field)> {
    let mut schema_builder = Schema::builder();
    let id_field = schema_builder.add_text_field("id", STRING | STORED);
    let content_field = schema_builder.add_text_field("content", TEXT);
    let schema = schema_builder.build();

    let index = Index::create_in_ram(schema);
    let mut writer = index.writer(50_000_000)?;

    for node in nodes {
        let mut content = node.title.clone();
        for tag in &node.tags {
            content.push(' ');
            // Allow "cs theory" style matching against slash-delimited tags.
            content.push_str(&tag.replace('/', " "));
        }
        if let Some(body) = &node.body {
            content.push(' ');
            content.push_str(body);
        }

        writer.add_document(doc!(
            id_field => node.id.0.clone(),
            content_field => content,
        ))?;
    }

    writer.commit()?;
    Ok((index, id_field, content_field))
}

fn build_fuzzy_query(query: &str, content_field: Field) -> BooleanQuery {
    let terms: Vec<(Occur, Box<dyn tantivy::query::Query>)> = query
        .split_whitespace()
        .filter(|token| !token.is_empty())
        .map(|token| {
            // Indexed terms are lowercased by the default tokenizer; match in
            // the same case-space so the edit budget goes to real typos.
            let term = Term::from_field_text(content_field, &token.to_lowercase());
            (
                Occur::Should,
                Box::new(FuzzyTermQuery::new(term, 1, true)) as Box<dyn tantivy::query::Query>,
            )
        })
        .collect();
    BooleanQuery::new(terms)
}
