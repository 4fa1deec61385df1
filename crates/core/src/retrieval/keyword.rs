//! Keyword retriever: prepares a query, over-fetches from the lexical
//! store, and applies path/extension filters.

use crate::chunk::Chunk;
use crate::glob::GlobMatcher;
use crate::store::lexical::{prepare_query, LexicalStore};

#[derive(Debug, Clone, Default)]
pub struct RetrieverFilter<'a> {
    pub path_filter: Option<&'a str>,
    pub extensions: Option<&'a [String]>,
}

/// `[(Chunk, bm25_score_positive)]`, higher is better (see the lexical
/// store's `search_fts` doc comment for why no sign flip is applied here).
pub fn search(
    store: &LexicalStore,
    glob: &GlobMatcher,
    query: &str,
    limit: usize,
    over_fetch: usize,
    filter: RetrieverFilter,
) -> Vec<(Chunk, f32)> {
    let prepared = prepare_query(query);
    if prepared.is_empty() {
        return Vec::new();
    }

    let fetch_n = limit.saturating_mul(over_fetch.max(1));
    let hits = match store.search_fts(&prepared, fetch_n) {
        Ok(h) => h,
        Err(_) => return Vec::new(),
    };

    let mut out = Vec::with_capacity(hits.len());
    for (chunk, score) in hits {
        if let Some(pattern) = filter.path_filter {
            if !glob.matches(pattern, &chunk.path) {
                continue;
            }
        }
        if let Some(exts) = filter.extensions {
            if !exts.iter().any(|e| chunk.path.ends_with(e.as_str())) {
                continue;
            }
        }
        out.push((chunk, score));
        if out.len() >= limit {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkKind;

    #[test]
    fn empty_query_returns_no_results_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LexicalStore::open(dir.path()).unwrap();
        let glob = GlobMatcher::new();
        let results = search(&store, &glob, "", 5, 3, RetrieverFilter::default());
        assert!(results.is_empty());
    }

    #[test]
    fn path_filter_excludes_non_matching_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = LexicalStore::open(dir.path()).unwrap();
        let glob = GlobMatcher::new();
        let mut c1 = Chunk::new("src/a.swift", 1, 2, ChunkKind::Function, "func add() {}", "swift");
        c1.symbols = vec!["add".into()];
        let mut c2 = Chunk::new("tests/a.swift", 1, 2, ChunkKind::Function, "func add() {}", "swift");
        c2.symbols = vec!["add".into()];
        store.insert_chunks(vec![c1, c2]).unwrap();

        let results = search(
            &store,
            &glob,
            "add",
            5,
            3,
            RetrieverFilter {
                path_filter: Some("src/**"),
                extensions: None,
            },
        );
        assert!(results.iter().all(|(c, _)| c.path.starts_with("src/")));
    }
}
