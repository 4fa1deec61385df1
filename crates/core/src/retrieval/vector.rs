//! Vector retriever: embeds the query directly (a single request,
//! bypassing the batcher), searches the ANN store, and resolves ids back
//! to chunks in one round trip.

use crate::chunk::Chunk;
use crate::embed::Embedder;
use crate::error::CoreResult;
use crate::glob::GlobMatcher;
use crate::retrieval::keyword::RetrieverFilter;
use crate::store::lexical::LexicalStore;
use crate::store::vector::VectorStore;

pub fn search(
    embedder: &dyn Embedder,
    vector_store: &VectorStore,
    lexical_store: &LexicalStore,
    glob: &GlobMatcher,
    query: &str,
    k: usize,
    over_fetch: usize,
    filter: RetrieverFilter,
) -> CoreResult<Vec<(Chunk, f32)>> {
    let embedding = embedder.embed(&[query.to_string()])?;
    let query_vector = match embedding.into_iter().next() {
        Some(v) => v,
        None => return Ok(Vec::new()),
    };

    let fetch_n = k.saturating_mul(over_fetch.max(1));
    let hits = vector_store.search(&query_vector, fetch_n)?;
    let ids: Vec<String> = hits.iter().map(|(id, _)| id.clone()).collect();
    let chunks = lexical_store.get_chunks_by_ids(&ids)?;

    let mut out = Vec::with_capacity(hits.len());
    for (id, similarity) in hits {
        let Some(chunk) = chunks.get(&id) else {
            continue;
        };
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
        out.push((chunk.clone(), similarity));
        if out.len() >= k {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkKind;
    use crate::embed::NullEmbedder;

    struct FixedEmbedder {
        vector: Vec<f32>,
    }
    impl Embedder for FixedEmbedder {
        fn dimension(&self) -> usize {
            self.vector.len()
        }
        fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.vector.clone()).collect())
        }
        fn is_available(&self) -> bool {
            true
        }
        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[test]
    fn unavailable_embedder_surfaces_error_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        let vstore = VectorStore::open(dir.path().join("v")).unwrap();
        let lstore = LexicalStore::open(dir.path().join("l")).unwrap();
        let glob = GlobMatcher::new();
        let embedder = NullEmbedder { dim: 4 };
        let result = search(
            &embedder,
            &vstore,
            &lstore,
            &glob,
            "query",
            5,
            3,
            RetrieverFilter::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn resolves_hits_to_chunks_in_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let vstore = VectorStore::open(dir.path().join("v")).unwrap();
        let lstore = LexicalStore::open(dir.path().join("l")).unwrap();
        let glob = GlobMatcher::new();

        let mut chunk = Chunk::new("a.swift", 1, 2, ChunkKind::Function, "func add() {}", "swift");
        chunk.symbols = vec!["add".into()];
        vstore.add(chunk.id.clone(), vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        lstore.insert_chunks(vec![chunk.clone()]).unwrap();

        let embedder = FixedEmbedder {
            vector: vec![1.0, 0.0, 0.0, 0.0],
        };
        let results = search(&embedder, &vstore, &lstore, &glob, "add", 5, 3, RetrieverFilter::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, chunk.id);
    }
}
