//! Orchestrator. `Index` is the single entry point callers (the `cli`
//! crate, or any embedder) use: it owns the lexical store, the vector
//! store, the embedding batcher, and the glob matcher, and wires them
//! through the indexer, watcher, retrievers, and fusion stage. One
//! `Index` owns exactly one index directory rather than a registry of
//! repos.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, IndexConfigSnapshot, InfoSnippet, CURRENT_SCHEMA_VERSION};
use crate::config::{IndexPaths, Settings};
use crate::conventions::{self, ConventionReport};
use crate::embed::{Batcher, Embedder};
use crate::error::{CoreError, CoreResult};
use crate::fusion::{self, FusedEntry, MatchKind, RankedHit};
use crate::glob::GlobMatcher;
use crate::indexer::{CancellationToken, IndexReport, Indexer, ScanOptions};
use crate::retrieval::keyword::{self, RetrieverFilter};
use crate::retrieval::vector as vector_retrieval;
use crate::store::lexical::{prepare_query, LexicalStore};
use crate::store::vector::VectorStore;
use crate::watch::FileWatcher;

/// Forwards to the boxed embedder, so `Index` can hold one `Arc<dyn
/// Embedder>` and hand clones of it to both the batcher (which needs an
/// owned `impl Embedder`) and the vector retriever (which calls it
/// directly, bypassing the batcher).
impl Embedder for Arc<dyn Embedder> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }
    fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
        (**self).embed(texts)
    }
    fn is_available(&self) -> bool {
        (**self).is_available()
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    pub force: bool,
    pub exclude_globs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatHint {
    #[default]
    Verbose,
    Brief,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub semantic_weight: Option<f32>,
    pub path_filter: Option<String>,
    pub extensions: Option<Vec<String>>,
    pub min_similarity: Option<f32>,
    pub format_hint: Option<FormatHint>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub score: f32,
    pub bm25_score: Option<f32>,
    pub semantic_score: Option<f32>,
    pub bm25_rank: Option<u32>,
    pub semantic_rank: Option<u32>,
    pub match_kind: MatchKind,
}

#[derive(Debug, Clone)]
pub struct SnippetResult {
    pub snippet: InfoSnippet,
    pub score: f32,
}

/// Cross-file import edges: which chunk-paths import which, and the
/// reverse, built by walking each chunk's `imports` list against the
/// set of paths actually indexed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportEdges {
    pub imports: BTreeMap<String, Vec<String>>,
    pub imported_by: BTreeMap<String, Vec<String>>,
}

fn manifest_path(paths: &IndexPaths) -> PathBuf {
    paths.manifest_json()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Manifest {
    schema_version: u32,
    embedding_dimension: usize,
    embedder_tag: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

/// Process-wide registry so re-opening the same directory within one
/// process returns the same actors instead of standing up a second set.
fn registry() -> &'static Mutex<HashMap<PathBuf, Index>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Index>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The orchestrator handle. Cheap to clone — every field is either an
/// actor handle, an `Arc`, or plain config data — so callers can hand
/// copies to a watcher callback or a background task freely.
#[derive(Clone)]
pub struct Index {
    lexical: LexicalStore,
    vector: VectorStore,
    batcher: Arc<Batcher>,
    embedder: Arc<dyn Embedder>,
    settings: Settings,
    glob: GlobMatcher,
    paths: IndexPaths,
}

impl Index {
    /// Opens `index_dir`, creating it (and writing its manifest) if this
    /// is the first time it has been seen. Enforces the schema-version and
    /// embedding-dimension invariants fixed at creation time, returning
    /// `SchemaMismatch`/`DimensionMismatch` on a stale or incompatible
    /// on-disk index.
    pub fn open_or_create(
        index_dir: impl AsRef<Path>,
        embedder: Arc<dyn Embedder>,
        settings: Settings,
    ) -> CoreResult<Index> {
        let root = index_dir.as_ref();
        std::fs::create_dir_all(root)?;
        let canonical = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

        // Held across the whole open-or-construct below so two threads
        // racing to open the same directory can't both pass the "not
        // found" check and each stand up their own store actors against
        // it; the second caller blocks here and gets the first's clone.
        let mut reg = registry().lock().unwrap();
        if let Some(existing) = reg.get(&canonical) {
            return Ok(existing.clone());
        }

        let paths = IndexPaths::new(canonical.clone());
        // Advisory marker; this crate has no flock-style dependency, so two
        // separate processes racing to create the same directory are not
        // rejected here. Documented as a known gap in DESIGN.md.
        if !paths.lockfile().exists() {
            std::fs::write(paths.lockfile(), std::process::id().to_string())?;
        }

        // Validate the manifest before standing up the store actor threads,
        // so a schema/dimension mismatch fails fast without leaking threads.
        let manifest_path = manifest_path(&paths);
        let dimension = embedder.dimension();
        let fresh_manifest = if manifest_path.exists() {
            let bytes = std::fs::read(&manifest_path)?;
            let manifest: Manifest =
                serde_json::from_slice(&bytes).map_err(|_| CoreError::ChecksumError { path: manifest_path.clone() })?;
            if manifest.schema_version > CURRENT_SCHEMA_VERSION {
                return Err(CoreError::SchemaMismatch {
                    stored: manifest.schema_version,
                    supported: CURRENT_SCHEMA_VERSION,
                });
            }
            if manifest.embedding_dimension != dimension {
                return Err(CoreError::DimensionMismatch {
                    expected: manifest.embedding_dimension,
                    got: dimension,
                });
            }
            None
        } else {
            Some(Manifest {
                schema_version: CURRENT_SCHEMA_VERSION,
                embedding_dimension: dimension,
                embedder_tag: embedder.name().to_string(),
                created_at: chrono::Utc::now(),
            })
        };

        let lexical = LexicalStore::open(canonical.join("lexical"))?;
        let vector = VectorStore::open(canonical.join("vectors"))?;

        if let Some(manifest) = fresh_manifest {
            let bytes = serde_json::to_vec_pretty(&manifest).map_err(|e| CoreError::StoreIoError(e.to_string()))?;
            std::fs::write(&manifest_path, bytes)?;
            lexical.set_config(IndexConfigSnapshot {
                embedding_dimension: dimension,
                embedder_tag: embedder.name().to_string(),
                schema_version: CURRENT_SCHEMA_VERSION,
                tokenizer_tag: "default".to_string(),
            })?;
        }

        let batcher = Arc::new(Batcher::new(
            embedder.clone(),
            settings.indexing.batch_size,
            Duration::from_millis(settings.indexing.idle_flush_ms),
        ));

        let index = Index {
            lexical,
            vector,
            batcher,
            embedder,
            settings,
            glob: GlobMatcher::new(),
            paths,
        };

        reg.insert(canonical, index.clone());
        Ok(index)
    }

    /// Runs one indexing pass over `root`.
    pub fn index(&self, root: impl AsRef<Path>, opts: IndexOptions, cancel: &CancellationToken) -> IndexReport {
        let indexer = Indexer::new(&self.lexical, &self.vector, &self.batcher, &self.settings);
        let scan_opts = ScanOptions {
            force: opts.force,
            exclude_globs: &opts.exclude_globs,
        };
        indexer.run(root.as_ref(), scan_opts, cancel)
    }

    /// Hybrid keyword + semantic search with fusion and re-ranking.
    /// Empty queries and FTS-metacharacter-only queries return `[]` rather
    /// than erroring once prepared; a literally empty string is rejected
    /// eagerly as `InvalidArgument`.
    pub fn search(&self, query: &str, opts: SearchOptions) -> CoreResult<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(CoreError::InvalidArgument("query must not be empty".to_string()));
        }

        let limit = opts.limit.unwrap_or(self.settings.search.limit).max(1);
        let semantic_weight = opts.semantic_weight.unwrap_or(self.settings.search.semantic_weight);
        let w_bm25 = 1.0 - semantic_weight;
        let over_fetch = self.settings.search.over_fetch;

        let filter = RetrieverFilter {
            path_filter: opts.path_filter.as_deref(),
            extensions: opts.extensions.as_deref(),
        };

        let bm25_hits = keyword::search(&self.lexical, &self.glob, query, limit, over_fetch, filter.clone());
        let mut sem_hits = vector_retrieval::search(
            self.embedder.as_ref(),
            &self.vector,
            &self.lexical,
            &self.glob,
            query,
            limit,
            over_fetch,
            filter,
        )
        .unwrap_or_default();
        if let Some(min_similarity) = opts.min_similarity {
            sem_hits.retain(|(_, score)| *score >= min_similarity);
        }

        let mut chunks: HashMap<String, Chunk> = HashMap::new();
        let bm25_ranked: Vec<RankedHit> = bm25_hits
            .iter()
            .map(|(chunk, score)| {
                chunks.entry(chunk.id.clone()).or_insert_with(|| chunk.clone());
                RankedHit {
                    id: chunk.id.clone(),
                    score: *score,
                }
            })
            .collect();
        let sem_ranked: Vec<RankedHit> = sem_hits
            .iter()
            .map(|(chunk, score)| {
                chunks.entry(chunk.id.clone()).or_insert_with(|| chunk.clone());
                RankedHit {
                    id: chunk.id.clone(),
                    score: *score,
                }
            })
            .collect();

        let fused = fusion::fuse(
            &bm25_ranked,
            &sem_ranked,
            w_bm25,
            semantic_weight,
            self.settings.search.rrf_k,
            self.settings.search.rrf_alpha,
        );
        let intent = fusion::detect_intent(query);
        let lexical = &self.lexical;
        let term_doc_freq = |term: &str| lexical.count_term(term).unwrap_or(0);
        let reranked: Vec<FusedEntry> = fusion::rerank(fused, &chunks, &intent, term_doc_freq, &self.settings.search);

        let format_hint = opts.format_hint.unwrap_or_default();
        let results = reranked
            .into_iter()
            .take(limit)
            .filter_map(|entry| {
                let chunk = chunks.get(&entry.id)?.clone();
                Some(SearchResult {
                    score: entry.score,
                    bm25_score: entry.bm25_score,
                    semantic_score: entry.semantic_score,
                    bm25_rank: entry.bm25_rank,
                    semantic_rank: entry.semantic_rank,
                    match_kind: entry.match_kind(),
                    chunk: apply_format_hint(chunk, format_hint),
                })
            })
            .collect();
        Ok(results)
    }

    /// Keyword search over standalone documentation fragments, independent
    /// of the code-chunk fusion path — snippets have no embeddings of
    /// their own.
    pub fn search_docs(&self, query: &str, opts: SearchOptions) -> CoreResult<Vec<SnippetResult>> {
        if query.trim().is_empty() {
            return Err(CoreError::InvalidArgument("query must not be empty".to_string()));
        }
        let limit = opts.limit.unwrap_or(self.settings.search.limit).max(1);
        let prepared = prepare_query(query);
        if prepared.is_empty() {
            return Ok(Vec::new());
        }
        let fetch_n = limit.saturating_mul(self.settings.search.over_fetch.max(1));
        let hits = self.lexical.search_snippets(&prepared, fetch_n)?;

        let mut out: Vec<SnippetResult> = hits
            .into_iter()
            .filter(|(snippet, _)| {
                opts.path_filter
                    .as_deref()
                    .map(|pattern| self.glob.matches(pattern, &snippet.path))
                    .unwrap_or(true)
            })
            .map(|(snippet, score)| SnippetResult { snippet, score })
            .collect();
        out.truncate(limit);
        Ok(out)
    }

    /// Starts a watcher that incrementally reindexes `root` as files
    /// change. The returned handle owns the `notify` watcher and its
    /// debounce thread; dropping or calling `.stop()` on it ends watching
    /// without affecting this `Index`.
    pub fn watch(
        &self,
        root: impl AsRef<Path>,
        on_reindex: impl Fn(&IndexReport) + Send + 'static,
    ) -> CoreResult<FileWatcher> {
        FileWatcher::start(
            root,
            self.lexical.clone(),
            self.vector.clone(),
            self.batcher.clone(),
            self.settings.clone(),
            on_reindex,
        )
    }

    /// Mines coding conventions from every chunk currently indexed — a
    /// read-side report over data the index already owns, no extra state.
    pub fn conventions(&self) -> CoreResult<ConventionReport> {
        let chunks = self.lexical.all_chunks()?;
        Ok(conventions::mine_conventions(&chunks))
    }

    /// Builds a cross-file import graph from indexed chunks' `imports`
    /// lists, resolving each import string to another indexed path by
    /// filename stem.
    pub fn import_graph(&self) -> CoreResult<ImportEdges> {
        let chunks = self.lexical.all_chunks()?;

        let mut raw_imports_by_path: HashMap<String, HashSet<String>> = HashMap::new();
        for chunk in &chunks {
            raw_imports_by_path
                .entry(chunk.path.clone())
                .or_default()
                .extend(chunk.imports.iter().cloned());
        }
        let all_paths: Vec<String> = raw_imports_by_path.keys().cloned().collect();

        let mut imports: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut imported_by: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (path, raw_imports) in &raw_imports_by_path {
            let mut resolved: Vec<String> = Vec::new();
            for raw in raw_imports {
                if let Some(target) = resolve_import(raw, &all_paths, path) {
                    resolved.push(target.clone());
                    imported_by.entry(target).or_default().push(path.clone());
                }
            }
            resolved.sort();
            resolved.dedup();
            if !resolved.is_empty() {
                imports.insert(path.clone(), resolved);
            }
        }
        for targets in imported_by.values_mut() {
            targets.sort();
            targets.dedup();
        }

        Ok(ImportEdges { imports, imported_by })
    }

    /// Flushes the embedder batcher, checkpoints both stores, and drops
    /// this instance from the process registry — releases the lockfile,
    /// store actor threads, and vector index file handle deterministically.
    pub fn close(self) {
        self.batcher.flush();
        self.batcher.shutdown();
        let canonical = self.paths.root.clone();
        registry().lock().unwrap().remove(&canonical);
        self.lexical.close();
        self.vector.close();
    }
}

fn apply_format_hint(mut chunk: Chunk, hint: FormatHint) -> Chunk {
    if hint != FormatHint::Brief {
        return chunk;
    }
    let brief = chunk
        .signature
        .clone()
        .unwrap_or_else(|| chunk.content.lines().next().unwrap_or("").to_string());
    chunk.content = brief;
    chunk
}

/// Resolves an import string to another indexed path by matching
/// filename stems, skipping the importing file's own path.
fn resolve_import(import: &str, all_paths: &[String], self_path: &str) -> Option<String> {
    let needle = import
        .rsplit(['/', '.', ':'])
        .next()
        .unwrap_or(import)
        .to_string();
    if needle.is_empty() {
        return None;
    }
    all_paths
        .iter()
        .find(|candidate| {
            candidate.as_str() != self_path
                && Path::new(candidate)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(|stem| stem == needle)
                    .unwrap_or(false)
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkKind;
    use crate::embed::NullEmbedder;

    struct ConstEmbedder {
        dim: usize,
    }
    impl Embedder for ConstEmbedder {
        fn dimension(&self) -> usize {
            self.dim
        }
        fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.25; self.dim]).collect())
        }
        fn is_available(&self) -> bool {
            true
        }
        fn name(&self) -> &str {
            "const"
        }
    }

    fn open_test_index(dir: &Path) -> Index {
        let embedder: Arc<dyn Embedder> = Arc::new(ConstEmbedder { dim: 4 });
        Index::open_or_create(dir, embedder, Settings::default()).unwrap()
    }

    #[test]
    fn reopening_the_same_directory_returns_the_same_instance() {
        let dir = tempfile::tempdir().unwrap();
        let a = open_test_index(dir.path());
        let embedder: Arc<dyn Embedder> = Arc::new(ConstEmbedder { dim: 4 });
        let b = Index::open_or_create(dir.path(), embedder, Settings::default()).unwrap();
        a.lexical
            .insert_chunks(vec![Chunk::new("a.swift", 1, 2, ChunkKind::Function, "func add() {}", "swift")])
            .unwrap();
        // `b` shares the same underlying actor, so it should see the insert.
        assert_eq!(b.lexical.get_file_hash("a.swift"), None); // file record untouched, but store is shared
        let all = b.lexical.all_chunks().unwrap();
        assert_eq!(all.len(), 1);
        a.close();
    }

    #[test]
    fn dimension_mismatch_on_reopen_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let first: Arc<dyn Embedder> = Arc::new(ConstEmbedder { dim: 4 });
        let idx = Index::open_or_create(dir.path(), first, Settings::default()).unwrap();
        idx.close();

        // Force a distinct directory identity in the registry by using a
        // fresh subpath (the registry already holds the canonical path
        // from the first open, but `close` removed it above).
        let second: Arc<dyn Embedder> = Arc::new(NullEmbedder { dim: 8 });
        let err = Index::open_or_create(dir.path(), second, Settings::default()).unwrap_err();
        assert_eq!(err.code(), "dimension_mismatch");
    }

    #[test]
    fn scenario_1_fresh_index_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join("a.swift"),
            "func add(_ x: Int, _ y: Int) -> Int { x + y }\n",
        )
        .unwrap();
        std::fs::write(root.path().join("b.swift"), "class C {}\n").unwrap();

        let idx = open_test_index(dir.path());
        let report = idx.index(root.path(), IndexOptions::default(), &CancellationToken::new());
        assert_eq!(report.files_processed, 2);
        assert!(report.chunks_indexed >= 2);

        let results = idx
            .search(
                "add",
                SearchOptions {
                    limit: Some(5),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(!results.is_empty());
        assert!(results.iter().any(|r| r.chunk.path.ends_with("a.swift")));
        idx.close();
    }

    #[test]
    fn scenario_2_incremental_reindex_reuses_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("a.swift"), "func add() {}\n").unwrap();
        std::fs::write(root.path().join("b.swift"), "func sub() {}\n").unwrap();

        let idx = open_test_index(dir.path());
        let first = idx.index(root.path(), IndexOptions::default(), &CancellationToken::new());
        assert_eq!(first.files_processed, 2);

        let second = idx.index(root.path(), IndexOptions::default(), &CancellationToken::new());
        assert_eq!(second.files_processed, 2);
        assert_eq!(second.chunks_reused, first.chunks_indexed);
        assert_eq!(second.embedding_calls, 0);
        idx.close();
    }

    #[test]
    fn empty_query_is_rejected_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let idx = open_test_index(dir.path());
        let err = idx.search("", SearchOptions::default()).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        idx.close();
    }

    #[test]
    fn brief_format_hint_trims_content_to_signature() {
        let mut chunk = Chunk::new("a.swift", 1, 2, ChunkKind::Function, "func add() {\n  x + y\n}", "swift");
        chunk.signature = Some("func add(_ x: Int, _ y: Int) -> Int".to_string());
        let trimmed = apply_format_hint(chunk.clone(), FormatHint::Brief);
        assert_eq!(trimmed.content, "func add(_ x: Int, _ y: Int) -> Int");
        let untouched = apply_format_hint(chunk, FormatHint::Verbose);
        assert!(untouched.content.contains("x + y"));
    }

    #[test]
    fn import_graph_resolves_by_filename_stem() {
        let dir = tempfile::tempdir().unwrap();
        let idx = open_test_index(dir.path());

        let mut a = Chunk::new("src/app.swift", 1, 3, ChunkKind::FreeCode, "import Models", "swift");
        a.imports = vec!["Models".to_string()];
        let b = Chunk::new("src/models.swift", 1, 3, ChunkKind::Class, "class Models {}", "swift");
        idx.lexical.insert_chunks(vec![a, b]).unwrap();

        let graph = idx.import_graph().unwrap();
        assert_eq!(graph.imports.get("src/app.swift").map(|v| v.as_slice()), Some(&["src/models.swift".to_string()][..]));
        assert_eq!(
            graph.imported_by.get("src/models.swift").map(|v| v.as_slice()),
            Some(&["src/app.swift".to_string()][..])
        );
        idx.close();
    }

    #[test]
    fn conventions_report_over_indexed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let idx = open_test_index(dir.path());
        let mut c = Chunk::new(
            "src/lib_test.rs",
            1,
            4,
            ChunkKind::Function,
            "#[test]\nfn it_works() -> Result<(), String> {\n    Ok(())\n}\n",
            "rust",
        );
        c.symbols = vec!["it_works".to_string()];
        idx.lexical.insert_chunks(vec![c]).unwrap();

        let report = idx.conventions().unwrap();
        assert_eq!(report.testing.style, "rust-test");
        idx.close();
    }
}
