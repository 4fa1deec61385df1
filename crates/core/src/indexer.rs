//! Indexer: one pass over a root path. Walks the tree with `ignore` +
//! `rayon`, diffs content hashes against the `files` table, reuses
//! unchanged chunks' vectors, and funnels writes through the store
//! actors so they serialize there.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ignore::WalkBuilder;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::chunk::{Chunk, FileRecord};
use crate::config::Settings;
use crate::embed::Batcher;
use crate::error::CoreResult;
use crate::parser::{self, ParseResult};
use crate::store::lexical::LexicalStore;
use crate::store::vector::VectorStore;

#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub files_processed: u64,
    pub chunks_indexed: u64,
    pub chunks_reused: u64,
    pub embedding_calls: u64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScanOptions<'a> {
    pub force: bool,
    pub exclude_globs: &'a [String],
}

impl Default for ScanOptions<'_> {
    fn default() -> Self {
        ScanOptions {
            force: false,
            exclude_globs: &[],
        }
    }
}

/// Cooperative cancellation token: checked at parse boundaries and before
/// embedding submission.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct Indexer<'a> {
    pub lexical: &'a LexicalStore,
    pub vector: &'a VectorStore,
    pub batcher: &'a Batcher,
    pub settings: &'a Settings,
}

impl<'a> Indexer<'a> {
    pub fn new(
        lexical: &'a LexicalStore,
        vector: &'a VectorStore,
        batcher: &'a Batcher,
        settings: &'a Settings,
    ) -> Self {
        Indexer {
            lexical,
            vector,
            batcher,
            settings,
        }
    }

    pub fn run(&self, root: &Path, opts: ScanOptions, cancel: &CancellationToken) -> IndexReport {
        let files = self.walk(root, opts.exclude_globs);
        let files_processed = AtomicU64::new(0);
        let chunks_indexed = AtomicU64::new(0);
        let chunks_reused = AtomicU64::new(0);
        let embedding_calls = AtomicU64::new(0);
        let errors: std::sync::Mutex<Vec<String>> = std::sync::Mutex::new(Vec::new());

        // Parsing runs in parallel (rayon); writes funnel through the
        // store actors, which serialize there. Bound the parallelism with
        // rayon's own thread pool sizing driven by `max_concurrent_tasks`.
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.indexing.max_concurrent_tasks.max(1))
            .build()
            .ok();

        let work = |entry: &(PathBuf, String)| {
            let (abs_path, rel_path) = entry;
            if cancel.is_cancelled() {
                return;
            }
            match self.process_file(abs_path, rel_path, opts.force) {
                Ok(stats) => {
                    files_processed.fetch_add(1, Ordering::Relaxed);
                    chunks_indexed.fetch_add(stats.chunks_indexed, Ordering::Relaxed);
                    chunks_reused.fetch_add(stats.chunks_reused, Ordering::Relaxed);
                    embedding_calls.fetch_add(stats.embedding_calls, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(path = %rel_path, error = %e, "failed to index file");
                    errors.lock().unwrap().push(format!("{rel_path}: {e}"));
                }
            }
        };

        if let Some(pool) = pool {
            pool.install(|| files.par_iter().for_each(work));
        } else {
            files.par_iter().for_each(work);
        }

        self.batcher.flush();
        if let Err(e) = self.vector.build_index() {
            errors.lock().unwrap().push(format!("vector index build: {e}"));
        }

        IndexReport {
            files_processed: files_processed.load(Ordering::Relaxed),
            chunks_indexed: chunks_indexed.load(Ordering::Relaxed),
            chunks_reused: chunks_reused.load(Ordering::Relaxed),
            embedding_calls: embedding_calls.load(Ordering::Relaxed),
            errors: errors.into_inner().unwrap(),
        }
    }

    /// Re-processes a small, explicit set of paths — the unit of work the
    /// watcher hands off after debouncing. Unlike `run`, a missing path is
    /// treated as a deletion rather than skipped.
    pub fn reindex_paths(&self, root: &Path, paths: &[PathBuf]) -> IndexReport {
        let mut report = IndexReport::default();
        for abs_path in paths {
            let rel_path = abs_path
                .strip_prefix(root)
                .unwrap_or(abs_path)
                .to_string_lossy()
                .to_string();

            if !abs_path.exists() {
                if let Err(e) = self.remove_path(&rel_path) {
                    report.errors.push(format!("{rel_path}: {e}"));
                } else {
                    report.files_processed += 1;
                }
                continue;
            }

            match self.process_file(abs_path, &rel_path, true) {
                Ok(stats) => {
                    report.files_processed += 1;
                    report.chunks_indexed += stats.chunks_indexed;
                    report.chunks_reused += stats.chunks_reused;
                    report.embedding_calls += stats.embedding_calls;
                }
                Err(e) => report.errors.push(format!("{rel_path}: {e}")),
            }
        }
        self.batcher.flush();
        if let Err(e) = self.vector.build_index() {
            report.errors.push(format!("vector index build: {e}"));
        }
        report
    }

    fn remove_path(&self, rel_path: &str) -> CoreResult<()> {
        let existing = self.lexical.get_chunks_by_path(rel_path)?;
        let ids: Vec<String> = existing.iter().map(|c| c.id.clone()).collect();
        self.lexical.delete_chunks_for_path(rel_path)?;
        self.vector.remove_many(ids)?;
        self.lexical.remove_file_record(rel_path)?;
        Ok(())
    }

    fn walk(&self, root: &Path, extra_excludes: &[String]) -> Vec<(PathBuf, String)> {
        let glob = crate::glob::GlobMatcher::new();
        let mut files = Vec::new();
        let mut builder = WalkBuilder::new(root);
        builder.hidden(false).git_ignore(true);

        for entry in builder.build() {
            let Ok(entry) = entry else { continue };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.path().to_path_buf();
            let rel = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().to_string();

            if self
                .settings
                .indexing
                .exclude_globs
                .iter()
                .chain(extra_excludes.iter())
                .any(|pat| glob.matches(pat, &rel))
            {
                continue;
            }
            files.push((path, rel));
        }
        files
    }

    fn process_file(&self, path: &Path, rel_path: &str, force: bool) -> CoreResult<FileStats> {
        let bytes = std::fs::read(path)?;
        let content_hash = sha256_hex(&bytes);

        if !force {
            if let Some(existing_hash) = self.lexical.get_file_hash(rel_path) {
                if existing_hash == content_hash {
                    debug!(path = %rel_path, "unchanged, skipping");
                    return Ok(FileStats {
                        chunks_indexed: 0,
                        chunks_reused: 0,
                        embedding_calls: 0,
                    });
                }
            }
        }

        let parsed = parser::parse(Path::new(rel_path), &bytes);
        let new_chunks: Vec<Chunk> = match &parsed {
            ParseResult::Chunks(c) => c.clone(),
            ParseResult::ChunksAndSnippets(c, _) => c.clone(),
            ParseResult::Skipped(reason) => {
                debug!(path = %rel_path, reason, "parser skipped file");
                Vec::new()
            }
        };
        let new_snippets: Vec<crate::chunk::InfoSnippet> = match &parsed {
            ParseResult::ChunksAndSnippets(_, s) => s.clone(),
            _ => Vec::new(),
        };

        // Every chunk this path currently owns, before it is replaced. Used
        // two ways below: as the reuse index (by content_hash, so an
        // unchanged chunk keeps its vector) and as the full removal set for
        // the vector store — a chunk whose content changed or disappeared
        // still needs its old vector deleted, not just chunks that happen
        // to match a new hash.
        let old_chunks = self.lexical.get_chunks_by_path(rel_path).unwrap_or_default();
        let old_by_hash: HashMap<String, Chunk> = old_chunks
            .iter()
            .map(|c| (c.content_hash.clone(), c.clone()))
            .collect();
        let old_ids: Vec<String> = old_chunks.iter().map(|c| c.id.clone()).collect();
        let old_vectors = self.vector.get_batch(&old_ids).unwrap_or_default();

        let mut reusable = Vec::new();
        let mut to_embed = Vec::new();
        for chunk in &new_chunks {
            let has_old = old_by_hash
                .get(&chunk.content_hash)
                .map(|old| old.id == chunk.id && old_vectors.contains_key(&old.id))
                .unwrap_or(false);
            if has_old {
                reusable.push(chunk.clone());
            } else {
                to_embed.push(chunk.clone());
            }
        }

        let mut embedding_calls = 0u64;
        let mut fresh_vectors: Vec<(String, Vec<f32>)> = Vec::new();
        if !to_embed.is_empty() {
            let texts: Vec<String> = to_embed.iter().map(|c| c.content.clone()).collect();
            let vectors = self.batcher.embed(texts)?;
            embedding_calls += 1;
            for (chunk, vector) in to_embed.iter().zip(vectors) {
                fresh_vectors.push((chunk.id.clone(), vector));
            }
        }

        // Delete-then-insert so readers never observe a mix of old and
        // new chunks for this path.
        self.lexical.delete_chunks_for_path(rel_path)?;
        self.vector.remove_many(old_ids)?;

        self.lexical.insert_chunks(new_chunks.clone())?;
        if !new_snippets.is_empty() {
            self.lexical.insert_snippets(new_snippets)?;
        }
        for chunk in &reusable {
            if let Some(vector) = old_vectors.get(&chunk.id) {
                self.vector.add(chunk.id.clone(), vector.clone())?;
            }
        }
        if !fresh_vectors.is_empty() {
            self.vector.add_batch(fresh_vectors)?;
        }

        self.lexical.set_file_record(FileRecord {
            path: rel_path.to_string(),
            content_hash,
            indexed_at: chrono::Utc::now(),
            chunk_count: new_chunks.len() as u32,
        })?;

        Ok(FileStats {
            chunks_indexed: new_chunks.len() as u64,
            chunks_reused: reusable.len() as u64,
            embedding_calls,
        })
    }

}

struct FileStats {
    chunks_indexed: u64,
    chunks_reused: u64,
    embedding_calls: u64,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::{Embedder, NullEmbedder};
    use std::time::Duration;

    struct ConstEmbedder;
    impl Embedder for ConstEmbedder {
        fn dimension(&self) -> usize {
            4
        }
        fn embed(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3, 0.4]).collect())
        }
        fn is_available(&self) -> bool {
            true
        }
        fn name(&self) -> &str {
            "const"
        }
    }

    #[test]
    fn fresh_index_of_two_file_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(
            dir.path().join("src/a.swift"),
            "func add(_ x: Int, _ y: Int) -> Int { x + y }\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("src/b.swift"), "class C {}\n").unwrap();

        let lexical = LexicalStore::open(dir.path().join("idx-lexical")).unwrap();
        let vector = VectorStore::open(dir.path().join("idx-vector")).unwrap();
        let batcher = Batcher::new(ConstEmbedder, 32, Duration::from_millis(50));
        let settings = Settings::default();
        let indexer = Indexer::new(&lexical, &vector, &batcher, &settings);

        let report = indexer.run(dir.path(), ScanOptions::default(), &CancellationToken::new());
        assert_eq!(report.files_processed, 2);
        assert!(report.chunks_indexed >= 2);
    }

    #[test]
    fn incremental_reindex_reuses_unchanged_chunks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.swift"), "func add() {}\n").unwrap();

        let lexical = LexicalStore::open(dir.path().join("idx-lexical")).unwrap();
        let vector = VectorStore::open(dir.path().join("idx-vector")).unwrap();
        let batcher = Batcher::new(ConstEmbedder, 32, Duration::from_millis(50));
        let settings = Settings::default();
        let indexer = Indexer::new(&lexical, &vector, &batcher, &settings);

        let first = indexer.run(dir.path(), ScanOptions::default(), &CancellationToken::new());
        assert_eq!(first.files_processed, 1);

        let second = indexer.run(dir.path(), ScanOptions::default(), &CancellationToken::new());
        assert_eq!(second.files_processed, 1);
        assert_eq!(second.embedding_calls, 0);
    }

    #[test]
    fn identical_content_at_two_paths_both_reuse_on_incremental_reindex() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.swift"), "func add() {}\n").unwrap();
        std::fs::write(dir.path().join("b.swift"), "func add() {}\n").unwrap();

        let lexical = LexicalStore::open(dir.path().join("idx-lexical")).unwrap();
        let vector = VectorStore::open(dir.path().join("idx-vector")).unwrap();
        let batcher = Batcher::new(ConstEmbedder, 32, Duration::from_millis(50));
        let settings = Settings::default();
        let indexer = Indexer::new(&lexical, &vector, &batcher, &settings);

        let first = indexer.run(dir.path(), ScanOptions::default(), &CancellationToken::new());
        assert_eq!(first.files_processed, 2);

        let second = indexer.run(dir.path(), ScanOptions::default(), &CancellationToken::new());
        assert_eq!(second.files_processed, 2);
        assert_eq!(second.embedding_calls, 0);
        assert_eq!(second.chunks_reused, first.chunks_indexed);
    }

    #[test]
    fn removing_a_chunk_from_an_edited_file_drops_its_orphaned_vector() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.swift"),
            "func add() {}\n\nfunc sub() {}\n",
        )
        .unwrap();

        let lexical = LexicalStore::open(dir.path().join("idx-lexical")).unwrap();
        let vector = VectorStore::open(dir.path().join("idx-vector")).unwrap();
        let batcher = Batcher::new(ConstEmbedder, 32, Duration::from_millis(50));
        let settings = Settings::default();
        let indexer = Indexer::new(&lexical, &vector, &batcher, &settings);

        let first = indexer.run(dir.path(), ScanOptions::default(), &CancellationToken::new());
        assert_eq!(first.chunks_indexed, 2);
        assert_eq!(vector.stats().count, 2);

        std::fs::write(dir.path().join("a.swift"), "func add() {}\n").unwrap();
        let second = indexer.run(dir.path(), ScanOptions::default(), &CancellationToken::new());
        assert_eq!(second.files_processed, 1);
        assert_eq!(
            vector.stats().count,
            1,
            "sub()'s vector must be dropped, not left orphaned in the store"
        );
    }

    #[test]
    fn unavailable_embedder_is_collected_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.swift"), "func add() {}\n").unwrap();

        let lexical = LexicalStore::open(dir.path().join("idx-lexical")).unwrap();
        let vector = VectorStore::open(dir.path().join("idx-vector")).unwrap();
        let batcher = Batcher::new(NullEmbedder { dim: 4 }, 32, Duration::from_millis(50));
        let settings = Settings::default();
        let indexer = Indexer::new(&lexical, &vector, &batcher, &settings);

        let report = indexer.run(dir.path(), ScanOptions::default(), &CancellationToken::new());
        assert_eq!(report.files_processed, 0);
        assert!(!report.errors.is_empty());
    }
}
