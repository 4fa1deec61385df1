//! Settings accepted by the core crate. The core never parses TOML or env
//! vars itself — callers (the `cli` crate, or any other embedder) build a
//! `Settings` value from whatever source they like and hand it over fully
//! merged, then thread it down into the indexer and watcher.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub embedding_dimension: usize,
    pub indexing: IndexingSettings,
    pub watch: WatchSettings,
    pub search: SearchSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexingSettings {
    pub max_concurrent_tasks: usize,
    pub batch_size: usize,
    pub idle_flush_ms: u64,
    pub exclude_globs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchSettings {
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub limit: usize,
    pub semantic_weight: f32,
    pub rrf_k: u32,
    pub rrf_alpha: f32,
    pub over_fetch: usize,
    pub rare_term_threshold: u64,
    pub source_boost: f32,
    pub public_boost: f32,
}

/// Directories skipped by the walker regardless of user-supplied excludes.
pub const DEFAULT_EXCLUDE_DIRS: &[&str] = &[
    ".git",
    ".build",
    "DerivedData",
    "node_modules",
    "target",
    ".svn",
    ".hg",
];

impl Default for Settings {
    fn default() -> Self {
        Settings {
            embedding_dimension: 384,
            indexing: IndexingSettings {
                max_concurrent_tasks: num_cpus(),
                batch_size: 32,
                idle_flush_ms: 50,
                exclude_globs: DEFAULT_EXCLUDE_DIRS
                    .iter()
                    .map(|d| format!("**/{d}/**"))
                    .collect(),
            },
            watch: WatchSettings { debounce_ms: 500 },
            search: SearchSettings {
                limit: 20,
                semantic_weight: 0.7,
                rrf_k: 60,
                rrf_alpha: 0.7,
                over_fetch: 3,
                rare_term_threshold: 10,
                source_boost: 1.1,
                public_boost: 1.1,
            },
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// On-disk layout rooted at a single index directory.
#[derive(Debug, Clone)]
pub struct IndexPaths {
    pub root: PathBuf,
}

impl IndexPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        IndexPaths { root: root.into() }
    }

    pub fn chunks_db(&self) -> PathBuf {
        self.root.join("chunks.db")
    }

    pub fn vectors_bin(&self) -> PathBuf {
        self.root.join("vectors.bin")
    }

    pub fn vectors_map(&self) -> PathBuf {
        self.root.join("vectors.map")
    }

    pub fn manifest_json(&self) -> PathBuf {
        self.root.join("manifest.json")
    }

    pub fn lockfile(&self) -> PathBuf {
        self.root.join(".lock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.embedding_dimension, 384);
        assert_eq!(s.indexing.batch_size, 32);
        assert_eq!(s.indexing.idle_flush_ms, 50);
        assert_eq!(s.watch.debounce_ms, 500);
        assert_eq!(s.search.limit, 20);
        assert_eq!(s.search.semantic_weight, 0.7);
        assert_eq!(s.search.rrf_k, 60);
        assert_eq!(s.search.rrf_alpha, 0.7);
        assert_eq!(s.search.rare_term_threshold, 10);
        assert_eq!(s.search.source_boost, 1.1);
        assert_eq!(s.search.public_boost, 1.1);
    }

    #[test]
    fn paths_are_rooted_at_index_dir() {
        let paths = IndexPaths::new("/tmp/myindex");
        assert_eq!(paths.chunks_db(), PathBuf::from("/tmp/myindex/chunks.db"));
        assert_eq!(paths.lockfile(), PathBuf::from("/tmp/myindex/.lock"));
    }
}
