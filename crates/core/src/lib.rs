//! codegrove-core: chunking, indexing, and hybrid lexical/vector search
//! over a codebase. Embedders and on-disk layout are pluggable; callers
//! (the `cli` crate, or any other embedder) build a `Settings` and an
//! `Embedder` and hand them to [`index::Index`].

pub mod chunk;
pub mod config;
pub mod conventions;
pub mod embed;
pub mod error;
pub mod fusion;
pub mod glob;
pub mod index;
pub mod indexer;
pub mod parser;
pub mod retrieval;
pub mod store;
pub mod watch;

pub use chunk::{Chunk, ChunkKind, FileRecord, InfoSnippet, SnippetKind};
pub use config::{IndexPaths, Settings};
pub use embed::{default_embedder, Embedder};
pub use error::{CoreError, CoreResult};
pub use index::{Index, IndexOptions, SearchOptions, SearchResult};
pub use indexer::IndexReport;
