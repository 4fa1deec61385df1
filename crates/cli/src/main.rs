//! codegrove CLI — index, search, and watch a codebase from the terminal.
//!
//! Calls `codegrove-core` directly with no server overhead.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use codegrove_core::index::{FormatHint, IndexOptions, SearchOptions};
use codegrove_core::indexer::CancellationToken;
use codegrove_core::{default_embedder, Index, Settings};

/// codegrove CLI — hybrid lexical/semantic codebase search from the terminal.
#[derive(Parser)]
#[command(name = "codegrove", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output as JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or refresh the index for a project
    Index {
        /// Project root (default: current directory)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Index storage directory (default: <root>/.codegrove)
        #[arg(long)]
        index_dir: Option<PathBuf>,

        /// Reindex every file even if its content hash is unchanged
        #[arg(long)]
        force: bool,

        /// Glob patterns to exclude, in addition to the built-in defaults
        #[arg(long)]
        exclude: Vec<String>,
    },
    /// Hybrid keyword + semantic search over indexed code chunks
    Search {
        /// Search query
        query: String,

        /// Project root (default: current directory)
        #[arg(long)]
        root: Option<PathBuf>,

        /// Index storage directory (default: <root>/.codegrove)
        #[arg(long)]
        index_dir: Option<PathBuf>,

        /// Maximum number of results
        #[arg(long, default_value = "20")]
        limit: usize,

        /// Weight given to the semantic signal during fusion, 0.0-1.0
        #[arg(long)]
        semantic_weight: Option<f32>,

        /// Restrict results to paths matching this glob
        #[arg(long)]
        path: Option<String>,

        /// Restrict results to these file extensions
        #[arg(long = "ext")]
        extensions: Vec<String>,

        /// Drop semantic hits below this cosine similarity
        #[arg(long)]
        min_similarity: Option<f32>,

        /// Print each chunk's signature instead of its full body
        #[arg(long)]
        brief: bool,
    },
    /// Search standalone documentation fragments instead of code chunks
    SearchDocs {
        /// Search query
        query: String,

        #[arg(long)]
        root: Option<PathBuf>,

        #[arg(long)]
        index_dir: Option<PathBuf>,

        #[arg(long, default_value = "20")]
        limit: usize,

        #[arg(long)]
        path: Option<String>,
    },
    /// Watch a project and keep its index up to date
    Watch {
        #[arg(long)]
        root: Option<PathBuf>,

        #[arg(long)]
        index_dir: Option<PathBuf>,
    },
    /// Report coding conventions mined from the indexed chunks
    Conventions {
        #[arg(long)]
        root: Option<PathBuf>,

        #[arg(long)]
        index_dir: Option<PathBuf>,
    },
    /// Print the cross-file import graph derived from the index
    Imports {
        #[arg(long)]
        root: Option<PathBuf>,

        #[arg(long)]
        index_dir: Option<PathBuf>,
    },
}

fn resolve_root(root: Option<PathBuf>) -> PathBuf {
    root.unwrap_or_else(|| std::env::current_dir().expect("Could not determine current directory"))
        .canonicalize()
        .expect("Path not found")
}

fn resolve_index_dir(index_dir: Option<PathBuf>, root: &PathBuf) -> PathBuf {
    index_dir.unwrap_or_else(|| root.join(".codegrove"))
}

fn open_index(index_dir: &PathBuf) -> Index {
    let settings = Settings::default();
    let embedder = default_embedder(settings.embedding_dimension);
    Index::open_or_create(index_dir, embedder, settings).unwrap_or_else(|e| {
        eprintln!("Failed to open index at {}: {e}", index_dir.display());
        std::process::exit(1);
    })
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("codegrove=warn".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Index { root, index_dir, force, exclude } => {
            let root = resolve_root(root);
            let index_dir = resolve_index_dir(index_dir, &root);
            let idx = open_index(&index_dir);

            let cancel = CancellationToken::new();
            let opts = IndexOptions { force, exclude_globs: exclude };
            let report = idx.index(&root, opts, &cancel);

            if cli.json {
                let output = serde_json::json!({
                    "files_processed": report.files_processed,
                    "chunks_indexed": report.chunks_indexed,
                    "chunks_reused": report.chunks_reused,
                    "embedding_calls": report.embedding_calls,
                    "errors": report.errors,
                });
                println!("{}", serde_json::to_string_pretty(&output).unwrap());
            } else {
                println!("Indexed:        {}", root.display());
                println!("Files:          {}", report.files_processed);
                println!("Chunks indexed: {}", report.chunks_indexed);
                println!("Chunks reused:  {}", report.chunks_reused);
                println!("Embed calls:    {}", report.embedding_calls);
                if !report.errors.is_empty() {
                    eprintln!("\n{} error(s):", report.errors.len());
                    for e in &report.errors {
                        eprintln!("  {e}");
                    }
                }
            }
            idx.close();
        }
        Commands::Search {
            query,
            root,
            index_dir,
            limit,
            semantic_weight,
            path,
            extensions,
            min_similarity,
            brief,
        } => {
            let root = resolve_root(root);
            let index_dir = resolve_index_dir(index_dir, &root);
            let idx = open_index(&index_dir);

            let opts = SearchOptions {
                limit: Some(limit),
                semantic_weight,
                path_filter: path,
                extensions: if extensions.is_empty() { None } else { Some(extensions) },
                min_similarity,
                format_hint: Some(if brief { FormatHint::Brief } else { FormatHint::Verbose }),
            };

            let results = idx.search(&query, opts).unwrap_or_else(|e| {
                eprintln!("Search failed: {e}");
                std::process::exit(1);
            });

            if cli.json {
                let items: Vec<serde_json::Value> = results
                    .iter()
                    .map(|r| {
                        serde_json::json!({
                            "path": r.chunk.path,
                            "start_line": r.chunk.start_line,
                            "end_line": r.chunk.end_line,
                            "score": r.score,
                            "match_kind": r.match_kind.as_str(),
                            "content": r.chunk.content,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&items).unwrap());
            } else {
                if results.is_empty() {
                    eprintln!("No results for '{query}'");
                    std::process::exit(1);
                }
                for r in &results {
                    println!(
                        "{}:{}-{}  {:>6.3}  [{}]",
                        r.chunk.path,
                        r.chunk.start_line,
                        r.chunk.end_line,
                        r.score,
                        r.match_kind.as_str()
                    );
                    println!("{}\n", r.chunk.content);
                }
                eprintln!("{} results", results.len());
            }
            idx.close();
        }
        Commands::SearchDocs { query, root, index_dir, limit, path } => {
            let root = resolve_root(root);
            let index_dir = resolve_index_dir(index_dir, &root);
            let idx = open_index(&index_dir);

            let opts = SearchOptions { limit: Some(limit), path_filter: path, ..Default::default() };
            let results = idx.search_docs(&query, opts).unwrap_or_else(|e| {
                eprintln!("Search failed: {e}");
                std::process::exit(1);
            });

            if cli.json {
                let items: Vec<serde_json::Value> = results
                    .iter()
                    .map(|r| {
                        serde_json::json!({
                            "path": r.snippet.path,
                            "breadcrumb": r.snippet.breadcrumb,
                            "score": r.score,
                            "content": r.snippet.content,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&items).unwrap());
            } else {
                if results.is_empty() {
                    eprintln!("No documentation matches for '{query}'");
                    std::process::exit(1);
                }
                for r in &results {
                    println!("{}  {:>6.3}  {}", r.snippet.path, r.score, r.snippet.breadcrumb);
                    println!("{}\n", r.snippet.content);
                }
            }
            idx.close();
        }
        Commands::Watch { root, index_dir } => {
            let root = resolve_root(root);
            let index_dir = resolve_index_dir(index_dir, &root);
            let idx = open_index(&index_dir);

            eprintln!("Watching {} — press Enter to stop.", root.display());
            let handle = idx
                .watch(&root, |report| {
                    eprintln!(
                        "reindexed: {} file(s), {} chunk(s) indexed, {} reused",
                        report.files_processed, report.chunks_indexed, report.chunks_reused
                    );
                })
                .unwrap_or_else(|e| {
                    eprintln!("Failed to start watcher: {e}");
                    std::process::exit(1);
                });

            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            handle.stop();
            idx.close();
        }
        Commands::Conventions { root, index_dir } => {
            let root = resolve_root(root);
            let index_dir = resolve_index_dir(index_dir, &root);
            let idx = open_index(&index_dir);

            let report = idx.conventions().unwrap_or_else(|e| {
                eprintln!("Failed to mine conventions: {e}");
                std::process::exit(1);
            });

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report).unwrap());
            } else {
                println!("{}", codegrove_core::conventions::format_conventions(&report));
            }
            idx.close();
        }
        Commands::Imports { root, index_dir } => {
            let root = resolve_root(root);
            let index_dir = resolve_index_dir(index_dir, &root);
            let idx = open_index(&index_dir);

            let graph = idx.import_graph().unwrap_or_else(|e| {
                eprintln!("Failed to build import graph: {e}");
                std::process::exit(1);
            });

            println!("{}", serde_json::to_string_pretty(&graph).unwrap());
            idx.close();
        }
    }
}
