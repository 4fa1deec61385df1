//! The Chunk/Snippet value model. Immutable once constructed; equality is
//! by `id`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Function,
    Method,
    Class,
    Struct,
    Enum,
    Protocol,
    Actor,
    Extension,
    Macro,
    Property,
    FreeCode,
    MarkdownSection,
    Other,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Function => "function",
            ChunkKind::Method => "method",
            ChunkKind::Class => "class",
            ChunkKind::Struct => "struct",
            ChunkKind::Enum => "enum",
            ChunkKind::Protocol => "protocol",
            ChunkKind::Actor => "actor",
            ChunkKind::Extension => "extension",
            ChunkKind::Macro => "macro",
            ChunkKind::Property => "property",
            ChunkKind::FreeCode => "free_code",
            ChunkKind::MarkdownSection => "markdown_section",
            ChunkKind::Other => "other",
        }
    }

    /// Kinds the parser façade treats as type headers.
    pub fn is_type_header_kind(&self) -> bool {
        matches!(
            self,
            ChunkKind::Class
                | ChunkKind::Struct
                | ChunkKind::Enum
                | ChunkKind::Actor
                | ChunkKind::Extension
                | ChunkKind::Protocol
        )
    }
}

impl std::fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A semantically bounded code unit.
///
/// Equality and hashing are by `id` only: two chunks with the same id are
/// the same logical entity regardless of incidental field drift (e.g. a
/// back-filled `generated_description`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub kind: ChunkKind,
    pub symbols: Vec<String>,
    pub references: Vec<String>,
    pub imports: Vec<String>,
    pub conformances: Vec<String>,
    pub is_type_declaration: bool,
    pub signature: Option<String>,
    pub doc_comment: Option<String>,
    pub breadcrumb: Option<String>,
    pub language: String,
    pub token_count: u32,
    pub content_hash: String,
    pub content: String,
    pub generated_description: Option<String>,
}

impl PartialEq for Chunk {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Chunk {}

impl std::hash::Hash for Chunk {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Chunk {
    /// Deterministic id derived from `(path, start_line, end_line, kind)`.
    /// Never content-derived: two chunks with identical content at
    /// different paths or line ranges must still get distinct ids.
    pub fn chunk_id(path: &str, start_line: u32, end_line: u32, kind: ChunkKind) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(start_line.to_le_bytes());
        hasher.update(end_line.to_le_bytes());
        hasher.update(b"\0");
        hasher.update(kind.as_str().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn content_hash_of(content: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: impl Into<String>,
        start_line: u32,
        end_line: u32,
        kind: ChunkKind,
        content: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        let path = normalize_path(&path.into());
        let content = content.into();
        let content_hash = Self::content_hash_of(&content);
        let id = Self::chunk_id(&path, start_line, end_line, kind);
        let token_count = estimate_token_count(&content);
        Chunk {
            id,
            path,
            start_line,
            end_line,
            kind,
            symbols: Vec::new(),
            references: Vec::new(),
            imports: Vec::new(),
            conformances: Vec::new(),
            is_type_declaration: false,
            signature: None,
            doc_comment: None,
            breadcrumb: None,
            language: language.into(),
            token_count,
            content_hash,
            content,
            generated_description: None,
        }
    }

    pub fn primary_symbol(&self) -> Option<&str> {
        self.symbols.first().map(|s| s.as_str())
    }

    /// Recomputes `content_hash` and `token_count` in place; callers must
    /// call this after mutating `content` directly (e.g. back-filling a
    /// `generated_description` never touches content, so this is only
    /// needed by parser code building a chunk incrementally).
    pub fn recompute_content_derived_fields(&mut self) {
        self.content_hash = Self::content_hash_of(&self.content);
        self.token_count = estimate_token_count(&self.content);
    }
}

/// Cheap token estimate: `ceil(len(content) / 4)`.
pub fn estimate_token_count(content: &str) -> u32 {
    let len = content.len();
    ((len + 3) / 4) as u32
}

/// Repo-relative, forward-slash normalized path.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Standalone documentation fragment extracted from prose sources.
/// `chunk_id` optionally links back to an owning code chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnippetKind {
    MarkdownSection,
    Documentation,
    Example,
    Annotation,
}

impl SnippetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnippetKind::MarkdownSection => "markdown_section",
            SnippetKind::Documentation => "documentation",
            SnippetKind::Example => "example",
            SnippetKind::Annotation => "annotation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoSnippet {
    pub id: String,
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub breadcrumb: Option<String>,
    pub kind: SnippetKind,
    pub content: String,
    pub token_count: u32,
    pub chunk_id: Option<String>,
}

impl InfoSnippet {
    pub fn new(
        path: impl Into<String>,
        start_line: u32,
        end_line: u32,
        kind: SnippetKind,
        content: impl Into<String>,
    ) -> Self {
        let path = normalize_path(&path.into());
        let content = content.into();
        let token_count = estimate_token_count(&content);
        let id = Chunk::chunk_id(&path, start_line, end_line, ChunkKind::MarkdownSection);
        InfoSnippet {
            id,
            path,
            start_line,
            end_line,
            breadcrumb: None,
            kind,
            content,
            token_count,
            chunk_id: None,
        }
    }
}

/// Per-path bookkeeping used for reindex skip-decisions. Keyed by
/// `path`, not by hash, so identical content at two paths is tracked
/// independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub content_hash: String,
    pub indexed_at: chrono::DateTime<chrono::Utc>,
    pub chunk_count: u32,
}

/// Written once at index creation and enforced on reopen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfigSnapshot {
    pub embedding_dimension: usize,
    pub embedder_tag: String,
    pub schema_version: u32,
    pub tokenizer_tag: String,
}

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Detects a language tag from a file extension. Unknown
/// extensions map to `"unknown"` rather than failing — callers route on
/// language only to pick a parser, never to reject a file outright.
pub fn detect_language(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "swift" => "swift",
        "m" | "mm" => "objective-c",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" | "hh" | "hxx" => "c++",
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "md" | "markdown" => "markdown",
        "toml" => "toml",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_matches_sha256() {
        let c = Chunk::new("a.swift", 1, 3, ChunkKind::Function, "func add() {}", "swift");
        assert_eq!(c.content_hash, Chunk::content_hash_of(&c.content));
    }

    #[test]
    fn id_is_stable_for_identical_coordinates() {
        let a = Chunk::new("a.swift", 1, 3, ChunkKind::Function, "func add() {}", "swift");
        let b = Chunk::new("a.swift", 1, 3, ChunkKind::Function, "func add() {}", "swift");
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn id_differs_by_kind_even_with_same_range() {
        let a = Chunk::new("a.swift", 1, 3, ChunkKind::Function, "x", "swift");
        let b = Chunk::new("a.swift", 1, 3, ChunkKind::Method, "x", "swift");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn equality_is_by_id_only() {
        let mut a = Chunk::new("a.swift", 1, 3, ChunkKind::Function, "x", "swift");
        let b = Chunk::new("a.swift", 1, 3, ChunkKind::Function, "x", "swift");
        a.generated_description = Some("differs".into());
        assert_eq!(a, b);
    }

    #[test]
    fn detect_language_covers_extension_table() {
        assert_eq!(detect_language(Path::new("Foo.swift")), "swift");
        assert_eq!(detect_language(Path::new("foo.mm")), "objective-c");
        assert_eq!(detect_language(Path::new("foo.cpp")), "c++");
        assert_eq!(detect_language(Path::new("README.md")), "markdown");
        assert_eq!(detect_language(Path::new("noext")), "unknown");
    }

    #[test]
    fn token_count_is_ceil_div_four() {
        assert_eq!(estimate_token_count("abcd"), 1);
        assert_eq!(estimate_token_count("abcde"), 2);
        assert_eq!(estimate_token_count(""), 0);
    }

    #[test]
    fn normalize_path_flips_backslashes() {
        assert_eq!(normalize_path("a\\b\\c.rs"), "a/b/c.rs");
    }
}
