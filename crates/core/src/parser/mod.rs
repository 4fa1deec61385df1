//! Parser façade. Routes a file to a structured parser, a generic AST
//! chunker, or a line-window fallback, producing `Chunk`s (and, for prose
//! sources, `InfoSnippet`s) under shared metadata rules.

pub mod fallback;
pub mod generic;
#[cfg(feature = "treesitter")]
pub mod treesitter;

use std::path::Path;

use crate::chunk::{Chunk, InfoSnippet};

#[derive(Debug, Clone)]
pub enum ParseResult {
    Chunks(Vec<Chunk>),
    ChunksAndSnippets(Vec<Chunk>, Vec<InfoSnippet>),
    Skipped(String),
}

impl ParseResult {
    pub fn chunks(&self) -> &[Chunk] {
        match self {
            ParseResult::Chunks(c) => c,
            ParseResult::ChunksAndSnippets(c, _) => c,
            ParseResult::Skipped(_) => &[],
        }
    }

    pub fn snippets(&self) -> &[InfoSnippet] {
        match self {
            ParseResult::ChunksAndSnippets(_, s) => s,
            _ => &[],
        }
    }
}

/// The generic AST chunker's grammar routing table.
const GENERIC_EXTENSIONS: &[&str] = &[
    "m", "mm", "h", "c", "cpp", "cc", "cxx", "hpp", "hh", "hxx", "json", "yaml", "yml", "md",
    "markdown",
];

/// Parses `bytes` (the file content) at `path`, routing by extension.
/// Never fatal: parse failures degrade to `Skipped` or a coarse fallback
/// rather than aborting the caller's indexing pass.
pub fn parse(path: &Path, bytes: &[u8]) -> ParseResult {
    let content = match std::str::from_utf8(bytes) {
        Ok(s) => s,
        Err(_) => return ParseResult::Skipped("not valid utf-8".to_string()),
    };

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    #[cfg(feature = "treesitter")]
    if ext == "swift" {
        return treesitter::parse_swift(path, content);
    }
    #[cfg(not(feature = "treesitter"))]
    if ext == "swift" {
        return fallback::parse_line_windows(path, content);
    }

    if GENERIC_EXTENSIONS.contains(&ext.as_str()) {
        return generic::parse_generic(path, content, &ext);
    }

    fallback::parse_line_windows(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_extension_falls_back_to_line_windows() {
        let result = parse(Path::new("data.bin_text"), b"hello world\nline two\n");
        assert!(matches!(result, ParseResult::Chunks(_)));
        assert!(!result.chunks().is_empty());
    }

    #[test]
    fn invalid_utf8_is_skipped_not_fatal() {
        let result = parse(Path::new("bad.swift"), &[0xff, 0xfe, 0x00, 0xff]);
        assert!(matches!(result, ParseResult::Skipped(_)));
    }
}
