//! Generic AST chunker for `.m/.mm/.h/.c/.cpp/.hpp/.json/.yaml/.yml/.md`.
//! C/C++ route to the tree-sitter grammar in `treesitter.rs`; Objective-C
//! (no grammar in this crate's dependency set) and the structured-data
//! formats use a brace/indent-depth scan that emits full chunks rather
//! than collapsed stubs. Markdown emits `InfoSnippet`s per header section
//! with an accumulated breadcrumb.

use std::path::Path;

use crate::chunk::{detect_language, Chunk, ChunkKind, InfoSnippet, SnippetKind};
use crate::parser::ParseResult;

pub fn parse_generic(path: &Path, content: &str, ext: &str) -> ParseResult {
    match ext {
        "md" | "markdown" => parse_markdown(path, content),
        "json" | "yaml" | "yml" => parse_structured_data(path, content, ext),
        "c" | "h" => dispatch_c_family(path, content, ext),
        "cpp" | "cc" | "cxx" | "hpp" | "hh" | "hxx" => dispatch_c_family(path, content, ext),
        "m" | "mm" => parse_brace_based(path, content, ext),
        _ => parse_brace_based(path, content, ext),
    }
}

#[cfg(feature = "treesitter")]
fn dispatch_c_family(path: &Path, content: &str, ext: &str) -> ParseResult {
    crate::parser::treesitter::parse_c_family(path, content, ext)
}

#[cfg(not(feature = "treesitter"))]
fn dispatch_c_family(path: &Path, content: &str, ext: &str) -> ParseResult {
    parse_brace_based(path, content, ext)
}

/// Brace-depth chunker for languages without a dedicated grammar here
/// (Objective-C) or as the `treesitter`-disabled fallback for C/C++:
/// top-level `{ ... }` blocks become chunks, skipping block comments and
/// keeping the full body rather than collapsing it.
fn parse_brace_based(path: &Path, content: &str, ext: &str) -> ParseResult {
    let language = language_tag(path, ext);
    let path_str = path.to_string_lossy().to_string();
    let bytes = content.as_bytes();
    let mut chunks = Vec::new();
    let mut depth: i32 = 0;
    let mut block_start: Option<usize> = None;
    let mut in_block_comment = false;
    let mut line = 1u32;
    let mut block_start_line = 1u32;

    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '\n' {
            line += 1;
        }
        if in_block_comment {
            if c == '*' && bytes.get(i + 1) == Some(&b'/') {
                in_block_comment = false;
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }
        if c == '/' && bytes.get(i + 1) == Some(&b'*') {
            in_block_comment = true;
            i += 2;
            continue;
        }
        if c == '/' && bytes.get(i + 1) == Some(&b'/') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c == '{' {
            if depth == 0 {
                block_start = Some(i);
                block_start_line = line;
            }
            depth += 1;
        } else if c == '}' {
            depth -= 1;
            if depth == 0 {
                if let Some(start) = block_start.take() {
                    let text = &content[start..=i];
                    let prefix_start = find_decl_start(content, start);
                    let decl_text = &content[prefix_start..=i];
                    let chunk = Chunk::new(
                        &path_str,
                        block_start_line,
                        line,
                        ChunkKind::Other,
                        decl_text.trim_start().to_string(),
                        language,
                    );
                    chunks.push(chunk);
                    let _ = text;
                }
            }
        }
        i += 1;
    }

    if chunks.is_empty() {
        ParseResult::Skipped("no top-level blocks found".to_string())
    } else {
        ParseResult::Chunks(chunks)
    }
}

/// Walks backward from a `{` to the start of its declaration line(s),
/// stopping at the previous top-level `}` or `;` so the chunk's content
/// includes the declaration head, not just the body.
fn find_decl_start(content: &str, brace_pos: usize) -> usize {
    let bytes = content.as_bytes();
    let mut i = brace_pos;
    while i > 0 {
        let c = bytes[i - 1] as char;
        if c == '}' || c == ';' {
            break;
        }
        i -= 1;
    }
    // Skip the newline right after the terminator we stopped at.
    while i < brace_pos && (bytes[i] as char).is_whitespace() {
        i += 1;
    }
    i
}

fn language_tag(path: &Path, ext: &str) -> &'static str {
    match ext {
        "m" | "mm" => "objective-c",
        _ => detect_language(path),
    }
}

/// Simple top-level key scanner for JSON/YAML: one chunk per first-level
/// key, which is sufficient granularity for a hybrid search index over
/// config/manifest files without a full schema-aware parser.
fn parse_structured_data(path: &Path, content: &str, ext: &str) -> ParseResult {
    let language = detect_language(path);
    let path_str = path.to_string_lossy().to_string();

    if ext == "json" {
        return parse_json_top_level(&path_str, content, language);
    }
    parse_yaml_top_level(&path_str, content, language)
}

fn parse_json_top_level(path: &str, content: &str, language: &str) -> ParseResult {
    let mut chunks = Vec::new();
    let mut depth = 0i32;
    let mut key_start: Option<usize> = None;
    let mut line = 1u32;
    let mut key_start_line = 1u32;
    let bytes = content.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '\n' {
            line += 1;
        }
        match c {
            '{' | '[' => {
                if depth == 1 && key_start.is_none() {
                    key_start = Some(i);
                    key_start_line = line;
                }
                depth += 1;
            }
            '}' | ']' => {
                depth -= 1;
                if depth == 1 {
                    if let Some(start) = key_start.take() {
                        let text = &content[start..=i.min(content.len() - 1)];
                        chunks.push(Chunk::new(
                            path,
                            key_start_line,
                            line,
                            ChunkKind::Other,
                            text.to_string(),
                            language,
                        ));
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    if chunks.is_empty() {
        ParseResult::Skipped("no top-level json object/array entries".to_string())
    } else {
        ParseResult::Chunks(chunks)
    }
}

fn parse_yaml_top_level(path: &str, content: &str, language: &str) -> ParseResult {
    let lines: Vec<&str> = content.lines().collect();
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut idx = 0usize;
    while idx < lines.len() {
        let is_top_level_key =
            !lines[idx].starts_with(' ') && !lines[idx].starts_with('\t') && lines[idx].contains(':');
        if is_top_level_key && idx > start {
            chunks.push(build_yaml_chunk(path, &lines, start, idx - 1, language));
            start = idx;
        }
        idx += 1;
    }
    if start < lines.len() {
        chunks.push(build_yaml_chunk(path, &lines, start, lines.len() - 1, language));
    }
    if chunks.is_empty() {
        ParseResult::Skipped("empty yaml document".to_string())
    } else {
        ParseResult::Chunks(chunks)
    }
}

fn build_yaml_chunk(path: &str, lines: &[&str], start: usize, end: usize, language: &str) -> Chunk {
    let text = lines[start..=end].join("\n");
    Chunk::new(path, start as u32 + 1, end as u32 + 1, ChunkKind::Other, text, language)
}

/// Markdown: one `InfoSnippet` per header section, breadcrumb accumulated
/// from the heading hierarchy.
fn parse_markdown(path: &Path, content: &str) -> ParseResult {
    let path_str = path.to_string_lossy().to_string();
    let lines: Vec<&str> = content.lines().collect();

    let mut snippets = Vec::new();
    let mut heading_stack: Vec<(usize, String)> = Vec::new();
    let mut section_start = 0usize;
    let mut current_breadcrumb = String::new();

    let mut sections: Vec<(usize, usize, String)> = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some((level, title)) = parse_heading(line) {
            if idx > section_start {
                sections.push((section_start, idx - 1, current_breadcrumb.clone()));
            }
            heading_stack.retain(|(l, _)| *l < level);
            heading_stack.push((level, title));
            current_breadcrumb = heading_stack
                .iter()
                .map(|(_, t)| t.as_str())
                .collect::<Vec<_>>()
                .join(" > ");
            section_start = idx;
        }
    }
    if section_start < lines.len() {
        sections.push((section_start, lines.len() - 1, current_breadcrumb.clone()));
    }

    for (start, end, breadcrumb) in sections {
        let text = lines[start..=end].join("\n");
        if text.trim().is_empty() {
            continue;
        }
        let mut snippet = InfoSnippet::new(
            &path_str,
            start as u32 + 1,
            end as u32 + 1,
            SnippetKind::MarkdownSection,
            text,
        );
        snippet.breadcrumb = if breadcrumb.is_empty() { None } else { Some(breadcrumb) };
        snippets.push(snippet);
    }

    if snippets.is_empty() {
        ParseResult::Skipped("no markdown content".to_string())
    } else {
        ParseResult::ChunksAndSnippets(Vec::new(), snippets)
    }
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('#') {
        return None;
    }
    let level = trimmed.chars().take_while(|&c| c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let title = trimmed[level..].trim().to_string();
    if title.is_empty() {
        None
    } else {
        Some((level, title))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markdown_sections_build_breadcrumb() {
        let content = "# Title\n\nintro\n\n## Sub\n\nbody\n";
        let result = parse_markdown(Path::new("doc.md"), content);
        let snippets = result.snippets();
        assert!(snippets.iter().any(|s| s.breadcrumb.as_deref() == Some("Title > Sub")));
    }

    #[test]
    fn json_top_level_entries_become_chunks() {
        let content = r#"{"a": {"x": 1}, "b": [1,2,3]}"#;
        let result = parse_json_top_level("f.json", content, "json");
        assert!(!result.chunks().is_empty());
    }

    #[test]
    fn brace_based_chunker_finds_function_bodies() {
        let content = "void foo() {\n  int x = 1;\n}\n\nvoid bar() {\n  return;\n}\n";
        let result = parse_brace_based(Path::new("f.m"), content, "m");
        assert_eq!(result.chunks().len(), 2);
    }

    #[test]
    fn yaml_top_level_keys_become_chunks() {
        let content = "a: 1\nb:\n  c: 2\n  d: 3\ne: 4\n";
        let result = parse_yaml_top_level("f.yaml", content, "yaml");
        assert_eq!(result.chunks().len(), 3);
    }
}
