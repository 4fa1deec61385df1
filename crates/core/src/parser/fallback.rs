//! Line-window fallback for extensions with no dedicated grammar: one
//! `free_code` chunk per ~200-line window.

use std::path::Path;

use crate::chunk::{detect_language, Chunk, ChunkKind};
use crate::parser::ParseResult;

const WINDOW_LINES: usize = 200;

pub fn parse_line_windows(path: &Path, content: &str) -> ParseResult {
    let language = detect_language(path);
    let path_str = path.to_string_lossy();
    let lines: Vec<&str> = content.lines().collect();
    if lines.is_empty() {
        return ParseResult::Skipped("empty file".to_string());
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < lines.len() {
        let end = (start + WINDOW_LINES).min(lines.len());
        let window = lines[start..end].join("\n");
        let chunk = Chunk::new(
            path_str.as_ref(),
            (start + 1) as u32,
            end as u32,
            ChunkKind::FreeCode,
            window,
            language,
        );
        chunks.push(chunk);
        start = end;
    }
    ParseResult::Chunks(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_one_chunk_for_small_file() {
        let content = "a\nb\nc\n";
        let result = parse_line_windows(Path::new("x.txt"), content);
        assert_eq!(result.chunks().len(), 1);
        assert_eq!(result.chunks()[0].kind, ChunkKind::FreeCode);
    }

    #[test]
    fn windows_split_at_200_lines() {
        let content = (0..450).map(|i| format!("line{i}")).collect::<Vec<_>>().join("\n");
        let result = parse_line_windows(Path::new("x.txt"), &content);
        assert_eq!(result.chunks().len(), 3);
        assert_eq!(result.chunks()[0].start_line, 1);
        assert_eq!(result.chunks()[0].end_line, 200);
        assert_eq!(result.chunks()[2].start_line, 401);
    }

    #[test]
    fn empty_file_is_skipped() {
        let result = parse_line_windows(Path::new("empty.txt"), "");
        assert!(matches!(result, ParseResult::Skipped(_)));
    }
}
