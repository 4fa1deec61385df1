//! Glob matcher. Translates a glob pattern to an anchored regex and
//! caches compiled patterns in a small LRU.

use moka::sync::Cache;
use regex::Regex;

const CACHE_CAPACITY: u64 = 100;

#[derive(Clone)]
pub struct GlobMatcher {
    cache: Cache<String, Regex>,
}

impl Default for GlobMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobMatcher {
    pub fn new() -> Self {
        GlobMatcher {
            cache: Cache::new(CACHE_CAPACITY),
        }
    }

    /// Whether `path` matches `pattern`. Result depends only on the pair
    /// `(pattern, path)`, never on cache state — the cache only avoids
    /// recompiling the same pattern's regex.
    pub fn matches(&self, pattern: &str, path: &str) -> bool {
        let regex = self.compiled(pattern);
        regex.is_match(path)
    }

    fn compiled(&self, pattern: &str) -> Regex {
        if let Some(re) = self.cache.get(pattern) {
            return re;
        }
        let re = compile_glob(pattern);
        self.cache.insert(pattern.to_string(), re.clone());
        re
    }
}

/// Translates a glob into an anchored regex:
/// `.` → `\.`; `**/` → `(.*/)?`; `**` → `.*`; `*` → `[^/]*`; `?` → `.`.
fn compile_glob(pattern: &str) -> Regex {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    if chars.get(i + 2) == Some(&'/') {
                        out.push_str("(.*/)?");
                        i += 3;
                        continue;
                    } else {
                        out.push_str(".*");
                        i += 2;
                        continue;
                    }
                } else {
                    out.push_str("[^/]*");
                    i += 1;
                    continue;
                }
            }
            '?' => {
                out.push('.');
            }
            '.' => {
                out.push_str("\\.");
            }
            other => {
                if is_regex_meta(other) {
                    out.push('\\');
                }
                out.push(other);
            }
        }
        i += 1;
    }
    out.push('$');
    Regex::new(&out).unwrap_or_else(|_| Regex::new("^$").expect("empty pattern always compiles"))
}

fn is_regex_meta(c: char) -> bool {
    matches!(
        c,
        '\\' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_does_not_cross_path_separator() {
        let m = GlobMatcher::new();
        assert!(m.matches("src/*.rs", "src/main.rs"));
        assert!(!m.matches("src/*.rs", "src/sub/main.rs"));
    }

    #[test]
    fn double_star_crosses_separators() {
        let m = GlobMatcher::new();
        assert!(m.matches("**/node_modules/**", "a/b/node_modules/pkg/index.js"));
        assert!(m.matches("**/node_modules/**", "node_modules/pkg/index.js"));
    }

    #[test]
    fn question_mark_matches_single_char() {
        let m = GlobMatcher::new();
        assert!(m.matches("a?.rs", "ab.rs"));
        assert!(!m.matches("a?.rs", "abc.rs"));
    }

    #[test]
    fn result_independent_of_cache_state() {
        let m = GlobMatcher::new();
        let before = m.matches("*.md", "README.md");
        // Force eviction pressure on the cache by compiling many patterns.
        for i in 0..500 {
            m.matches(&format!("pattern-{i}/*.x"), "irrelevant");
        }
        let after = m.matches("*.md", "README.md");
        assert_eq!(before, after);
    }

    #[test]
    fn dot_is_escaped_literal() {
        let m = GlobMatcher::new();
        assert!(m.matches("*.rs", "main.rs"));
        assert!(!m.matches("*.rs", "mainXrs"));
    }
}
