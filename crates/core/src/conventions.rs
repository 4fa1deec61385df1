//! Convention mining — detects coding patterns from already-indexed
//! chunks via lightweight string matching over `Chunk.content` already
//! sitting in the lexical store, instead of re-reading files from disk.

use serde::Serialize;

use crate::chunk::Chunk;

#[derive(Debug, Clone, Serialize)]
pub struct ConventionReport {
    pub error_handling: ErrorHandlingConventions,
    pub naming: NamingConventions,
    pub testing: TestingConventions,
    pub import_style: ImportConventions,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorHandlingConventions {
    pub result_type_count: usize,
    pub unwrap_count: usize,
    pub try_catch_count: usize,
    pub style: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NamingConventions {
    pub snake_case_fns: usize,
    pub camel_case_fns: usize,
    pub pascal_case_types: usize,
    pub style: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestingConventions {
    pub test_attribute_count: usize,
    pub test_file_count: usize,
    pub style: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportConventions {
    pub grouped_imports: bool,
    pub wildcard_imports: usize,
    pub style: String,
}

/// Mines conventions from already-indexed chunks. Pure read-side addition
/// over data the index already owns — it does not touch the filesystem or
/// change any stored schema.
pub fn mine_conventions(chunks: &[Chunk]) -> ConventionReport {
    let mut result_count: usize = 0;
    let mut unwrap_count: usize = 0;
    let mut try_catch_count: usize = 0;
    let mut question_mark_count: usize = 0;

    let mut snake_case_fns: usize = 0;
    let mut camel_case_fns: usize = 0;
    let mut pascal_case_types: usize = 0;

    let mut test_attr_count: usize = 0;
    let mut test_file_count: usize = 0;
    let mut jest_count: usize = 0;
    let mut pytest_count: usize = 0;

    let mut wildcard_imports: usize = 0;
    let mut grouped_files: usize = 0;
    let mut ungrouped_files: usize = 0;

    let mut seen_test_paths = std::collections::HashSet::new();

    for chunk in chunks {
        let is_test_file = chunk.path.contains("test")
            || chunk.path.contains("spec")
            || chunk.path.ends_with("_test.go")
            || chunk.path.ends_with("_test.rs");
        if is_test_file && seen_test_paths.insert(chunk.path.clone()) {
            test_file_count += 1;
        }

        let mut file_has_import_gap = false;
        let mut in_import_block = false;
        let mut saw_import_line = false;

        for line in chunk.content.lines() {
            let trimmed = line.trim();

            if trimmed.contains("Result<") || trimmed.contains("-> Result") {
                result_count += 1;
            }
            if trimmed.contains(".unwrap()") {
                unwrap_count += 1;
            }
            if trimmed.contains("try {") || trimmed.contains("try:") {
                try_catch_count += 1;
            }
            if trimmed.contains("catch ") || trimmed.contains("except ") {
                try_catch_count += 1;
            }
            if trimmed.ends_with('?') || trimmed.contains("?)") || trimmed.contains("?;") {
                question_mark_count += 1;
            }

            if let Some(fn_name) = extract_fn_name(trimmed) {
                if is_snake_case(fn_name) {
                    snake_case_fns += 1;
                } else if is_camel_case(fn_name) {
                    camel_case_fns += 1;
                }
            }

            if let Some(type_name) = extract_type_name(trimmed) {
                if is_pascal_case(type_name) {
                    pascal_case_types += 1;
                }
            }

            if trimmed.contains("#[test]") || trimmed.contains("#[tokio::test]") {
                test_attr_count += 1;
            }
            if trimmed.starts_with("describe(") || trimmed.starts_with("it(") {
                jest_count += 1;
            }
            if trimmed.starts_with("def test_") || trimmed.contains("@pytest") {
                pytest_count += 1;
            }

            if trimmed.contains("use ") && trimmed.contains("::*") {
                wildcard_imports += 1;
            }
            if trimmed.starts_with("import ") && trimmed.contains('*') {
                wildcard_imports += 1;
            }

            let is_import_line = trimmed.starts_with("use ")
                || trimmed.starts_with("import ")
                || trimmed.starts_with("from ")
                || trimmed.starts_with("#include");
            if is_import_line {
                in_import_block = true;
                saw_import_line = true;
            } else if in_import_block && trimmed.is_empty() {
                file_has_import_gap = true;
            } else if in_import_block && !trimmed.is_empty() && !is_import_line {
                in_import_block = false;
            }
        }

        if file_has_import_gap {
            grouped_files += 1;
        } else if saw_import_line {
            ungrouped_files += 1;
        }
    }

    let error_style = if result_count + question_mark_count > try_catch_count * 2 {
        "result-based"
    } else if try_catch_count > result_count + question_mark_count {
        "exception-based"
    } else if result_count + question_mark_count + try_catch_count == 0 {
        "none detected"
    } else {
        "mixed"
    };

    let naming_style = if snake_case_fns > camel_case_fns * 3 {
        "snake_case"
    } else if camel_case_fns > snake_case_fns * 3 {
        "camelCase"
    } else if snake_case_fns + camel_case_fns == 0 {
        "none detected"
    } else {
        "mixed"
    };

    let test_style = if test_attr_count > 0 && jest_count == 0 && pytest_count == 0 {
        "rust-test"
    } else if jest_count > 0 && test_attr_count == 0 {
        "jest-style"
    } else if pytest_count > 0 && test_attr_count == 0 {
        "pytest-style"
    } else if test_attr_count + jest_count + pytest_count == 0 {
        "none"
    } else {
        "mixed"
    };

    let import_style = if grouped_files > ungrouped_files && grouped_files > 0 {
        "grouped"
    } else if ungrouped_files > grouped_files {
        "ungrouped"
    } else if grouped_files + ungrouped_files == 0 {
        "none detected"
    } else {
        "mixed"
    };

    ConventionReport {
        error_handling: ErrorHandlingConventions {
            result_type_count: result_count + question_mark_count,
            unwrap_count,
            try_catch_count,
            style: error_style.to_string(),
        },
        naming: NamingConventions {
            snake_case_fns,
            camel_case_fns,
            pascal_case_types,
            style: naming_style.to_string(),
        },
        testing: TestingConventions {
            test_attribute_count: test_attr_count + jest_count + pytest_count,
            test_file_count,
            style: test_style.to_string(),
        },
        import_style: ImportConventions {
            grouped_imports: grouped_files > ungrouped_files,
            wildcard_imports,
            style: import_style.to_string(),
        },
    }
}

pub fn format_conventions(report: &ConventionReport) -> String {
    let mut out = String::new();
    out.push_str("# Project Conventions\n\n");

    out.push_str("## Error Handling\n");
    out.push_str(&format!("- Style: {}\n", report.error_handling.style));
    out.push_str(&format!("- Result/? usage: {}\n", report.error_handling.result_type_count));
    out.push_str(&format!("- .unwrap() calls: {}\n", report.error_handling.unwrap_count));
    out.push_str(&format!("- try/catch blocks: {}\n", report.error_handling.try_catch_count));
    out.push('\n');

    out.push_str("## Naming\n");
    out.push_str(&format!("- Style: {}\n", report.naming.style));
    out.push_str(&format!("- snake_case functions: {}\n", report.naming.snake_case_fns));
    out.push_str(&format!("- camelCase functions: {}\n", report.naming.camel_case_fns));
    out.push_str(&format!("- PascalCase types: {}\n", report.naming.pascal_case_types));
    out.push('\n');

    out.push_str("## Testing\n");
    out.push_str(&format!("- Style: {}\n", report.testing.style));
    out.push_str(&format!("- Test attributes/markers: {}\n", report.testing.test_attribute_count));
    out.push_str(&format!("- Test files: {}\n", report.testing.test_file_count));
    out.push('\n');

    out.push_str("## Import Style\n");
    out.push_str(&format!("- Style: {}\n", report.import_style.style));
    out.push_str(&format!("- Grouped imports: {}\n", report.import_style.grouped_imports));
    out.push_str(&format!("- Wildcard imports: {}\n", report.import_style.wildcard_imports));

    out
}

fn extract_fn_name(line: &str) -> Option<&str> {
    let patterns: &[&str] = &["fn ", "function ", "def ", "func "];
    for pat in patterns {
        if let Some(idx) = line.find(pat) {
            let after = &line[idx + pat.len()..];
            let name = after.split(|c: char| !c.is_alphanumeric() && c != '_').next()?;
            if !name.is_empty() {
                return Some(name);
            }
        }
    }
    None
}

fn extract_type_name(line: &str) -> Option<&str> {
    let patterns: &[&str] = &["struct ", "class ", "enum ", "interface ", "type ", "trait "];
    for pat in patterns {
        if let Some(idx) = line.find(pat) {
            let after = &line[idx + pat.len()..];
            let name = after.split(|c: char| !c.is_alphanumeric() && c != '_').next()?;
            if !name.is_empty() {
                return Some(name);
            }
        }
    }
    None
}

fn is_snake_case(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_lowercase() || c.is_ascii_digit() || c == '_') && s.contains('_')
}

fn is_camel_case(s: &str) -> bool {
    if s.is_empty() || s.starts_with(|c: char| c.is_uppercase()) {
        return false;
    }
    s.chars().any(|c| c.is_uppercase())
}

fn is_pascal_case(s: &str) -> bool {
    !s.is_empty() && s.starts_with(|c: char| c.is_uppercase()) && s.chars().skip(1).any(|c| c.is_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkKind;

    #[test]
    fn extract_fn_name_handles_common_keywords() {
        assert_eq!(extract_fn_name("pub fn greet(name: &str)"), Some("greet"));
        assert_eq!(extract_fn_name("function getName()"), Some("getName"));
        assert_eq!(extract_fn_name("def test_something():"), Some("test_something"));
        assert_eq!(extract_fn_name("let x = 5;"), None);
    }

    #[test]
    fn naming_detection() {
        assert!(is_snake_case("process_data"));
        assert!(is_camel_case("processData"));
        assert!(is_pascal_case("ProcessData"));
    }

    #[test]
    fn mine_conventions_over_empty_chunk_list() {
        let report = mine_conventions(&[]);
        assert_eq!(report.error_handling.style, "none detected");
        assert_eq!(report.naming.style, "none detected");
        assert_eq!(report.testing.style, "none");
    }

    #[test]
    fn mine_conventions_detects_rust_test_style() {
        let mut chunk = Chunk::new(
            "src/lib_test.rs",
            1,
            10,
            ChunkKind::Function,
            "#[test]\nfn it_works() -> Result<(), String> {\n    Ok(())\n}\n",
            "rust",
        );
        chunk.symbols = vec!["it_works".into()];
        let report = mine_conventions(&[chunk]);
        assert_eq!(report.testing.style, "rust-test");
        assert_eq!(report.testing.test_file_count, 1);
    }
}
