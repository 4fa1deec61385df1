//! Lexical store: an embedded tantivy full-text index, actor-serialized
//! the same way `watch.rs`'s `debounce_loop` owns its state on a single
//! thread. All operations funnel through one dedicated thread via an
//! `mpsc` request/response channel so callers can invoke concurrently
//! while mutations are strictly ordered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use serde::{Deserialize, Serialize};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, RegexQuery, TermQuery};
use tantivy::schema::{IndexRecordOption, Schema, TextFieldIndexing, TextOptions, FAST, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, Term};

use crate::chunk::{Chunk, ChunkKind, FileRecord, IndexConfigSnapshot, InfoSnippet, SnippetKind};
use crate::error::{CoreError, CoreResult};

/// FTS columns per invariant I5. `references`/`imports` are stored for
/// reconstruction but are deliberately not part of this set.
struct Fields {
    id: tantivy::schema::Field,
    path: tantivy::schema::Field,
    start_line: tantivy::schema::Field,
    end_line: tantivy::schema::Field,
    kind: tantivy::schema::Field,
    symbols_json: tantivy::schema::Field,
    symbols_text: tantivy::schema::Field,
    references_json: tantivy::schema::Field,
    imports_json: tantivy::schema::Field,
    conformances_json: tantivy::schema::Field,
    conformances_text: tantivy::schema::Field,
    signature: tantivy::schema::Field,
    doc_comment: tantivy::schema::Field,
    breadcrumb: tantivy::schema::Field,
    language: tantivy::schema::Field,
    token_count: tantivy::schema::Field,
    content_hash: tantivy::schema::Field,
    content: tantivy::schema::Field,
    generated_description: tantivy::schema::Field,
    is_type_declaration: tantivy::schema::Field,
}

fn build_schema() -> (Schema, Fields) {
    let mut builder = Schema::builder();
    let text_stored = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("default")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();

    let id = builder.add_text_field("id", STRING | STORED);
    let path = builder.add_text_field("path", STRING | STORED);
    let start_line = builder.add_u64_field("start_line", STORED);
    let end_line = builder.add_u64_field("end_line", STORED);
    let kind = builder.add_text_field("kind", STRING | STORED);
    let symbols_json = builder.add_text_field("symbols_json", STORED);
    let symbols_text = builder.add_text_field("symbols_text", text_stored.clone());
    let references_json = builder.add_text_field("references_json", STORED);
    let imports_json = builder.add_text_field("imports_json", STORED);
    let conformances_json = builder.add_text_field("conformances_json", STORED);
    let conformances_text = builder.add_text_field("conformances_text", text_stored.clone());
    let signature = builder.add_text_field("signature", text_stored.clone());
    let doc_comment = builder.add_text_field("doc_comment", text_stored.clone());
    let breadcrumb = builder.add_text_field("breadcrumb", text_stored.clone());
    let language = builder.add_text_field("language", STRING | STORED);
    let token_count = builder.add_u64_field("token_count", STORED | FAST);
    let content_hash = builder.add_text_field("content_hash", STRING | STORED);
    let content = builder.add_text_field("content", text_stored.clone());
    let generated_description = builder.add_text_field("generated_description", text_stored);
    let is_type_declaration = builder.add_u64_field("is_type_declaration", STORED | FAST);

    let schema = builder.build();
    let fields = Fields {
        id,
        path,
        start_line,
        end_line,
        kind,
        symbols_json,
        symbols_text,
        references_json,
        imports_json,
        conformances_json,
        conformances_text,
        signature,
        doc_comment,
        breadcrumb,
        language,
        token_count,
        content_hash,
        content,
        generated_description,
        is_type_declaration,
    };
    (schema, fields)
}

/// FTS schema for `info_snippets`, kept as a second small tantivy index
/// next to the chunks one rather than folded into the same schema, since
/// snippets have no symbols/conformances columns to share.
struct SnippetFields {
    id: tantivy::schema::Field,
    path: tantivy::schema::Field,
    start_line: tantivy::schema::Field,
    end_line: tantivy::schema::Field,
    breadcrumb: tantivy::schema::Field,
    kind: tantivy::schema::Field,
    content: tantivy::schema::Field,
    token_count: tantivy::schema::Field,
    chunk_id: tantivy::schema::Field,
}

fn build_snippet_schema() -> (Schema, SnippetFields) {
    let mut builder = Schema::builder();
    let text_stored = TextOptions::default()
        .set_indexing_options(
            TextFieldIndexing::default()
                .set_tokenizer("default")
                .set_index_option(IndexRecordOption::WithFreqsAndPositions),
        )
        .set_stored();

    let id = builder.add_text_field("id", STRING | STORED);
    let path = builder.add_text_field("path", STRING | STORED);
    let start_line = builder.add_u64_field("start_line", STORED);
    let end_line = builder.add_u64_field("end_line", STORED);
    let breadcrumb = builder.add_text_field("breadcrumb", text_stored.clone());
    let kind = builder.add_text_field("kind", STRING | STORED);
    let content = builder.add_text_field("content", text_stored);
    let token_count = builder.add_u64_field("token_count", STORED);
    let chunk_id = builder.add_text_field("chunk_id", STRING | STORED);

    let schema = builder.build();
    let fields = SnippetFields {
        id,
        path,
        start_line,
        end_line,
        breadcrumb,
        kind,
        content,
        token_count,
        chunk_id,
    };
    (schema, fields)
}

fn snippet_kind_from_str(s: &str) -> SnippetKind {
    match s {
        "documentation" => SnippetKind::Documentation,
        "example" => SnippetKind::Example,
        "annotation" => SnippetKind::Annotation,
        _ => SnippetKind::MarkdownSection,
    }
}

fn snippet_to_doc(fields: &SnippetFields, snippet: &InfoSnippet) -> tantivy::TantivyDocument {
    doc!(
        fields.id => snippet.id.clone(),
        fields.path => snippet.path.clone(),
        fields.start_line => snippet.start_line as u64,
        fields.end_line => snippet.end_line as u64,
        fields.breadcrumb => snippet.breadcrumb.clone().unwrap_or_default(),
        fields.kind => snippet.kind.as_str(),
        fields.content => snippet.content.clone(),
        fields.token_count => snippet.token_count as u64,
        fields.chunk_id => snippet.chunk_id.clone().unwrap_or_default(),
    )
}

fn doc_to_snippet(fields: &SnippetFields, doc: &tantivy::TantivyDocument) -> Option<InfoSnippet> {
    use tantivy::schema::document::Value;
    let get_text = |f: tantivy::schema::Field| -> String {
        doc.get_first(f)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    let get_opt_text = |f: tantivy::schema::Field| -> Option<String> {
        let s = get_text(f);
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    };
    let get_u64 = |f: tantivy::schema::Field| -> u64 { doc.get_first(f).and_then(|v| v.as_u64()).unwrap_or(0) };

    Some(InfoSnippet {
        id: get_text(fields.id),
        path: get_text(fields.path),
        start_line: get_u64(fields.start_line) as u32,
        end_line: get_u64(fields.end_line) as u32,
        breadcrumb: get_opt_text(fields.breadcrumb),
        kind: snippet_kind_from_str(&get_text(fields.kind)),
        content: get_text(fields.content),
        token_count: get_u64(fields.token_count) as u32,
        chunk_id: get_opt_text(fields.chunk_id),
    })
}

fn chunk_kind_from_str(s: &str) -> ChunkKind {
    match s {
        "function" => ChunkKind::Function,
        "method" => ChunkKind::Method,
        "class" => ChunkKind::Class,
        "struct" => ChunkKind::Struct,
        "enum" => ChunkKind::Enum,
        "protocol" => ChunkKind::Protocol,
        "actor" => ChunkKind::Actor,
        "extension" => ChunkKind::Extension,
        "macro" => ChunkKind::Macro,
        "property" => ChunkKind::Property,
        "free_code" => ChunkKind::FreeCode,
        "markdown_section" => ChunkKind::MarkdownSection,
        _ => ChunkKind::Other,
    }
}

fn chunk_to_doc(fields: &Fields, chunk: &Chunk) -> tantivy::TantivyDocument {
    let symbols_json = serde_json::to_string(&chunk.symbols).unwrap_or_default();
    let references_json = serde_json::to_string(&chunk.references).unwrap_or_default();
    let imports_json = serde_json::to_string(&chunk.imports).unwrap_or_default();
    let conformances_json = serde_json::to_string(&chunk.conformances).unwrap_or_default();

    doc!(
        fields.id => chunk.id.clone(),
        fields.path => chunk.path.clone(),
        fields.start_line => chunk.start_line as u64,
        fields.end_line => chunk.end_line as u64,
        fields.kind => chunk.kind.as_str(),
        fields.symbols_json => symbols_json,
        fields.symbols_text => chunk.symbols.join(" "),
        fields.references_json => references_json,
        fields.imports_json => imports_json,
        fields.conformances_json => conformances_json,
        fields.conformances_text => chunk.conformances.join(" "),
        fields.signature => chunk.signature.clone().unwrap_or_default(),
        fields.doc_comment => chunk.doc_comment.clone().unwrap_or_default(),
        fields.breadcrumb => chunk.breadcrumb.clone().unwrap_or_default(),
        fields.language => chunk.language.clone(),
        fields.token_count => chunk.token_count as u64,
        fields.content_hash => chunk.content_hash.clone(),
        fields.content => chunk.content.clone(),
        fields.generated_description => chunk.generated_description.clone().unwrap_or_default(),
        fields.is_type_declaration => chunk.is_type_declaration as u64,
    )
}

fn doc_to_chunk(fields: &Fields, doc: &tantivy::TantivyDocument) -> Option<Chunk> {
    use tantivy::schema::document::Value;
    let get_text = |f: tantivy::schema::Field| -> String {
        doc.get_first(f)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    let get_opt_text = |f: tantivy::schema::Field| -> Option<String> {
        let s = get_text(f);
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    };
    let get_u64 = |f: tantivy::schema::Field| -> u64 { doc.get_first(f).and_then(|v| v.as_u64()).unwrap_or(0) };

    let symbols: Vec<String> = serde_json::from_str(&get_text(fields.symbols_json)).unwrap_or_default();
    let references: Vec<String> = serde_json::from_str(&get_text(fields.references_json)).unwrap_or_default();
    let imports: Vec<String> = serde_json::from_str(&get_text(fields.imports_json)).unwrap_or_default();
    let conformances: Vec<String> =
        serde_json::from_str(&get_text(fields.conformances_json)).unwrap_or_default();

    Some(Chunk {
        id: get_text(fields.id),
        path: get_text(fields.path),
        start_line: get_u64(fields.start_line) as u32,
        end_line: get_u64(fields.end_line) as u32,
        kind: chunk_kind_from_str(&get_text(fields.kind)),
        symbols,
        references,
        imports,
        conformances,
        is_type_declaration: get_u64(fields.is_type_declaration) != 0,
        signature: get_opt_text(fields.signature),
        doc_comment: get_opt_text(fields.doc_comment),
        breadcrumb: get_opt_text(fields.breadcrumb),
        language: get_text(fields.language),
        token_count: get_u64(fields.token_count) as u32,
        content_hash: get_text(fields.content_hash),
        content: get_text(fields.content),
        generated_description: get_opt_text(fields.generated_description),
    })
}

/// Side tables that don't need full-text search: `files`, `conformances`
/// (protocol_name index), and the config snapshot. Persisted as JSON next
/// to the tantivy index directory, mutated only from within the actor
/// thread so no additional locking is required.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SideTables {
    files: HashMap<String, FileRecord>,
    conformance_index: HashMap<String, Vec<String>>,
    config: Option<IndexConfigSnapshot>,
}

impl SideTables {
    fn load(path: &Path) -> CoreResult<Self> {
        if path.exists() {
            let bytes = std::fs::read(path)?;
            Ok(serde_json::from_slice(&bytes).unwrap_or_default())
        } else {
            Ok(SideTables::default())
        }
    }

    fn save(&self, path: &Path) -> CoreResult<()> {
        let bytes = serde_json::to_vec_pretty(self).map_err(|e| CoreError::StoreIoError(e.to_string()))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

struct Inner {
    index: Index,
    writer: IndexWriter,
    reader: IndexReader,
    fields: Fields,
    snippet_index: Index,
    snippet_writer: IndexWriter,
    snippet_reader: IndexReader,
    snippet_fields: SnippetFields,
    side_tables: SideTables,
    side_path: PathBuf,
}

impl Inner {
    fn open(dir: &Path) -> CoreResult<Self> {
        std::fs::create_dir_all(dir)?;
        let (schema, fields) = build_schema();
        let index = if dir.join("meta.json").exists() {
            Index::open_in_dir(dir)?
        } else {
            Index::create_in_dir(dir, schema)?
        };
        let writer: IndexWriter = index.writer(64_000_000)?;
        let reader = index.reader()?;

        let snippets_dir = dir.join("info_snippets");
        std::fs::create_dir_all(&snippets_dir)?;
        let (snippet_schema, snippet_fields) = build_snippet_schema();
        let snippet_index = if snippets_dir.join("meta.json").exists() {
            Index::open_in_dir(&snippets_dir)?
        } else {
            Index::create_in_dir(&snippets_dir, snippet_schema)?
        };
        let snippet_writer: IndexWriter = snippet_index.writer(32_000_000)?;
        let snippet_reader = snippet_index.reader()?;

        let side_path = dir.join("side_tables.json");
        let side_tables = SideTables::load(&side_path)?;
        Ok(Inner {
            index,
            writer,
            reader,
            fields,
            snippet_index,
            snippet_writer,
            snippet_reader,
            snippet_fields,
            side_tables,
            side_path,
        })
    }

    fn insert_chunks(&mut self, chunks: &[Chunk]) -> CoreResult<()> {
        for chunk in chunks {
            let doc = chunk_to_doc(&self.fields, chunk);
            self.writer.add_document(doc)?;
        }
        self.writer.commit()?;
        self.reader.reload()?;
        for chunk in chunks {
            self.record_conformances(chunk)?;
        }
        Ok(())
    }

    fn insert_snippets(&mut self, snippets: &[InfoSnippet]) -> CoreResult<()> {
        for snippet in snippets {
            let doc = snippet_to_doc(&self.snippet_fields, snippet);
            self.snippet_writer.add_document(doc)?;
        }
        self.snippet_writer.commit()?;
        self.snippet_reader.reload()?;
        Ok(())
    }

    fn search_snippets(&self, query: &PreparedQuery, limit: usize) -> CoreResult<Vec<(InfoSnippet, f32)>> {
        let searcher = self.snippet_reader.searcher();
        let tantivy_query = query.to_snippet_query(&self.snippet_fields);
        let hits = searcher.search(&tantivy_query, &TopDocs::with_limit(limit))?;
        let mut out = Vec::with_capacity(hits.len());
        for (score, addr) in hits {
            let doc: tantivy::TantivyDocument = searcher.doc(addr)?;
            if let Some(snippet) = doc_to_snippet(&self.snippet_fields, &doc) {
                out.push((snippet, score));
            }
        }
        Ok(out)
    }

    fn delete_snippets_for_path(&mut self, path: &str) -> CoreResult<()> {
        let term = Term::from_field_text(self.snippet_fields.path, path);
        self.snippet_writer.delete_term(term);
        self.snippet_writer.commit()?;
        self.snippet_reader.reload()?;
        Ok(())
    }

    /// Every chunk currently stored, for whole-index operations
    /// (convention mining, cross-repo import resolution) that need to see
    /// the full corpus rather than a path- or id-scoped slice.
    fn all_chunks(&self) -> CoreResult<Vec<Chunk>> {
        let searcher = self.reader.searcher();
        let query = tantivy::query::AllQuery;
        let hits = searcher.search(&query, &TopDocs::with_limit(1_000_000))?;
        let mut out = Vec::with_capacity(hits.len());
        for (_, addr) in hits {
            let doc: tantivy::TantivyDocument = searcher.doc(addr)?;
            if let Some(chunk) = doc_to_chunk(&self.fields, &doc) {
                out.push(chunk);
            }
        }
        Ok(out)
    }

    fn delete_chunks_for_path(&mut self, path: &str) -> CoreResult<()> {
        let removed_ids: std::collections::HashSet<String> = self
            .get_chunks_by_path(path)?
            .into_iter()
            .map(|c| c.id)
            .collect();

        let term = Term::from_field_text(self.fields.path, path);
        self.writer.delete_term(term);
        self.writer.commit()?;
        self.reader.reload()?;
        self.side_tables
            .conformance_index
            .retain(|_, ids| {
                ids.retain(|id| !removed_ids.contains(id));
                !ids.is_empty()
            });
        self.side_tables.save(&self.side_path)?;
        self.delete_snippets_for_path(path)?;
        Ok(())
    }

    fn get_chunks_by_ids(&self, ids: &[String]) -> CoreResult<HashMap<String, Chunk>> {
        let searcher = self.reader.searcher();
        let mut out = HashMap::new();
        for id in ids {
            let term = Term::from_field_text(self.fields.id, id);
            let query = TermQuery::new(term, IndexRecordOption::Basic);
            let hits = searcher.search(&query, &TopDocs::with_limit(1))?;
            if let Some((_, addr)) = hits.into_iter().next() {
                let doc: tantivy::TantivyDocument = searcher.doc(addr)?;
                if let Some(chunk) = doc_to_chunk(&self.fields, &doc) {
                    out.insert(id.clone(), chunk);
                }
            }
        }
        Ok(out)
    }

    fn get_chunks_by_path(&self, path: &str) -> CoreResult<Vec<Chunk>> {
        let searcher = self.reader.searcher();
        let term = Term::from_field_text(self.fields.path, path);
        let query = TermQuery::new(term, IndexRecordOption::Basic);
        let hits = searcher.search(&query, &TopDocs::with_limit(10_000))?;
        let mut out = Vec::with_capacity(hits.len());
        for (_, addr) in hits {
            let doc: tantivy::TantivyDocument = searcher.doc(addr)?;
            if let Some(chunk) = doc_to_chunk(&self.fields, &doc) {
                out.push(chunk);
            }
        }
        Ok(out)
    }

    fn remove_file_record(&mut self, path: &str) -> CoreResult<()> {
        self.side_tables.files.remove(path);
        self.side_tables.save(&self.side_path)
    }

    /// tantivy's own BM25 scorer is natively higher-is-better; the score
    /// returned here needs no sign flip, so the keyword retriever can use
    /// it directly.
    fn search_fts(&self, query: &PreparedQuery, limit: usize) -> CoreResult<Vec<(Chunk, f32)>> {
        let searcher = self.reader.searcher();
        let tantivy_query = query.to_tantivy_query(&self.fields);
        let hits = searcher.search(&tantivy_query, &TopDocs::with_limit(limit))?;
        let mut out = Vec::with_capacity(hits.len());
        for (score, addr) in hits {
            let doc: tantivy::TantivyDocument = searcher.doc(addr)?;
            if let Some(chunk) = doc_to_chunk(&self.fields, &doc) {
                out.push((chunk, score));
            }
        }
        Ok(out)
    }

    fn get_file_hash(&self, path: &str) -> Option<String> {
        self.side_tables.files.get(path).map(|r| r.content_hash.clone())
    }

    fn set_file_record(&mut self, record: FileRecord) -> CoreResult<()> {
        self.side_tables.files.insert(record.path.clone(), record);
        self.side_tables.save(&self.side_path)
    }

    fn count_term(&self, term: &str) -> CoreResult<u64> {
        let searcher = self.reader.searcher();
        // Symbols-column doc frequency: a more precise rarity signal for
        // identifier-style queries than content-field frequency, which
        // would count prose mentions too.
        let t = Term::from_field_text(self.fields.symbols_text, &term.to_ascii_lowercase());
        let mut total = 0u64;
        for reader in searcher.segment_readers() {
            if let Some(inv) = reader.inverted_index(self.fields.symbols_text).ok() {
                if let Ok(Some(info)) = inv.get_term_info(&t) {
                    total += info.doc_freq as u64;
                }
            }
        }
        Ok(total)
    }

    fn set_config(&mut self, config: IndexConfigSnapshot) -> CoreResult<()> {
        self.side_tables.config = Some(config);
        self.side_tables.save(&self.side_path)
    }

    fn get_config(&self) -> Option<IndexConfigSnapshot> {
        self.side_tables.config.clone()
    }

    fn record_conformances(&mut self, chunk: &Chunk) -> CoreResult<()> {
        for protocol in &chunk.conformances {
            let entry = self
                .side_tables
                .conformance_index
                .entry(protocol.clone())
                .or_default();
            if !entry.contains(&chunk.id) {
                entry.push(chunk.id.clone());
            }
        }
        self.side_tables.save(&self.side_path)
    }
}

/// A single term of a prepared FTS query: exact-phrase for CamelCase
/// identifiers, prefix for longer generic terms, verbatim for short terms.
#[derive(Debug, Clone)]
enum PreparedTerm {
    ExactPhrase(String),
    Prefix(String),
    Verbatim(String),
}

#[derive(Debug, Clone, Default)]
pub struct PreparedQuery {
    terms: Vec<PreparedTerm>,
}

const FTS_METACHARS: &[char] = &['"', '*', '(', ')', ':', '^', '~', '\'', '\\'];

/// Query preparation: split on whitespace, strip FTS metacharacters,
/// CamelCase terms (≥3 chars, mixed case, no spaces) become exact
/// phrases, other terms ≥3 chars become quoted prefixes, short terms are
/// matched verbatim. Terms are implicitly ANDed.
pub fn prepare_query(query: &str) -> PreparedQuery {
    let terms = query
        .split_whitespace()
        .map(|raw| raw.chars().filter(|c| !FTS_METACHARS.contains(c)).collect::<String>())
        .filter(|t| !t.is_empty())
        .map(|t| {
            if crate::fusion::is_camel_case(&t) {
                PreparedTerm::ExactPhrase(t)
            } else if t.chars().count() >= 3 {
                PreparedTerm::Prefix(t)
            } else {
                PreparedTerm::Verbatim(t)
            }
        })
        .collect();
    PreparedQuery { terms }
}

impl PreparedQuery {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    fn to_tantivy_query(&self, fields: &Fields) -> Box<dyn Query> {
        let fts_fields = [
            fields.content,
            fields.symbols_text,
            fields.doc_comment,
            fields.signature,
            fields.breadcrumb,
            fields.generated_description,
            fields.conformances_text,
        ];

        let mut must_clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for term in &self.terms {
            let lowered = match term {
                PreparedTerm::ExactPhrase(t) | PreparedTerm::Prefix(t) | PreparedTerm::Verbatim(t) => {
                    t.to_ascii_lowercase()
                }
            };
            let mut field_clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
            for field in fts_fields {
                let q: Box<dyn Query> = match term {
                    PreparedTerm::Prefix(_) => {
                        let pattern = format!("{}.*", regex_escape(&lowered));
                        match RegexQuery::from_pattern(&pattern, field) {
                            Ok(q) => Box::new(q),
                            Err(_) => Box::new(TermQuery::new(
                                Term::from_field_text(field, &lowered),
                                IndexRecordOption::WithFreqsAndPositions,
                            )),
                        }
                    }
                    PreparedTerm::ExactPhrase(_) | PreparedTerm::Verbatim(_) => Box::new(TermQuery::new(
                        Term::from_field_text(field, &lowered),
                        IndexRecordOption::WithFreqsAndPositions,
                    )),
                };
                field_clauses.push((Occur::Should, q));
            }
            must_clauses.push((Occur::Must, Box::new(BooleanQuery::new(field_clauses))));
        }

        if must_clauses.is_empty() {
            // Matches nothing; empty query is handled one layer up.
            Box::new(BooleanQuery::new(vec![]))
        } else {
            Box::new(BooleanQuery::new(must_clauses))
        }
    }

    fn to_snippet_query(&self, fields: &SnippetFields) -> Box<dyn Query> {
        let fts_fields = [fields.content, fields.breadcrumb];

        let mut must_clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for term in &self.terms {
            let lowered = match term {
                PreparedTerm::ExactPhrase(t) | PreparedTerm::Prefix(t) | PreparedTerm::Verbatim(t) => {
                    t.to_ascii_lowercase()
                }
            };
            let mut field_clauses: Vec<(Occur, Box<dyn Query>)> = Vec::new();
            for field in fts_fields {
                let q: Box<dyn Query> = match term {
                    PreparedTerm::Prefix(_) => {
                        let pattern = format!("{}.*", regex_escape(&lowered));
                        match RegexQuery::from_pattern(&pattern, field) {
                            Ok(q) => Box::new(q),
                            Err(_) => Box::new(TermQuery::new(
                                Term::from_field_text(field, &lowered),
                                IndexRecordOption::WithFreqsAndPositions,
                            )),
                        }
                    }
                    PreparedTerm::ExactPhrase(_) | PreparedTerm::Verbatim(_) => Box::new(TermQuery::new(
                        Term::from_field_text(field, &lowered),
                        IndexRecordOption::WithFreqsAndPositions,
                    )),
                };
                field_clauses.push((Occur::Should, q));
            }
            must_clauses.push((Occur::Must, Box::new(BooleanQuery::new(field_clauses))));
        }

        if must_clauses.is_empty() {
            Box::new(BooleanQuery::new(vec![]))
        } else {
            Box::new(BooleanQuery::new(must_clauses))
        }
    }
}

fn regex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.+*?()|[]{}^$".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

enum Request {
    InsertChunks(Vec<Chunk>, mpsc::Sender<CoreResult<()>>),
    DeleteChunksForPath(String, mpsc::Sender<CoreResult<()>>),
    GetChunksByIds(Vec<String>, mpsc::Sender<CoreResult<HashMap<String, Chunk>>>),
    GetChunksByPath(String, mpsc::Sender<CoreResult<Vec<Chunk>>>),
    RemoveFileRecord(String, mpsc::Sender<CoreResult<()>>),
    SearchFts(PreparedQuery, usize, mpsc::Sender<CoreResult<Vec<(Chunk, f32)>>>),
    GetFileHash(String, mpsc::Sender<Option<String>>),
    SetFileRecord(FileRecord, mpsc::Sender<CoreResult<()>>),
    CountTerm(String, mpsc::Sender<CoreResult<u64>>),
    SetConfig(IndexConfigSnapshot, mpsc::Sender<CoreResult<()>>),
    GetConfig(mpsc::Sender<Option<IndexConfigSnapshot>>),
    InsertSnippets(Vec<InfoSnippet>, mpsc::Sender<CoreResult<()>>),
    SearchSnippets(PreparedQuery, usize, mpsc::Sender<CoreResult<Vec<(InfoSnippet, f32)>>>),
    AllChunks(mpsc::Sender<CoreResult<Vec<Chunk>>>),
    Shutdown,
}

/// Public handle to the actor. Cloning the handle is cheap (it's just a
/// channel sender); the actor thread itself owns all tantivy state.
#[derive(Clone)]
pub struct LexicalStore {
    tx: mpsc::Sender<Request>,
}

impl LexicalStore {
    pub fn open(dir: impl AsRef<Path>) -> CoreResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        let mut inner = Inner::open(&dir)?;
        let (tx, rx) = mpsc::channel::<Request>();
        thread::Builder::new()
            .name("codegrove-lexical-store".into())
            .spawn(move || {
                while let Ok(req) = rx.recv() {
                    match req {
                        Request::InsertChunks(chunks, reply) => {
                            let _ = reply.send(inner.insert_chunks(&chunks));
                        }
                        Request::DeleteChunksForPath(path, reply) => {
                            let _ = reply.send(inner.delete_chunks_for_path(&path));
                        }
                        Request::GetChunksByIds(ids, reply) => {
                            let _ = reply.send(inner.get_chunks_by_ids(&ids));
                        }
                        Request::GetChunksByPath(path, reply) => {
                            let _ = reply.send(inner.get_chunks_by_path(&path));
                        }
                        Request::RemoveFileRecord(path, reply) => {
                            let _ = reply.send(inner.remove_file_record(&path));
                        }
                        Request::SearchFts(q, limit, reply) => {
                            let _ = reply.send(inner.search_fts(&q, limit));
                        }
                        Request::GetFileHash(path, reply) => {
                            let _ = reply.send(inner.get_file_hash(&path));
                        }
                        Request::SetFileRecord(record, reply) => {
                            let _ = reply.send(inner.set_file_record(record));
                        }
                        Request::CountTerm(term, reply) => {
                            let _ = reply.send(inner.count_term(&term));
                        }
                        Request::SetConfig(cfg, reply) => {
                            let _ = reply.send(inner.set_config(cfg));
                        }
                        Request::GetConfig(reply) => {
                            let _ = reply.send(inner.get_config());
                        }
                        Request::InsertSnippets(snippets, reply) => {
                            let _ = reply.send(inner.insert_snippets(&snippets));
                        }
                        Request::SearchSnippets(q, limit, reply) => {
                            let _ = reply.send(inner.search_snippets(&q, limit));
                        }
                        Request::AllChunks(reply) => {
                            let _ = reply.send(inner.all_chunks());
                        }
                        Request::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn lexical store actor thread");
        Ok(LexicalStore { tx })
    }

    fn call<T>(&self, make: impl FnOnce(mpsc::Sender<T>) -> Request) -> T {
        let (reply_tx, reply_rx) = mpsc::channel();
        let req = make(reply_tx);
        self.tx.send(req).expect("lexical store actor has shut down");
        reply_rx.recv().expect("lexical store actor dropped reply sender")
    }

    pub fn insert_chunks(&self, chunks: Vec<Chunk>) -> CoreResult<()> {
        self.call(|tx| Request::InsertChunks(chunks, tx))
    }

    pub fn delete_chunks_for_path(&self, path: &str) -> CoreResult<()> {
        self.call(|tx| Request::DeleteChunksForPath(path.to_string(), tx))
    }

    pub fn get_chunks_by_ids(&self, ids: &[String]) -> CoreResult<HashMap<String, Chunk>> {
        self.call(|tx| Request::GetChunksByIds(ids.to_vec(), tx))
    }

    pub fn get_chunks_by_path(&self, path: &str) -> CoreResult<Vec<Chunk>> {
        self.call(|tx| Request::GetChunksByPath(path.to_string(), tx))
    }

    pub fn remove_file_record(&self, path: &str) -> CoreResult<()> {
        self.call(|tx| Request::RemoveFileRecord(path.to_string(), tx))
    }

    pub fn search_fts(&self, query: &PreparedQuery, limit: usize) -> CoreResult<Vec<(Chunk, f32)>> {
        self.call(|tx| Request::SearchFts(query.clone(), limit, tx))
    }

    pub fn get_file_hash(&self, path: &str) -> Option<String> {
        self.call(|tx| Request::GetFileHash(path.to_string(), tx))
    }

    pub fn set_file_record(&self, record: FileRecord) -> CoreResult<()> {
        self.call(|tx| Request::SetFileRecord(record, tx))
    }

    pub fn count_term(&self, term: &str) -> CoreResult<u64> {
        self.call(|tx| Request::CountTerm(term.to_string(), tx))
    }

    pub fn set_config(&self, config: IndexConfigSnapshot) -> CoreResult<()> {
        self.call(|tx| Request::SetConfig(config, tx))
    }

    pub fn get_config(&self) -> Option<IndexConfigSnapshot> {
        self.call(Request::GetConfig)
    }

    pub fn insert_snippets(&self, snippets: Vec<InfoSnippet>) -> CoreResult<()> {
        self.call(|tx| Request::InsertSnippets(snippets, tx))
    }

    pub fn search_snippets(&self, query: &PreparedQuery, limit: usize) -> CoreResult<Vec<(InfoSnippet, f32)>> {
        self.call(|tx| Request::SearchSnippets(query.clone(), limit, tx))
    }

    /// Every chunk currently stored. Used by whole-corpus operations
    /// (convention mining, import-graph construction) that have no
    /// narrower scope to query by.
    pub fn all_chunks(&self) -> CoreResult<Vec<Chunk>> {
        self.call(Request::AllChunks)
    }

    pub fn close(self) {
        let _ = self.tx.send(Request::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkKind;

    fn chunk(path: &str, content: &str, symbols: &[&str]) -> Chunk {
        let mut c = Chunk::new(path, 1, 5, ChunkKind::Function, content, "swift");
        c.symbols = symbols.iter().map(|s| s.to_string()).collect();
        c
    }

    #[test]
    fn insert_and_get_by_id_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LexicalStore::open(dir.path()).unwrap();
        let c = chunk("a.swift", "func add() {}", &["add"]);
        store.insert_chunks(vec![c.clone()]).unwrap();
        let found = store.get_chunks_by_ids(&[c.id.clone()]).unwrap();
        assert_eq!(found.get(&c.id).unwrap().content, c.content);
    }

    #[test]
    fn delete_chunks_for_path_removes_all() {
        let dir = tempfile::tempdir().unwrap();
        let store = LexicalStore::open(dir.path()).unwrap();
        let c1 = chunk("a.swift", "func add() {}", &["add"]);
        let c2 = chunk("a.swift", "func sub() {}", &["sub"]);
        store.insert_chunks(vec![c1.clone(), c2.clone()]).unwrap();
        store.delete_chunks_for_path("a.swift").unwrap();
        let found = store.get_chunks_by_ids(&[c1.id, c2.id]).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn camel_case_query_does_not_match_substring() {
        let dir = tempfile::tempdir().unwrap();
        let store = LexicalStore::open(dir.path()).unwrap();
        let rare = chunk(
            "err.swift",
            "enum USearchError { case capacityExhausted }",
            &["USearchError"],
        );
        store.insert_chunks(vec![rare.clone()]).unwrap();
        for i in 0..5 {
            let c = chunk(&format!("f{i}.swift"), "// mentions Search here", &[]);
            store.insert_chunks(vec![c]).unwrap();
        }
        let q = prepare_query("USearchError");
        let results = store.search_fts(&q, 5).unwrap();
        assert!(results.iter().any(|(c, _)| c.id == rare.id));
    }

    #[test]
    fn get_chunks_by_path_and_remove_file_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = LexicalStore::open(dir.path()).unwrap();
        let c1 = chunk("a.swift", "func add() {}", &["add"]);
        let c2 = chunk("a.swift", "func sub() {}", &["sub"]);
        let c3 = chunk("b.swift", "func mul() {}", &["mul"]);
        store.insert_chunks(vec![c1, c2, c3]).unwrap();

        let found = store.get_chunks_by_path("a.swift").unwrap();
        assert_eq!(found.len(), 2);

        store
            .set_file_record(FileRecord {
                path: "a.swift".into(),
                content_hash: "abc".into(),
                indexed_at: chrono::Utc::now(),
                chunk_count: 2,
            })
            .unwrap();
        store.remove_file_record("a.swift").unwrap();
        assert!(store.get_file_hash("a.swift").is_none());
    }

    #[test]
    fn file_hash_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LexicalStore::open(dir.path()).unwrap();
        assert!(store.get_file_hash("a.swift").is_none());
        store
            .set_file_record(FileRecord {
                path: "a.swift".into(),
                content_hash: "abc123".into(),
                indexed_at: chrono::Utc::now(),
                chunk_count: 2,
            })
            .unwrap();
        assert_eq!(store.get_file_hash("a.swift").as_deref(), Some("abc123"));
    }

    #[test]
    fn snippet_insert_and_search_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LexicalStore::open(dir.path()).unwrap();
        let mut s = InfoSnippet::new(
            "README.md",
            1,
            4,
            crate::chunk::SnippetKind::MarkdownSection,
            "Configuring the retry policy for outbound requests.",
        );
        s.breadcrumb = Some("README.md > Configuration > Retries".to_string());
        store.insert_snippets(vec![s.clone()]).unwrap();

        let q = prepare_query("retry policy");
        let results = store.search_snippets(&q, 5).unwrap();
        assert!(results.iter().any(|(found, _)| found.id == s.id));
    }

    #[test]
    fn deleting_chunks_for_path_cascades_to_snippets() {
        let dir = tempfile::tempdir().unwrap();
        let store = LexicalStore::open(dir.path()).unwrap();
        let c = chunk("notes.md", "func add() {}", &["add"]);
        let s = InfoSnippet::new(
            "notes.md",
            1,
            2,
            crate::chunk::SnippetKind::Documentation,
            "Explains the retry backoff schedule in detail.",
        );
        store.insert_chunks(vec![c]).unwrap();
        store.insert_snippets(vec![s.clone()]).unwrap();

        store.delete_chunks_for_path("notes.md").unwrap();

        let q = prepare_query("retry backoff");
        let results = store.search_snippets(&q, 5).unwrap();
        assert!(results.iter().all(|(found, _)| found.id != s.id));
    }

    #[test]
    fn conformance_index_is_populated_and_purged_on_delete() {
        let dir = tempfile::tempdir().unwrap();
        let mut inner = Inner::open(dir.path()).unwrap();
        let mut c = chunk("a.swift", "class Foo: Bar {}", &["Foo"]);
        c.conformances = vec!["Bar".to_string()];
        inner.insert_chunks(&[c.clone()]).unwrap();
        assert_eq!(
            inner.side_tables.conformance_index.get("Bar"),
            Some(&vec![c.id.clone()])
        );

        inner.delete_chunks_for_path("a.swift").unwrap();
        assert!(inner.side_tables.conformance_index.get("Bar").is_none());
    }

    #[test]
    fn all_chunks_returns_every_indexed_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = LexicalStore::open(dir.path()).unwrap();
        let c1 = chunk("a.swift", "func add() {}", &["add"]);
        let c2 = chunk("b.swift", "func sub() {}", &["sub"]);
        store.insert_chunks(vec![c1.clone(), c2.clone()]).unwrap();

        let mut ids: Vec<String> = store.all_chunks().unwrap().into_iter().map(|c| c.id).collect();
        ids.sort();
        let mut expected = vec![c1.id, c2.id];
        expected.sort();
        assert_eq!(ids, expected);
    }
}
