//! Hybrid RRF fusion and re-ranking. Pure functions over ranked lists — no
//! I/O, no actor, deterministic given identical inputs.

use std::collections::HashMap;

use crate::chunk::Chunk;
use crate::config::SearchSettings;

/// One retriever's ranked hit before fusion.
#[derive(Debug, Clone)]
pub struct RankedHit {
    pub id: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct FusedEntry {
    pub id: String,
    pub score: f32,
    pub bm25_rank: Option<u32>,
    pub semantic_rank: Option<u32>,
    pub bm25_score: Option<f32>,
    pub semantic_score: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Bm25,
    Semantic,
    Hybrid,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Bm25 => "bm25",
            MatchKind::Semantic => "semantic",
            MatchKind::Hybrid => "hybrid",
        }
    }
}

impl FusedEntry {
    pub fn match_kind(&self) -> MatchKind {
        match (self.bm25_rank.is_some(), self.semantic_rank.is_some()) {
            (true, true) => MatchKind::Hybrid,
            (true, false) => MatchKind::Bm25,
            (false, true) => MatchKind::Semantic,
            (false, false) => MatchKind::Hybrid,
        }
    }
}

/// Reciprocal-rank + normalized-score hybrid fusion.
///
/// `k` and `alpha` are the RRF rank constant and rank/score blend factor;
/// `w_bm25`/`w_sem` are the two lists' weights (normally `1 - semantic_weight`
/// and `semantic_weight`).
pub fn fuse(
    bm25: &[RankedHit],
    semantic: &[RankedHit],
    w_bm25: f32,
    w_sem: f32,
    k: u32,
    alpha: f32,
) -> Vec<FusedEntry> {
    let mut fused: HashMap<String, FusedEntry> = HashMap::new();

    accumulate(bm25, w_bm25, k, alpha, &mut fused, true);
    accumulate(semantic, w_sem, k, alpha, &mut fused, false);

    let mut out: Vec<FusedEntry> = fused.into_values().collect();
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| rank_sum(a).cmp(&rank_sum(b)))
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}

fn rank_sum(e: &FusedEntry) -> u32 {
    e.bm25_rank.unwrap_or(0) + e.semantic_rank.unwrap_or(0)
}

fn accumulate(
    list: &[RankedHit],
    weight: f32,
    k: u32,
    alpha: f32,
    fused: &mut HashMap<String, FusedEntry>,
    is_bm25: bool,
) {
    if list.is_empty() {
        return;
    }
    let max_score = list
        .iter()
        .map(|h| h.score)
        .fold(f32::MIN, f32::max)
        .max(0.0);
    let max_score = if max_score > 0.0 { max_score } else { 1.0 };

    for (idx, hit) in list.iter().enumerate() {
        let rank = (idx + 1) as u32;
        let rrf = 1.0 / (k as f32 + rank as f32);
        let norm = hit.score / max_score;
        let hybrid = alpha * rrf + (1.0 - alpha) * norm;
        let contribution = weight * hybrid;

        let entry = fused.entry(hit.id.clone()).or_insert_with(|| FusedEntry {
            id: hit.id.clone(),
            score: 0.0,
            bm25_rank: None,
            semantic_rank: None,
            bm25_score: None,
            semantic_score: None,
        });
        entry.score += contribution;
        if is_bm25 {
            entry.bm25_rank = Some(rank);
            entry.bm25_score = Some(hit.score);
        } else {
            entry.semantic_rank = Some(rank);
            entry.semantic_score = Some(hit.score);
        }
    }
}

/// Detected intent from a free-text query.
#[derive(Debug, Clone, Default)]
pub struct QueryIntent {
    /// Extracted target type for "what implements X" style queries.
    pub conformance_target: Option<String>,
    /// "how/what/where"-prefixed conceptual query.
    pub conceptual: bool,
    /// Any CamelCase token present verbatim in the query.
    pub camel_case_tokens: Vec<String>,
    /// Every query token (punctuation-trimmed), CamelCase or not — the
    /// rare-term exact-symbol boost applies to any of these, not just the
    /// CamelCase subset.
    pub all_tokens: Vec<String>,
}

const STANDARD_PROTOCOLS: &[&str] = &[
    "Comparable",
    "Equatable",
    "Hashable",
    "Codable",
    "Sendable",
    "CustomStringConvertible",
    "CustomDebugStringConvertible",
];

pub fn detect_intent(query: &str) -> QueryIntent {
    let lower = query.to_ascii_lowercase();
    let mut conformance_target = None;

    for marker in ["what implements ", "implementations of ", "conforms to "] {
        if let Some(pos) = lower.find(marker) {
            let tail = &query[pos + marker.len()..];
            conformance_target = last_capitalized_identifier(tail);
            if conformance_target.is_some() {
                break;
            }
        }
    }

    let conceptual = ["how", "what", "where"]
        .iter()
        .any(|p| lower.starts_with(p));

    let camel_case_tokens: Vec<String> = query
        .split_whitespace()
        .filter(|t| is_camel_case(t))
        .map(|t| t.to_string())
        .collect();

    let all_tokens: Vec<String> = query
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric() && c != '_').to_string())
        .filter(|t| !t.is_empty())
        .collect();

    QueryIntent {
        conformance_target,
        conceptual,
        camel_case_tokens,
        all_tokens,
    }
}

fn last_capitalized_identifier(text: &str) -> Option<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .filter(|t| t.chars().next().map(|c| c.is_uppercase()).unwrap_or(false))
        .next_back()
        .map(|s| s.to_string())
}

/// CamelCase identifier: ≥3 chars, contains both upper and lower, no spaces.
/// Shared with query preparation; reused here for boost detection.
pub fn is_camel_case(token: &str) -> bool {
    if token.len() < 3 || token.contains(' ') {
        return false;
    }
    let has_upper = token.chars().any(|c| c.is_uppercase());
    let has_lower = token.chars().any(|c| c.is_lowercase());
    has_upper && has_lower
}

/// Applies the multiplicative re-ranking boosts to already fused entries,
/// then re-sorts by the boosted score.
pub fn rerank(
    mut entries: Vec<FusedEntry>,
    chunks: &HashMap<String, Chunk>,
    intent: &QueryIntent,
    term_doc_freq: impl Fn(&str) -> u64,
    settings: &SearchSettings,
) -> Vec<FusedEntry> {
    for entry in &mut entries {
        let Some(chunk) = chunks.get(&entry.id) else {
            continue;
        };
        let mut factor = 1.0f32;

        if chunk.is_type_declaration {
            factor *= 1.5;
        }

        if let Some(target) = &intent.conformance_target {
            if chunk.conformances.iter().any(|c| c == target) {
                if chunk.is_type_declaration {
                    factor *= 3.0;
                } else {
                    factor *= 1.5;
                }
            }
            if chunk.kind == crate::chunk::ChunkKind::Protocol
                && chunk.primary_symbol() == Some(target.as_str())
            {
                factor *= 1.3;
            }
        }

        // Exact symbol (rare term) x2.5: applies to any query term,
        // case-sensitively, not just CamelCase ones.
        for token in &intent.all_tokens {
            let rare = term_doc_freq(token) < settings.rare_term_threshold;
            if rare && chunk.symbols.iter().any(|s| s == token) {
                factor *= 2.5;
            }
        }

        for token in &intent.camel_case_tokens {
            if contains_word(&chunk.content, token) || chunk.symbols.iter().any(|s| s == token) {
                factor *= 2.0;
            }
        }

        if chunk.path.contains("/Sources/") {
            factor *= settings.source_boost;
        }

        if chunk
            .signature
            .as_deref()
            .map(|s| s.trim_start().starts_with("public"))
            .unwrap_or(false)
        {
            factor *= settings.public_boost;
        }

        if intent.conceptual && chunk.kind == crate::chunk::ChunkKind::Extension {
            let demotes = chunk
                .conformances
                .iter()
                .any(|c| STANDARD_PROTOCOLS.contains(&c.as_str()));
            if demotes {
                factor *= 0.5;
            }
        }

        entry.score *= factor;
    }

    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| rank_sum(a).cmp(&rank_sum(b)))
            .then_with(|| a.id.cmp(&b.id))
    });
    entries
}

fn contains_word(haystack: &str, word: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|w| w == word)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f32) -> RankedHit {
        RankedHit {
            id: id.to_string(),
            score,
        }
    }

    #[test]
    fn degenerate_fusion_with_zero_semantic_weight_is_bm25_only_modulo_boosts() {
        let bm25 = vec![hit("A", 0.99), hit("B", 0.5)];
        let fused = fuse(&bm25, &[], 1.0, 0.0, 60, 0.7);
        assert_eq!(fused[0].id, "A");
        assert_eq!(fused[1].id, "B");
    }

    #[test]
    fn scenario_5_hybrid_fusion_sanity() {
        // BM25: [(A,0.99),(B,0.50)], vector: [(B,0.80),(C,0.60)]
        // k=60, alpha=0.7, w_sem=0.7 (w_bm25 = 0.3)
        let bm25 = vec![hit("A", 0.99), hit("B", 0.50)];
        let sem = vec![hit("B", 0.80), hit("C", 0.60)];
        let fused = fuse(&bm25, &sem, 0.3, 0.7, 60, 0.7);

        let by_id: HashMap<String, f32> = fused.iter().map(|e| (e.id.clone(), e.score)).collect();

        assert!((by_id["A"] - 0.0934).abs() < 0.01, "A={}", by_id["A"]);
        assert!((by_id["B"] - 0.2664).abs() < 0.01, "B={}", by_id["B"]);
        assert!((by_id["C"] - 0.1657).abs() < 0.01, "C={}", by_id["C"]);

        let order: Vec<&str> = fused.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(order, vec!["B", "C", "A"]);
    }

    #[test]
    fn camel_case_detection() {
        assert!(is_camel_case("USearchError"));
        assert!(is_camel_case("capacityExhausted"));
        assert!(!is_camel_case("search"));
        assert!(!is_camel_case("ab"));
    }

    #[test]
    fn intent_extracts_conformance_target() {
        let intent = detect_intent("what implements ChunkStore");
        assert_eq!(intent.conformance_target.as_deref(), Some("ChunkStore"));
    }

    #[test]
    fn intent_detects_conceptual_prefix() {
        let intent = detect_intent("how does caching work");
        assert!(intent.conceptual);
    }

    #[test]
    fn rare_term_boost_applies_to_non_camel_case_symbol() {
        use crate::chunk::{Chunk, ChunkKind};

        let intent = detect_intent("parseconfig");
        assert!(intent.camel_case_tokens.is_empty());
        assert_eq!(intent.all_tokens, vec!["parseconfig".to_string()]);

        let mut chunk = Chunk::new("a.swift", 1, 2, ChunkKind::Function, "func parseconfig() {}", "swift");
        chunk.symbols = vec!["parseconfig".to_string()];
        let mut chunks = HashMap::new();
        chunks.insert(chunk.id.clone(), chunk.clone());

        let entries = vec![FusedEntry {
            id: chunk.id.clone(),
            score: 1.0,
            bm25_rank: Some(1),
            semantic_rank: None,
            bm25_score: Some(1.0),
            semantic_score: None,
        }];

        let settings = SearchSettings {
            limit: 20,
            semantic_weight: 0.7,
            rrf_k: 60,
            rrf_alpha: 0.7,
            over_fetch: 3,
            rare_term_threshold: 10,
            source_boost: 1.1,
            public_boost: 1.1,
        };

        let reranked = rerank(entries, &chunks, &intent, |_| 1, &settings);
        assert!((reranked[0].score - 2.5).abs() < 0.001);
    }
}
