//! Lexical reranking of vector-search candidates.
//!
//! Semantic search alone under-weights exact keyword matches (part
//! numbers, proper nouns), so the top-N vector candidates are rescored
//! with a TF-IDF relevance function that uses the candidate set itself as
//! the reference corpus. The set is small, so this costs nothing compared
//! to maintaining a second full index.
//!
//! The sort is stable: candidates with equal lexical scores keep their
//! vector-search order.

use std::collections::HashMap;

/// A retrieval candidate carrying enough context to rerank, cite, and
/// assemble the final answer context.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: i64,
    pub text: String,
    /// Cosine score from the vector index, kept for diagnostics.
    pub vector_score: f32,
}

/// Reorder `candidates` by TF-IDF relevance to `query`, descending.
pub fn rerank(query: &str, candidates: Vec<Candidate>) -> Vec<Candidate> {
    if candidates.len() < 2 {
        return candidates;
    }

    let query_terms = dedupe(tokenize(query));
    if query_terms.is_empty() {
        return candidates;
    }

    // Per-candidate term frequencies and lengths.
    let docs: Vec<(HashMap<String, usize>, usize)> = candidates
        .iter()
        .map(|c| {
            let tokens = tokenize(&c.text);
            let len = tokens.len();
            let mut counts = HashMap::new();
            for t in tokens {
                *counts.entry(t).or_insert(0usize) += 1;
            }
            (counts, len)
        })
        .collect();

    // Document frequency over the candidate set.
    let n = docs.len() as f64;
    let idf: HashMap<&str, f64> = query_terms
        .iter()
        .map(|term| {
            let df = docs.iter().filter(|(counts, _)| counts.contains_key(term)).count();
            (term.as_str(), (1.0 + n / (1.0 + df as f64)).ln())
        })
        .collect();

    let mut scored: Vec<(f64, Candidate)> = candidates
        .into_iter()
        .zip(docs.iter())
        .map(|(cand, (counts, len))| {
            let score = if *len == 0 {
                0.0
            } else {
                query_terms
                    .iter()
                    .map(|term| {
                        let tf = counts.get(term).copied().unwrap_or(0) as f64 / *len as f64;
                        tf * idf.get(term.as_str()).copied().unwrap_or(0.0)
                    })
                    .sum()
            };
            (score, cand)
        })
        .collect();

    // sort_by is stable: ties preserve the incoming (vector) order.
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    scored.into_iter().map(|(_, c)| c).collect()
}

/// Lowercased alphanumeric runs.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn dedupe(tokens: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokens.into_iter().filter(|t| seen.insert(t.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candidate(chunk_id: &str, text: &str, vector_score: f32) -> Candidate {
        Candidate {
            chunk_id: chunk_id.to_string(),
            document_id: "d1".to_string(),
            ordinal: 0,
            text: text.to_string(),
            vector_score,
        }
    }

    #[test]
    fn test_exact_text_ranks_first() {
        let exact = "part number XJ-900 torque limits";
        let candidates = vec![
            make_candidate("c1", "general maintenance schedule for all parts", 0.9),
            make_candidate("c2", exact, 0.8),
            make_candidate("c3", "torque wrench calibration procedure overview", 0.7),
        ];

        let ranked = rerank(exact, candidates);
        assert_eq!(ranked[0].chunk_id, "c2");
    }

    #[test]
    fn test_ties_preserve_vector_order() {
        // No candidate contains any query term: all scores are 0.
        let candidates = vec![
            make_candidate("c1", "alpha", 0.9),
            make_candidate("c2", "beta", 0.8),
            make_candidate("c3", "gamma", 0.7),
        ];

        let ranked = rerank("zzz qqq", candidates);
        let ids: Vec<&str> = ranked.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[test]
    fn test_keyword_match_beats_unrelated() {
        let candidates = vec![
            make_candidate("c1", "nothing relevant here at all", 0.95),
            make_candidate("c2", "the flash point of acetone is minus twenty", 0.4),
        ];

        let ranked = rerank("flash point acetone", candidates);
        assert_eq!(ranked[0].chunk_id, "c2");
    }

    #[test]
    fn test_empty_query_keeps_order() {
        let candidates = vec![
            make_candidate("c1", "alpha", 0.9),
            make_candidate("c2", "beta", 0.8),
        ];
        let ranked = rerank("  !!! ", candidates);
        assert_eq!(ranked[0].chunk_id, "c1");
    }

    #[test]
    fn test_single_candidate_passthrough() {
        let candidates = vec![make_candidate("c1", "alpha", 0.9)];
        let ranked = rerank("alpha", candidates);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].chunk_id, "c1");
    }

    #[test]
    fn test_tokenize_splits_on_punctuation() {
        let tokens = tokenize("Part-Number: XJ/900!");
        assert_eq!(tokens, vec!["part", "number", "xj", "900"]);
    }
}
