//! Lexical scoring: tokenization and BM25 over a candidate pool.
//!
//! The retriever scores only the pool it already fetched (vector hits plus
//! keyword hits), so document frequencies come from that pool rather than
//! from the whole index.

use std::collections::{HashMap, HashSet};

const K1: f64 = 1.2;
const B: f64 = 0.75;

/// Lower-cased alphanumeric tokens (underscores kept, so `snake_case` stays whole).
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Distinct query terms, in first-seen order.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    tokenize(query)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// BM25 score of each document in `docs` against `query`.
///
/// Returns zeros when the query has no terms.
pub fn bm25_scores(query: &str, docs: &[&str]) -> Vec<f64> {
    let terms = query_terms(query);
    if terms.is_empty() || docs.is_empty() {
        return vec![0.0; docs.len()];
    }

    let tokenized: Vec<Vec<String>> = docs.iter().map(|d| tokenize(d)).collect();
    let n = docs.len() as f64;
    let avg_len = tokenized.iter().map(|t| t.len()).sum::<usize>() as f64 / n;

    let mut df: HashMap<&str, usize> = HashMap::new();
    for tokens in &tokenized {
        let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        for term in &terms {
            if unique.contains(term.as_str()) {
                *df.entry(term.as_str()).or_default() += 1;
            }
        }
    }

    tokenized
        .iter()
        .map(|tokens| {
            let len = tokens.len() as f64;
            let mut tf: HashMap<&str, usize> = HashMap::new();
            for t in tokens {
                *tf.entry(t.as_str()).or_default() += 1;
            }
            terms
                .iter()
                .map(|term| {
                    let f = *tf.get(term.as_str()).unwrap_or(&0) as f64;
                    if f == 0.0 {
                        return 0.0;
                    }
                    let d = *df.get(term.as_str()).unwrap_or(&0) as f64;
                    let idf = ((n - d + 0.5) / (d + 0.5) + 1.0).ln();
                    let norm = if avg_len > 0.0 { len / avg_len } else { 1.0 };
                    idf * (f * (K1 + 1.0)) / (f + K1 * (1.0 - B + B * norm))
                })
                .sum()
        })
        .collect()
}

/// Fraction of distinct query terms present in `text`.
pub fn term_overlap(terms: &[String], text: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let tokens: HashSet<String> = tokenize(text).into_iter().collect();
    let hits = terms.iter().filter(|t| tokens.contains(*t)).count();
    hits as f64 / terms.len() as f64
}
