use std::collections::BTreeMap;

const STOP_WORDS: [&str; 33] = [
    "a", "an", "and", "are", "as", "at", "be", "by", "do", "does", "for", "from", "how", "in",
    "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when", "where",
    "which", "who", "why", "will", "with", "can",
];

/// BM25 term-frequency saturation.
pub const BM25_K1: f64 = 1.2;
/// BM25 length normalization.
pub const BM25_B: f64 = 0.75;

/// Lowercased alphanumeric terms with stop words and single characters removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() > 1)
        .map(str::to_lowercase)
        .filter(|token| !STOP_WORDS.contains(&token.as_str()))
        .collect()
}

pub fn term_frequencies(terms: &[String]) -> BTreeMap<String, u32> {
    let mut frequencies = BTreeMap::new();
    for term in terms {
        *frequencies.entry(term.clone()).or_insert(0) += 1;
    }
    frequencies
}

/// Corpus-level statistics a BM25 score needs.
#[derive(Debug, Clone, Copy)]
pub struct Bm25Stats {
    pub document_count: usize,
    pub average_length: f64,
}

pub fn idf(stats: Bm25Stats, document_frequency: usize) -> f64 {
    let n = stats.document_count as f64;
    let df = document_frequency as f64;
    ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
}

pub fn bm25_term(stats: Bm25Stats, idf: f64, term_frequency: u32, length: u32) -> f64 {
    if term_frequency == 0 {
        return 0.0;
    }
    let tf = f64::from(term_frequency);
    let average = stats.average_length.max(1.0);
    let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * f64::from(length) / average);
    idf * (tf * (BM25_K1 + 1.0)) / (tf + norm)
}
