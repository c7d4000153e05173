//! TF-IDF term weighting used as an internal scoring signal.
//!
//! Weights drift as the corpus grows, so nothing here is ever stored as a
//! clustering decision; the clusterer freezes the richness score it was given.

use std::collections::{BTreeMap, HashMap};

use adstack_core::{ModelVersion, VectorizationModelParams};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const CRATE_NAME: &str = "adstack-tfidf";

/// Lower-cased alphanumeric runs of at least two characters.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().nth(1).is_some())
        .map(str::to_lowercase)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermFrequency {
    counts: HashMap<String, u32>,
}

impl TermFrequency {
    pub fn from_text(text: &str) -> Self {
        let mut counts: HashMap<String, u32> = HashMap::new();
        for token in tokenize(text) {
            *counts.entry(token).or_default() += 1;
        }
        Self { counts }
    }

    pub fn get(&self, term: &str) -> u32 {
        self.counts.get(term).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    pub fn distinct(&self) -> usize {
        self.counts.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.counts.iter().map(|(term, count)| (term.as_str(), *count))
    }
}

/// Corpus-wide document counts per term. Partial counts merge additively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFrequency {
    documents: u64,
    counts: HashMap<String, u64>,
}

impl DocumentFrequency {
    pub fn add(&mut self, tf: &TermFrequency) {
        self.documents += 1;
        for (term, _) in tf.iter() {
            *self.counts.entry(term.to_string()).or_default() += 1;
        }
    }

    pub fn merge(mut self, other: Self) -> Self {
        self.documents += other.documents;
        for (term, count) in other.counts {
            *self.counts.entry(term).or_default() += count;
        }
        self
    }

    /// Accumulates a batch on the rayon pool: per-shard partial counts, then an additive reduce.
    pub fn from_batch(batch: &[TermFrequency]) -> Self {
        batch
            .par_iter()
            .fold(Self::default, |mut acc, tf| {
                acc.add(tf);
                acc
            })
            .reduce(Self::default, Self::merge)
    }

    pub fn documents(&self) -> u64 {
        self.documents
    }

    pub fn df(&self, term: &str) -> u64 {
        self.counts.get(term).copied().unwrap_or(0)
    }

    pub fn vocabulary(&self) -> usize {
        self.counts.len()
    }
}

/// `idf(t) = ln(N / df(t))` over the `vocabulary_size` most frequent terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdfTable {
    pub version: ModelVersion,
    pub corpus_size: u64,
    weights: HashMap<String, f64>,
}

impl IdfTable {
    pub fn build(df: &DocumentFrequency, params: &VectorizationModelParams) -> Self {
        let n = df.documents.max(1) as f64;
        let mut terms: Vec<(&String, u64)> = df.counts.iter().map(|(t, c)| (t, *c)).collect();
        terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        let weights = terms
            .into_iter()
            .take(params.vocabulary_size)
            .filter(|(_, count)| *count > 0)
            .map(|(term, count)| (term.clone(), (n / count as f64).ln()))
            .collect::<HashMap<_, _>>();

        info!(
            version = %params.version,
            corpus_size = df.documents,
            vocabulary = weights.len(),
            "built idf table"
        );
        Self {
            version: params.version,
            corpus_size: df.documents,
            weights,
        }
    }

    /// Zero for terms outside the vocabulary.
    pub fn idf(&self, term: &str) -> f64 {
        self.weights.get(term).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TfIdfScorer {
    table: IdfTable,
    drift: f64,
}

impl TfIdfScorer {
    pub fn new(table: IdfTable, drift: f64) -> Self {
        Self {
            table,
            drift: drift.max(0.0),
        }
    }

    pub fn table(&self) -> &IdfTable {
        &self.table
    }

    /// True when the table was built under another version or the corpus
    /// size moved more than the configured drift ratio since it was built.
    pub fn needs_rebuild(&self, corpus_size: u64, params: &VectorizationModelParams) -> bool {
        if self.table.version != params.version {
            return true;
        }
        let built = self.table.corpus_size;
        if built == 0 {
            return corpus_size > 0;
        }
        (corpus_size as f64 - built as f64).abs() / built as f64 > self.drift
    }

    pub fn weights(&self, tf: &TermFrequency) -> BTreeMap<String, f64> {
        tf.iter()
            .map(|(term, count)| (term.to_string(), count as f64 * self.table.idf(term)))
            .filter(|(_, weight)| *weight > 0.0)
            .collect()
    }

    /// Sum of `tf * idf` over the ad's terms; a content-richness proxy.
    pub fn richness(&self, tf: &TermFrequency) -> f64 {
        tf.iter()
            .map(|(term, count)| count as f64 * self.table.idf(term))
            .sum()
    }

    pub fn cosine(&self, a: &TermFrequency, b: &TermFrequency) -> f64 {
        let wa = self.weights(a);
        let wb = self.weights(b);
        let dot: f64 = wa
            .iter()
            .filter_map(|(term, x)| wb.get(term).map(|y| x * y))
            .sum();
        let norm_a = wa.values().map(|x| x * x).sum::<f64>().sqrt();
        let norm_b = wb.values().map(|x| x * x).sum::<f64>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<TermFrequency> {
        [
            "senior rust developer, remote, rust and tokio",
            "junior python developer in office",
            "rust developer wanted",
            "marketing manager, remote",
        ]
        .iter()
        .map(|t| TermFrequency::from_text(t))
        .collect()
    }

    #[test]
    fn tokenizer_drops_single_characters_and_punctuation() {
        let tokens: Vec<String> = tokenize("Go/Rust, C & Kotlin!").collect();
        assert_eq!(tokens, vec!["go", "rust", "kotlin"]);
    }

    #[test]
    fn term_frequency_counts_repeats() {
        let tf = TermFrequency::from_text("rust rust tokio");
        assert_eq!(tf.get("rust"), 2);
        assert_eq!(tf.total(), 3);
        assert_eq!(tf.distinct(), 2);
    }

    #[test]
    fn parallel_reduce_matches_sequential_accumulation() {
        let batch = corpus();
        let mut sequential = DocumentFrequency::default();
        for tf in &batch {
            sequential.add(tf);
        }
        assert_eq!(DocumentFrequency::from_batch(&batch), sequential);
        assert_eq!(sequential.documents(), 4);
        assert_eq!(sequential.df("developer"), 3);
        assert_eq!(sequential.df("rust"), 2);
    }

    #[test]
    fn idf_is_log_of_inverse_document_share() {
        let df = DocumentFrequency::from_batch(&corpus());
        let table = IdfTable::build(&df, &VectorizationModelParams::default());
        assert!((table.idf("rust") - (4.0f64 / 2.0).ln()).abs() < 1e-12);
        assert!((table.idf("marketing") - 4.0f64.ln()).abs() < 1e-12);
        assert_eq!(table.idf("haskell"), 0.0);
    }

    #[test]
    fn vocabulary_cap_keeps_most_frequent_terms() {
        let df = DocumentFrequency::from_batch(&corpus());
        let params = VectorizationModelParams {
            vocabulary_size: 2,
            ..Default::default()
        };
        let table = IdfTable::build(&df, &params);
        assert_eq!(table.len(), 2);
        assert!(table.idf("developer") > 0.0);
        assert_eq!(table.idf("marketing"), 0.0);
    }

    #[test]
    fn richer_ads_score_higher() {
        let df = DocumentFrequency::from_batch(&corpus());
        let scorer = TfIdfScorer::new(IdfTable::build(&df, &Default::default()), 0.1);
        let short = TermFrequency::from_text("rust developer");
        let long = TermFrequency::from_text("rust developer remote tokio senior");
        assert!(scorer.richness(&long) > scorer.richness(&short));
    }

    #[test]
    fn cosine_is_one_for_identical_and_zero_for_disjoint() {
        let df = DocumentFrequency::from_batch(&corpus());
        let scorer = TfIdfScorer::new(IdfTable::build(&df, &Default::default()), 0.1);
        let a = TermFrequency::from_text("senior rust tokio");
        let b = TermFrequency::from_text("marketing manager");
        assert!((scorer.cosine(&a, &a) - 1.0).abs() < 1e-9);
        assert_eq!(scorer.cosine(&a, &b), 0.0);
    }

    #[test]
    fn rebuild_is_due_on_drift_or_version_change() {
        let params = VectorizationModelParams::default();
        let df = DocumentFrequency::from_batch(&corpus());
        let scorer = TfIdfScorer::new(IdfTable::build(&df, &params), 0.25);
        assert!(!scorer.needs_rebuild(5, &params));
        assert!(scorer.needs_rebuild(6, &params));

        let bumped = VectorizationModelParams {
            version: ModelVersion(2),
            ..params
        };
        assert!(scorer.needs_rebuild(4, &bumped));
    }
}
