//! Term weighting used by postings iterators and vector lengths.

use std::fmt::Debug;
use std::sync::Arc;

/// Collection and term statistics a weighting function may use.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightingComponents {
    /// Number of documents in the collection.
    pub n_docs: u32,
    /// Number of documents containing the term.
    pub term_doc_freq: u32,
    /// Total occurrences of the term across the collection.
    pub term_total_occurrences: u64,
    /// Largest within-document frequency of the term.
    pub max_freq: u32,
}

impl WeightingComponents {
    /// Components for a single term against a collection of `n_docs`.
    pub fn for_term(n_docs: u32, term_doc_freq: u32, total: u64, max_freq: u32) -> Self {
        WeightingComponents {
            n_docs,
            term_doc_freq,
            term_total_occurrences: total,
            max_freq,
        }
    }
}

/// Maps a within-document frequency to a weight.
pub trait WeightingFunction: Send + Sync + Debug {
    /// Weight of a term occurring `freq` times in a document.
    fn weight(&self, freq: u32, components: &WeightingComponents) -> f32;

    /// Name used in log messages.
    fn name(&self) -> &'static str;
}

/// Log-scaled term frequency times inverse document frequency.
#[derive(Debug, Clone, Copy, Default)]
pub struct TfIdf;

impl WeightingFunction for TfIdf {
    fn weight(&self, freq: u32, components: &WeightingComponents) -> f32 {
        if freq == 0 {
            return 0.0;
        }
        let tf = 1.0 + (freq as f32).ln();
        let df = components.term_doc_freq.max(1) as f32;
        let n = components.n_docs.max(components.term_doc_freq).max(1) as f32;
        tf * (1.0 + n / df).ln()
    }

    fn name(&self) -> &'static str {
        "tf-idf"
    }
}

/// Raw frequency as weight.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawFrequency;

impl WeightingFunction for RawFrequency {
    fn weight(&self, freq: u32, _components: &WeightingComponents) -> f32 {
        freq as f32
    }

    fn name(&self) -> &'static str {
        "raw-frequency"
    }
}

/// A weighting function bound to the components of one term.
#[derive(Debug, Clone)]
pub(crate) struct BoundWeighting {
    function: Arc<dyn WeightingFunction>,
    components: WeightingComponents,
}

impl BoundWeighting {
    pub(crate) fn new(function: Arc<dyn WeightingFunction>, components: WeightingComponents) -> Self {
        BoundWeighting {
            function,
            components,
        }
    }

    #[inline]
    pub(crate) fn weight(&self, freq: u32) -> f32 {
        self.function.weight(freq, &self.components)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tf_idf_monotonic_in_freq() {
        let c = WeightingComponents::for_term(100, 10, 30, 5);
        let w1 = TfIdf.weight(1, &c);
        let w3 = TfIdf.weight(3, &c);
        assert!(w1 > 0.0);
        assert!(w3 > w1);
        assert_eq!(TfIdf.weight(0, &c), 0.0);
    }

    #[test]
    fn test_rarer_terms_weigh_more() {
        let common = WeightingComponents::for_term(100, 90, 200, 4);
        let rare = WeightingComponents::for_term(100, 2, 2, 1);
        assert!(TfIdf.weight(2, &rare) > TfIdf.weight(2, &common));
    }

    #[test]
    fn test_bound_weighting() {
        let bound = BoundWeighting::new(Arc::new(RawFrequency), WeightingComponents::default());
        assert_eq!(bound.weight(7), 7.0);
    }
}
