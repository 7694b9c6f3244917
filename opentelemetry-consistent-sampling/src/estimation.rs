//! Unbiased estimation of population quantities from sampled traces.
//!
//! A quantity is described by an extractor that computes it from any
//! collection of spans of one trace. [`estimate`] and [`estimate_vector`]
//! repeatedly down-sample the spans by their own sampling rates and weight the
//! change of the quantity in every step by the reciprocal of that rate. Summed
//! over many traces, the estimates converge to the quantity as it would have
//! been computed on the unsampled traces.
use std::{collections::HashMap, fmt, hash::Hash};

use crate::{
    downsample::{down_sample, span_index},
    span::{ensure_single_trace, sampling_rates},
    SamplingError, SpanRecord,
};

/// Computes a single quantity from the spans of one trace.
pub trait ScalarQuantityExtractor {
    /// Extracts the quantity.
    fn extract(&self, spans: &[SpanRecord]) -> f64;
}

impl<F> ScalarQuantityExtractor for F
where
    F: Fn(&[SpanRecord]) -> f64,
{
    fn extract(&self, spans: &[SpanRecord]) -> f64 {
        self(spans)
    }
}

/// Computes one quantity per key from the spans of one trace.
pub trait VectorQuantityExtractor<K> {
    /// Extracts the quantities. Every key must be reported at most once.
    fn extract(&self, spans: &[SpanRecord]) -> HashMap<K, f64>;
}

impl<K, F> VectorQuantityExtractor<K> for F
where
    F: Fn(&[SpanRecord]) -> HashMap<K, f64>,
{
    fn extract(&self, spans: &[SpanRecord]) -> HashMap<K, f64> {
        self(spans)
    }
}

/// A vector extractor built from keyed scalar extractors.
pub struct VectorOf<K> {
    extractors: Vec<(K, Box<dyn ScalarQuantityExtractor + Send + Sync>)>,
}

impl<K> VectorOf<K> {
    /// Creates an extractor without keys.
    pub fn new() -> Self {
        VectorOf {
            extractors: Vec::new(),
        }
    }

    /// Adds a scalar extractor reported under `key`.
    pub fn with<S>(mut self, key: K, extractor: S) -> Self
    where
        S: ScalarQuantityExtractor + Send + Sync + 'static,
    {
        self.extractors.push((key, Box::new(extractor)));
        self
    }
}

impl<K> Default for VectorOf<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: fmt::Debug> fmt::Debug for VectorOf<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorOf")
            .field(
                "keys",
                &self.extractors.iter().map(|(key, _)| key).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<K: Eq + Hash + Clone> VectorQuantityExtractor<K> for VectorOf<K> {
    fn extract(&self, spans: &[SpanRecord]) -> HashMap<K, f64> {
        self.extractors
            .iter()
            .map(|(key, extractor)| (key.clone(), extractor.extract(spans)))
            .collect()
    }
}

/// Counts the spans matching `predicate`.
pub fn count_matching_spans<P>(predicate: P) -> impl Fn(&[SpanRecord]) -> f64 + Send + Sync
where
    P: Fn(&SpanRecord) -> bool + Send + Sync,
{
    move |spans: &[SpanRecord]| spans.iter().filter(|span| predicate(span)).count() as f64
}

/// Yields one if the spans as a whole match `predicate`, zero otherwise.
pub fn count_matching_traces<P>(predicate: P) -> impl Fn(&[SpanRecord]) -> f64 + Send + Sync
where
    P: Fn(&[SpanRecord]) -> bool + Send + Sync,
{
    move |spans: &[SpanRecord]| if predicate(spans) { 1.0 } else { 0.0 }
}

/// Counts spans matching a child predicate that have an ancestor matching a
/// parent predicate.
///
/// Each matching child counts once, for its nearest matching ancestor. The
/// ancestor chain is followed through the recorded ancestor links, so the
/// count stays meaningful after down-sampling.
#[derive(Clone)]
pub struct ParentChildRelationshipCounter<P, C> {
    parent_matcher: P,
    child_matcher: C,
}

impl<P, C> ParentChildRelationshipCounter<P, C>
where
    P: Fn(&SpanRecord) -> bool,
    C: Fn(&SpanRecord) -> bool,
{
    /// Creates the counter.
    pub fn new(parent_matcher: P, child_matcher: C) -> Self {
        ParentChildRelationshipCounter {
            parent_matcher,
            child_matcher,
        }
    }
}

impl<P, C> fmt::Debug for ParentChildRelationshipCounter<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParentChildRelationshipCounter")
            .finish_non_exhaustive()
    }
}

impl<P, C> ScalarQuantityExtractor for ParentChildRelationshipCounter<P, C>
where
    P: Fn(&SpanRecord) -> bool,
    C: Fn(&SpanRecord) -> bool,
{
    fn extract(&self, spans: &[SpanRecord]) -> f64 {
        let index = span_index(spans);
        let mut count = 0u64;
        for child in spans.iter().filter(|span| (self.child_matcher)(span)) {
            let mut ancestor = index.get(&child.ancestor_span_id());
            for _ in 0..spans.len() {
                let Some(&position) = ancestor else {
                    break;
                };
                let candidate = &spans[position];
                if (self.parent_matcher)(candidate) {
                    count += 1;
                    break;
                }
                ancestor = index.get(&candidate.ancestor_span_id());
            }
        }
        count as f64
    }
}

/// Estimates a scalar quantity of the unsampled trace.
///
/// # Errors
///
/// See [`estimate_vector`].
pub fn estimate<S>(extractor: &S, spans: &[SpanRecord]) -> Result<f64, SamplingError>
where
    S: ScalarQuantityExtractor + ?Sized,
{
    let single = |spans: &[SpanRecord]| HashMap::from([((), extractor.extract(spans))]);
    let estimates = estimate_vector(&single, spans)?;
    Ok(estimates.get(&()).copied().unwrap_or(0.0))
}

/// Estimates a vector of quantities of the unsampled trace.
///
/// An empty span collection yields zero for every key the extractor reports
/// on it.
///
/// # Errors
///
/// Fails if the spans belong to more than one trace, if a span has no usable
/// sampling rate or if the spans mix exponent and ratio based rates.
pub fn estimate_vector<K, V>(
    extractor: &V,
    spans: &[SpanRecord],
) -> Result<HashMap<K, f64>, SamplingError>
where
    K: Eq + Hash + Clone,
    V: VectorQuantityExtractor<K> + ?Sized,
{
    if spans.is_empty() {
        return Ok(extractor
            .extract(spans)
            .into_keys()
            .map(|key| (key, 0.0))
            .collect());
    }
    ensure_single_trace(spans)?;

    let mut estimates: HashMap<K, f64> = HashMap::new();
    let mut current = spans.to_vec();
    let mut previous = extractor.extract(&current);
    loop {
        let rate = min_rate(&current)?;
        current = down_sample(&current, rate)?;

        if current.is_empty() {
            for (key, value) in previous {
                *estimates.entry(key).or_insert(0.0) += value / rate;
            }
            return Ok(estimates);
        }

        let next = extractor.extract(&current);
        let mut differences = previous;
        for (key, value) in &next {
            let difference = differences.remove(key).unwrap_or(0.0) - value;
            *estimates.entry(key.clone()).or_insert(0.0) += difference / rate;
        }
        for (key, difference) in differences {
            *estimates.entry(key).or_insert(0.0) += difference / rate;
        }
        previous = next;
    }
}

fn min_rate(spans: &[SpanRecord]) -> Result<f64, SamplingError> {
    Ok(sampling_rates(spans)?
        .into_iter()
        .fold(f64::INFINITY, f64::min))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace_state::{
        NUMBER_DROPPED_ANCESTORS_KEY, RATE_EXPONENT_KEY, SAMPLED_ANCESTOR_SPAN_ID_KEY,
        SAMPLING_RATIO_KEY,
    };
    use opentelemetry::{
        trace::{SpanId, TraceId, TraceState},
        KeyValue,
    };

    fn span(id: u64, parent: u64, name: &'static str, exponent: u8) -> SpanRecord {
        SpanRecord::new(TraceId::from(3u128), SpanId::from(id), SpanId::from(parent), name)
            .with_trace_state(
                TraceState::from_key_value([(RATE_EXPONENT_KEY, exponent.to_string())]).unwrap(),
            )
    }

    fn count_all() -> impl Fn(&[SpanRecord]) -> f64 + Send + Sync {
        count_matching_spans(|_| true)
    }

    #[test]
    fn empty_input_yields_zero_per_key() {
        let extractor = VectorOf::new()
            .with("spans", count_all())
            .with("traces", count_matching_traces(|_| true));

        let estimates = estimate_vector(&extractor, &[]).unwrap();

        assert_eq!(estimates, HashMap::from([("spans", 0.0), ("traces", 0.0)]));
        assert_eq!(estimate(&count_all(), &[]).unwrap(), 0.0);
    }

    #[test]
    fn fully_sampled_trace_is_exact() {
        let spans = [span(1, 0, "a", 1), span(2, 1, "b", 1), span(3, 1, "b", 1)];
        assert_eq!(estimate(&count_all(), &spans).unwrap(), 3.0);
        assert_eq!(
            estimate(&count_matching_spans(|span| span.name == "b"), &spans).unwrap(),
            2.0
        );
    }

    #[test]
    fn weights_by_reciprocal_rate() {
        let spans = [span(1, 0, "a", 1), span(2, 1, "b", 2), span(3, 2, "c", 3)];
        // 1 + 2 + 4
        assert_eq!(estimate(&count_all(), &spans).unwrap(), 7.0);
    }

    #[test]
    fn ratio_attributes_are_used() {
        let spans = [
            SpanRecord::new(TraceId::from(3u128), SpanId::from(1), SpanId::INVALID, "a")
                .with_attributes([KeyValue::new(SAMPLING_RATIO_KEY, 0.2)]),
            SpanRecord::new(TraceId::from(3u128), SpanId::from(2), SpanId::from(1), "b")
                .with_attributes([KeyValue::new(SAMPLING_RATIO_KEY, 0.5)]),
        ];
        let estimated = estimate(&count_all(), &spans).unwrap();
        assert!((estimated - 7.0).abs() < 1e-9, "estimated {estimated}");
    }

    #[test]
    fn trace_count_is_weighted_by_matching_span() {
        let spans = [span(1, 0, "a", 1), span(2, 1, "b", 2)];
        let extractor = count_matching_traces(|spans| spans.iter().any(|span| span.name == "b"));
        assert_eq!(estimate(&extractor, &spans).unwrap(), 2.0);
    }

    #[test]
    fn parent_child_relationships_follow_ancestor_links() {
        // a <- (dropped) <- b <- c
        let linked = TraceState::from_key_value([
            (NUMBER_DROPPED_ANCESTORS_KEY, "1"),
            (SAMPLED_ANCESTOR_SPAN_ID_KEY, "0000000000000001"),
        ])
        .unwrap();
        let spans = [
            span(1, 0, "a", 1),
            span(3, 2, "b", 2).with_parent_trace_state(linked),
            span(4, 3, "c", 1),
        ];
        let named = |name: &'static str| move |span: &SpanRecord| span.name == name;
        let a_to_b = ParentChildRelationshipCounter::new(named("a"), named("b"));
        let a_to_c = ParentChildRelationshipCounter::new(named("a"), named("c"));

        assert_eq!(a_to_b.extract(&spans), 1.0);
        assert_eq!(a_to_c.extract(&spans), 1.0);
        // b survives with probability 1/2, c and its link to a always survive
        assert_eq!(estimate(&a_to_b, &spans).unwrap(), 2.0);
        assert_eq!(estimate(&a_to_c, &spans).unwrap(), 1.0);
    }

    #[test]
    fn vector_estimate_matches_scalar_estimates() {
        let spans = [span(1, 0, "a", 2), span(2, 1, "b", 3), span(3, 1, "b", 1)];
        let extractor = VectorOf::new()
            .with("all", count_all())
            .with("b", count_matching_spans(|span| span.name == "b"));

        let estimates = estimate_vector(&extractor, &spans).unwrap();

        assert_eq!(estimates["all"], estimate(&count_all(), &spans).unwrap());
        assert_eq!(
            estimates["b"],
            estimate(&count_matching_spans(|span| span.name == "b"), &spans).unwrap()
        );
        assert_eq!(estimates["all"], 2.0 + 4.0 + 1.0);
    }

    #[test]
    fn keys_reported_only_before_down_sampling_keep_their_value() {
        let spans = [span(1, 0, "a", 1), span(2, 1, "b", 2)];
        let extractor = |spans: &[SpanRecord]| {
            spans
                .iter()
                .map(|span| (span.name.to_string(), 1.0))
                .collect::<HashMap<_, _>>()
        };

        let estimates = estimate_vector(&extractor, &spans).unwrap();

        assert_eq!(estimates["a"], 1.0);
        assert_eq!(estimates["b"], 2.0);
    }

    #[test]
    fn rejects_multiple_traces() {
        let mut other = span(2, 1, "b", 1);
        other.trace_id = TraceId::from(4u128);
        assert!(matches!(
            estimate(&count_all(), &[span(1, 0, "a", 1), other]),
            Err(SamplingError::MultipleTraces { .. })
        ));
    }
}
