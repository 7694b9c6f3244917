use std::collections::HashMap;

use opentelemetry::trace::SpanId;

use crate::{
    span::{ensure_single_trace, sampling_rates},
    trace_state::{self, NUMBER_DROPPED_ANCESTORS_KEY, SAMPLED_ANCESTOR_SPAN_ID_KEY},
    SamplingError, SpanRecord,
};

/// Maps span ids to their position in a span slice.
pub(crate) fn span_index(spans: &[SpanRecord]) -> HashMap<SpanId, usize> {
    spans
        .iter()
        .enumerate()
        .map(|(position, span)| (span.span_id, position))
        .collect()
}

/// Simulates sampling the spans of one trace at a coarser rate.
///
/// Only spans whose sampling rate is strictly greater than `threshold` are
/// returned. A surviving span whose nearest sampled ancestor does not survive
/// is rewritten to point at the nearest ancestor that does, with every skipped
/// ancestor (and the spans that ancestor had already skipped) added to its
/// number of dropped ancestors. Root spans and spans whose ancestor survives are
/// returned unchanged, and the input is never modified.
///
/// Down-sampling at `t1` and then at `t2 > t1` yields the same spans as
/// down-sampling at `t2` directly.
///
/// # Errors
///
/// Fails if the spans belong to more than one trace, if a span has no usable
/// sampling rate or if the spans mix exponent and ratio based rates.
pub fn down_sample(spans: &[SpanRecord], threshold: f64) -> Result<Vec<SpanRecord>, SamplingError> {
    ensure_single_trace(spans)?;
    let rates = sampling_rates(spans)?;
    let index = span_index(spans);

    let mut sampled = Vec::new();
    for (span, &rate) in spans.iter().zip(&rates) {
        if rate <= threshold {
            continue;
        }

        let recorded_ancestor = span.ancestor_span_id();
        let mut ancestor = recorded_ancestor;
        let mut dropped = span.number_dropped_ancestors();
        // bounded by the number of spans to stop on malformed, cyclic links
        for _ in 0..spans.len() {
            let Some(&position) = index.get(&ancestor) else {
                break;
            };
            if rates[position] > threshold {
                break;
            }
            let skipped = &spans[position];
            dropped = dropped
                .saturating_add(1)
                .saturating_add(skipped.number_dropped_ancestors());
            ancestor = skipped.ancestor_span_id();
        }

        if ancestor == recorded_ancestor {
            sampled.push(span.clone());
        } else {
            sampled.push(relink(span, ancestor, dropped));
        }
    }
    Ok(sampled)
}

fn relink(span: &SpanRecord, ancestor: SpanId, dropped: u64) -> SpanRecord {
    let parent_trace_state = span.parent_trace_state.clone();
    let parent_trace_state = if ancestor == span.parent_span_id {
        trace_state::remove(parent_trace_state, SAMPLED_ANCESTOR_SPAN_ID_KEY)
    } else {
        trace_state::put(
            parent_trace_state,
            SAMPLED_ANCESTOR_SPAN_ID_KEY,
            ancestor.to_string(),
        )
    };
    let parent_trace_state = if dropped > 0 {
        trace_state::put(
            parent_trace_state,
            NUMBER_DROPPED_ANCESTORS_KEY,
            dropped.to_string(),
        )
    } else {
        trace_state::remove(parent_trace_state, NUMBER_DROPPED_ANCESTORS_KEY)
    };

    SpanRecord {
        parent_trace_state,
        ..span.clone()
    }
}
