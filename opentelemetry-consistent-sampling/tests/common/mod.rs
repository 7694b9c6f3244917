#![allow(dead_code)]

use opentelemetry::{
    trace::{
        SamplingDecision, SpanContext, SpanId, SpanKind, TraceContextExt, TraceFlags, TraceId,
        TraceState,
    },
    Context,
};
use opentelemetry_consistent_sampling::{
    random::SeededRandomBits, ConsistentSampler, RecordingMode, SpanRecord, TraceIdRatioSampler,
};
use opentelemetry_sdk::trace::ShouldSample;

/// Shape of a simulated call tree. Every node's parent precedes it.
#[derive(Clone, Debug)]
pub struct CallTree {
    parents: Vec<Option<usize>>,
}

impl CallTree {
    /// Nodes numbered breadth first, the children of `i` are `2i + 1` and `2i + 2`.
    pub fn balanced_binary(nodes: usize) -> Self {
        CallTree {
            parents: (0..nodes)
                .map(|node| node.checked_sub(1).map(|n| n / 2))
                .collect(),
        }
    }

    pub fn chain(nodes: usize) -> Self {
        CallTree {
            parents: (0..nodes).map(|node| node.checked_sub(1)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        self.parents[node]
    }

    pub fn ancestors(&self, node: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.parent(node), move |&n| self.parent(n))
    }
}

pub fn span_id(node: usize) -> SpanId {
    SpanId::from(node as u64 + 1)
}

pub fn node_name(node: usize) -> String {
    format!("span@{node}")
}

/// A simulated span together with the decision taken for it.
#[derive(Clone, Debug)]
pub struct SimulatedSpan {
    pub node: usize,
    pub decision: SamplingDecision,
    pub record: SpanRecord,
}

impl SimulatedSpan {
    pub fn is_sampled(&self) -> bool {
        self.decision == SamplingDecision::RecordAndSample
    }
}

/// Runs the samplers over every node of `tree`, parents first, feeding each
/// node the trace state published by its parent.
pub fn simulate(
    tree: &CallTree,
    trace_id: TraceId,
    samplers: &[Box<dyn ShouldSample>],
) -> Vec<SimulatedSpan> {
    assert_eq!(tree.len(), samplers.len());
    let mut spans: Vec<SimulatedSpan> = Vec::with_capacity(tree.len());

    for node in 0..tree.len() {
        let parent = tree.parent(node).map(|p| &spans[p]);
        let parent_cx = parent.map(|p| {
            let flags = if p.is_sampled() {
                TraceFlags::SAMPLED
            } else {
                TraceFlags::default()
            };
            Context::new().with_remote_span_context(SpanContext::new(
                trace_id,
                p.record.span_id,
                flags,
                false,
                p.record.trace_state.clone(),
            ))
        });

        let name = node_name(node);
        let result = samplers[node].should_sample(
            parent_cx.as_ref(),
            trace_id,
            &name,
            &SpanKind::Internal,
            &[],
            &[],
        );

        let parent_trace_state = parent
            .map(|p| p.record.trace_state.clone())
            .unwrap_or_else(TraceState::default);
        let parent_span_id = parent.map_or(SpanId::INVALID, |p| p.record.span_id);
        let record = SpanRecord::new(trace_id, span_id(node), parent_span_id, name)
            .with_trace_state(result.trace_state)
            .with_parent_trace_state(parent_trace_state)
            .with_attributes(result.attributes);

        spans.push(SimulatedSpan {
            node,
            decision: result.decision,
            record,
        });
    }
    spans
}

/// The records an exporter would have received.
pub fn sampled(spans: &[SimulatedSpan]) -> Vec<SpanRecord> {
    spans
        .iter()
        .filter(|span| span.is_sampled())
        .map(|span| span.record.clone())
        .collect()
}

/// One consistent fixed rate sampler per probability, each with its own
/// reproducible random source split from `random`.
pub fn fixed_rate_samplers(
    probabilities: &[f64],
    recording_mode: RecordingMode,
    random: &SeededRandomBits,
) -> Vec<Box<dyn ShouldSample>> {
    probabilities
        .iter()
        .map(|&probability| {
            let sampler = ConsistentSampler::fixed_rate(probability)
                .expect("valid probability")
                .with_recording_mode(recording_mode)
                .with_random_source(random.split());
            Box::new(sampler) as Box<dyn ShouldSample>
        })
        .collect()
}

pub fn trace_id_ratio_samplers(
    ratios: &[f64],
    recording_mode: RecordingMode,
) -> Vec<Box<dyn ShouldSample>> {
    ratios
        .iter()
        .map(|&ratio| {
            let sampler = TraceIdRatioSampler::new(ratio, recording_mode).expect("valid ratio");
            Box::new(sampler) as Box<dyn ShouldSample>
        })
        .collect()
}

/// Asserts that `mean` of `values` is within `z = 4.75342` standard errors
/// of `expected`.
pub fn assert_mean_close(values: &[f64], expected: f64, label: &str) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let tolerance = 4.75342 * (variance / n).sqrt();
    assert!(
        (mean - expected).abs() <= tolerance,
        "{label}: mean {mean}, expected {expected}, tolerance {tolerance}"
    );
}
