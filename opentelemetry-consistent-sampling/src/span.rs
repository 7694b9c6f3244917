use std::borrow::Cow;

use opentelemetry::{
    trace::{SpanId, TraceId, TraceState},
    KeyValue, Value,
};
use opentelemetry_sdk::trace::SpanData;

use crate::{trace_state, SamplingError};

/// A finished span as consumed by the analysis functions.
///
/// `trace_state` is the state the span published to its children, carrying
/// the rate exponent it was sampled with. `parent_trace_state` is the state the
/// span inherited from its parent and carries the ancestor fields.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanRecord {
    /// Trace id.
    pub trace_id: TraceId,
    /// Span id.
    pub span_id: SpanId,
    /// Span id of the parent, [`SpanId::INVALID`] for roots.
    pub parent_span_id: SpanId,
    /// Span name.
    pub name: Cow<'static, str>,
    /// State published by this span.
    pub trace_state: TraceState,
    /// State inherited from the parent span.
    pub parent_trace_state: TraceState,
    /// Attributes recorded on the span.
    pub attributes: Vec<KeyValue>,
}

/// How the sampling rate of a span was recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RateEncoding {
    Exponent,
    Ratio,
}

impl SpanRecord {
    /// Creates a record with empty trace states and no attributes.
    pub fn new(
        trace_id: TraceId,
        span_id: SpanId,
        parent_span_id: SpanId,
        name: impl Into<Cow<'static, str>>,
    ) -> Self {
        SpanRecord {
            trace_id,
            span_id,
            parent_span_id,
            name: name.into(),
            trace_state: TraceState::default(),
            parent_trace_state: TraceState::default(),
            attributes: Vec::new(),
        }
    }

    /// Sets the published trace state.
    pub fn with_trace_state(mut self, trace_state: TraceState) -> Self {
        self.trace_state = trace_state;
        self
    }

    /// Sets the inherited trace state.
    pub fn with_parent_trace_state(mut self, parent_trace_state: TraceState) -> Self {
        self.parent_trace_state = parent_trace_state;
        self
    }

    /// Sets the attributes.
    pub fn with_attributes(mut self, attributes: impl IntoIterator<Item = KeyValue>) -> Self {
        self.attributes = attributes.into_iter().collect();
        self
    }

    /// Whether the span has no parent.
    pub fn is_root(&self) -> bool {
        self.parent_span_id == SpanId::INVALID
    }

    /// The nearest sampled ancestor: the recorded ancestor link, or the parent.
    pub fn ancestor_span_id(&self) -> SpanId {
        trace_state::sampled_ancestor_span_id(&self.parent_trace_state)
            .unwrap_or(self.parent_span_id)
    }

    /// Number of dropped spans between this span and its nearest sampled ancestor.
    pub fn number_dropped_ancestors(&self) -> u64 {
        trace_state::number_dropped_ancestors(&self.parent_trace_state).unwrap_or(0)
    }

    /// Looks up an attribute value by key.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| &kv.value)
    }

    fn sampling_ratio(&self) -> Option<f64> {
        match self.attribute(trace_state::SAMPLING_RATIO_KEY)? {
            Value::F64(ratio) => Some(*ratio),
            Value::I64(ratio) => Some(*ratio as f64),
            Value::String(ratio) => ratio.as_str().parse().ok(),
            _ => None,
        }
    }

    pub(crate) fn rate(&self) -> Option<(f64, RateEncoding)> {
        if let Some(ratio) = self.sampling_ratio() {
            return Some((ratio, RateEncoding::Ratio));
        }
        trace_state::rate_exponent(&self.trace_state)
            .map(|exponent| (exponent.sampling_rate(), RateEncoding::Exponent))
    }

    /// The rate this span was sampled with.
    ///
    /// The `sampling-ratio` attribute takes precedence over the rate exponent
    /// of the published trace state. Spans without a positive rate in either
    /// place cannot be weighted and are rejected.
    pub fn sampling_rate(&self) -> Result<f64, SamplingError> {
        match self.rate() {
            Some((rate, _)) if rate > 0.0 && rate <= 1.0 => Ok(rate),
            _ => Err(SamplingError::MissingSamplingRate(self.span_id)),
        }
    }
}

/// Converts a span exported by the SDK.
///
/// The ancestor fields a kept span inherited are exported as attributes and
/// are moved back into the inherited state here.
impl From<&SpanData> for SpanRecord {
    fn from(span: &SpanData) -> Self {
        let (ancestors, attributes): (Vec<KeyValue>, Vec<KeyValue>) = span
            .attributes
            .iter()
            .cloned()
            .partition(|kv| trace_state::is_ancestor_key(kv.key.as_str()));
        SpanRecord {
            trace_id: span.span_context.trace_id(),
            span_id: span.span_context.span_id(),
            parent_span_id: span.parent_span_id,
            name: span.name.clone(),
            trace_state: span.span_context.trace_state().clone(),
            parent_trace_state: trace_state::ancestor_state(&ancestors),
            attributes,
        }
    }
}

/// Checks that all spans share one trace id.
pub(crate) fn ensure_single_trace(spans: &[SpanRecord]) -> Result<(), SamplingError> {
    if let Some(first) = spans.first() {
        if let Some(other) = spans.iter().find(|span| span.trace_id != first.trace_id) {
            return Err(SamplingError::MultipleTraces {
                first: first.trace_id,
                second: other.trace_id,
            });
        }
    }
    Ok(())
}

/// Returns the sampling rate of every span, checking that all spans use the
/// same rate encoding.
pub(crate) fn sampling_rates(spans: &[SpanRecord]) -> Result<Vec<f64>, SamplingError> {
    let mut encoding = None;
    spans
        .iter()
        .map(|span| {
            let (rate, span_encoding) = span
                .rate()
                .filter(|(rate, _)| *rate > 0.0 && *rate <= 1.0)
                .ok_or(SamplingError::MissingSamplingRate(span.span_id))?;
            match encoding {
                None => encoding = Some(span_encoding),
                Some(seen) if seen != span_encoding => {
                    return Err(SamplingError::MixedRateEncodings)
                }
                Some(_) => {}
            }
            Ok(rate)
        })
        .collect()
}
