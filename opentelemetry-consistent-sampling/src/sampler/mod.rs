//! Samplers deciding on spans through rate exponents and the shared geometric random value.

use std::{fmt, sync::Arc, time::Duration};

use opentelemetry::{
    trace::{
        Link, SamplingDecision, SamplingResult, SpanId, SpanKind, TraceContextExt, TraceId,
        TraceState,
    },
    Context, KeyValue,
};
use opentelemetry_sdk::trace::ShouldSample;

use crate::{
    random::{RandomBitSource, ThreadLocalRandomBits},
    trace_state::{self, RateExponent},
    RecordingMode, SamplingError,
};

mod composed;
mod fixed_rate;
mod skip_period;
mod trace_id_ratio;

pub use composed::Composed;
pub use fixed_rate::FixedRate;
pub use skip_period::SkipPeriod;
pub use trace_id_ratio::TraceIdRatioSampler;

/// Everything the host runtime hands to a sampler for a span about to be created.
#[derive(Clone, Copy, Debug)]
pub struct SamplingRequest<'a> {
    /// Context of the parent span, if any.
    pub parent_context: Option<&'a Context>,
    /// Trace id of the new span.
    pub trace_id: TraceId,
    /// Name of the new span.
    pub name: &'a str,
    /// Kind of the new span.
    pub span_kind: &'a SpanKind,
    /// Attributes known at span creation.
    pub attributes: &'a [KeyValue],
    /// Links known at span creation.
    pub links: &'a [Link],
}

impl<'a> SamplingRequest<'a> {
    /// A request for a root span with no attributes or links.
    pub fn root(trace_id: TraceId, name: &'a str) -> Self {
        SamplingRequest {
            parent_context: None,
            trace_id,
            name,
            span_kind: &SpanKind::Internal,
            attributes: &[],
            links: &[],
        }
    }
}

/// Chooses the rate exponent a span is sampled with.
///
/// A policy only picks the rate. Keeping or dropping the span and maintaining
/// the trace state is left to [`ConsistentSampler`], which keeps the decisions
/// of a trace consistent regardless of the policies used for its spans.
pub trait RateExponentPolicy: Clone + Send + Sync + fmt::Debug + 'static {
    /// Returns the rate exponent for the span described by `request`.
    fn rate_exponent(
        &self,
        request: &SamplingRequest<'_>,
        random: &dyn RandomBitSource,
    ) -> RateExponent;

    /// Human readable description of the policy.
    fn description(&self) -> String;

    /// Combines two policies so that a span is sampled if either would sample it.
    fn or<B>(self, other: B) -> Composed<Self, B>
    where
        Self: Sized,
        B: RateExponentPolicy,
    {
        Composed::new(self, other)
    }
}

/// A sampler that makes consistent keep or drop decisions across a trace.
///
/// Every trace carries a geometric random value in its trace state, drawn once
/// at the root and inherited by all descendants. A span is kept when that
/// value is at least the rate exponent chosen by the policy `P`, so spans that
/// request a higher sampling rate than a kept span are kept as well.
///
/// Dropped spans record their nearest sampled ancestor and the number of
/// dropped spans in between, as selected by the [`RecordingMode`].
///
/// # Examples
///
/// ```
/// use opentelemetry_consistent_sampling::{ConsistentSampler, RecordingMode};
/// use opentelemetry_sdk::trace::SdkTracerProvider;
///
/// let sampler = ConsistentSampler::fixed_rate(0.25)
///     .unwrap()
///     .with_recording_mode(RecordingMode::AncestorLink);
/// let _provider = SdkTracerProvider::builder().with_sampler(sampler).build();
/// ```
#[derive(Clone, Debug)]
pub struct ConsistentSampler<P> {
    policy: P,
    recording_mode: RecordingMode,
    random: Arc<dyn RandomBitSource>,
}

impl<P: RateExponentPolicy> ConsistentSampler<P> {
    /// Creates a sampler using `policy` with the default recording mode and
    /// the thread-local random source.
    pub fn new(policy: P) -> Self {
        ConsistentSampler {
            policy,
            recording_mode: RecordingMode::default(),
            random: Arc::new(ThreadLocalRandomBits),
        }
    }

    /// Sets the recording mode.
    pub fn with_recording_mode(mut self, recording_mode: RecordingMode) -> Self {
        self.recording_mode = recording_mode;
        self
    }

    /// Replaces the random bit source.
    pub fn with_random_source<R: RandomBitSource + 'static>(mut self, random: R) -> Self {
        self.random = Arc::new(random);
        self
    }

    /// The rate exponent policy.
    pub fn policy(&self) -> &P {
        &self.policy
    }

    /// The recording mode.
    pub fn recording_mode(&self) -> RecordingMode {
        self.recording_mode
    }

    /// Human readable description of the sampler.
    pub fn description(&self) -> String {
        format!(
            "ConsistentSampler{{{}, {}}}",
            self.policy.description(),
            self.recording_mode
        )
    }

    /// Decides whether the span described by `request` is kept and computes
    /// the trace state published to its children.
    pub fn decide(&self, request: &SamplingRequest<'_>) -> SamplingResult {
        let (parent_state, parent_span_id) = parent_state(request.parent_context);

        let geometric_random_value = trace_state::geometric_random_value(&parent_state)
            .unwrap_or_else(|| self.random.geometric_random_value());
        let rate_exponent = self.policy.rate_exponent(request, self.random.as_ref());

        if rate_exponent != RateExponent::NEVER && geometric_random_value >= rate_exponent.value()
        {
            SamplingResult {
                decision: SamplingDecision::RecordAndSample,
                attributes: trace_state::ancestor_attributes(&parent_state),
                trace_state: trace_state::record_kept(
                    &parent_state,
                    geometric_random_value,
                    rate_exponent,
                ),
            }
        } else {
            SamplingResult {
                decision: SamplingDecision::Drop,
                attributes: Vec::new(),
                trace_state: trace_state::record_dropped(
                    &parent_state,
                    parent_span_id,
                    geometric_random_value,
                    rate_exponent,
                    self.recording_mode,
                ),
            }
        }
    }
}

impl ConsistentSampler<FixedRate> {
    /// A sampler keeping spans with the fixed probability `probability`.
    pub fn fixed_rate(probability: f64) -> Result<Self, SamplingError> {
        FixedRate::new(probability).map(ConsistentSampler::new)
    }
}

impl ConsistentSampler<SkipPeriod> {
    /// A sampler keeping at most one span per `period`.
    pub fn skip_period(period: Duration) -> Self {
        ConsistentSampler::new(SkipPeriod::new(period))
    }
}

impl<P: RateExponentPolicy> ShouldSample for ConsistentSampler<P> {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        name: &str,
        span_kind: &SpanKind,
        attributes: &[KeyValue],
        links: &[Link],
    ) -> SamplingResult {
        self.decide(&SamplingRequest {
            parent_context,
            trace_id,
            name,
            span_kind,
            attributes,
            links,
        })
    }
}

/// Returns the inherited trace state and the parent's span id, which is
/// [`SpanId::INVALID`] for root spans.
pub(crate) fn parent_state(parent_context: Option<&Context>) -> (TraceState, SpanId) {
    match parent_context {
        Some(cx) if cx.has_active_span() => {
            let span = cx.span();
            let span_context = span.span_context();
            (span_context.trace_state().clone(), span_context.span_id())
        }
        _ => (TraceState::default(), SpanId::INVALID),
    }
}
