use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use opentelemetry::{
    otel_debug,
    trace::{Link, SamplingDecision, SamplingResult, SpanKind, TraceId},
    Context, KeyValue,
};
use opentelemetry_sdk::trace::ShouldSample;

use crate::{
    sampler::parent_state,
    trace_state::{self, SAMPLING_MODE_KEY, SAMPLING_RATIO_KEY},
    RecordingMode, SamplingError,
};

#[derive(Debug)]
struct RatioConfig {
    ratio: f64,
    threshold: u64,
    recording_mode: RecordingMode,
}

impl RatioConfig {
    fn new(ratio: f64, recording_mode: RecordingMode) -> Result<Self, SamplingError> {
        if !(0.0..=1.0).contains(&ratio) {
            return Err(SamplingError::InvalidProbability(ratio));
        }
        let threshold = if ratio >= 1.0 {
            u64::MAX
        } else {
            // 2^63 is the number of distinct absolute values of an i64
            (ratio * (1u64 << 63) as f64) as u64
        };
        Ok(RatioConfig {
            ratio,
            threshold,
            recording_mode,
        })
    }
}

/// Samples traces by a ratio derived from the trace id.
///
/// Unlike [`ConsistentSampler`](crate::ConsistentSampler) this sampler does not
/// use the inherited random value. Kept spans carry the ratio and recording
/// mode as `sampling-ratio` and `sampling-mode` attributes, dropped spans
/// maintain the ancestor fields of the trace state.
///
/// The ratio can be changed at runtime with [`set_ratio`](Self::set_ratio).
/// Every decision reads the configuration once, so a concurrent update is
/// never observed half way. Clones share the configuration.
#[derive(Clone)]
pub struct TraceIdRatioSampler {
    config: Arc<ArcSwap<RatioConfig>>,
}

impl TraceIdRatioSampler {
    /// Creates a sampler keeping the given ratio of traces.
    pub fn new(ratio: f64, recording_mode: RecordingMode) -> Result<Self, SamplingError> {
        let config = RatioConfig::new(ratio, recording_mode)?;
        Ok(TraceIdRatioSampler {
            config: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    /// Replaces the sampling ratio.
    pub fn set_ratio(&self, ratio: f64) -> Result<(), SamplingError> {
        let recording_mode = self.config.load().recording_mode;
        let config = RatioConfig::new(ratio, recording_mode)?;
        self.config.store(Arc::new(config));
        otel_debug!(name: "ConsistentSampler.TraceIdRatio.RatioUpdated", ratio = ratio);
        Ok(())
    }

    /// The current sampling ratio.
    pub fn ratio(&self) -> f64 {
        self.config.load().ratio
    }

    /// The recording mode.
    pub fn recording_mode(&self) -> RecordingMode {
        self.config.load().recording_mode
    }
}

impl fmt::Debug for TraceIdRatioSampler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let config = self.config.load();
        f.debug_struct("TraceIdRatioSampler")
            .field("ratio", &config.ratio)
            .field("recording_mode", &config.recording_mode)
            .finish()
    }
}

fn trace_id_value(trace_id: TraceId) -> u64 {
    let bytes = trace_id.to_bytes();
    let mut lower = [0u8; 8];
    lower.copy_from_slice(&bytes[8..]);
    i64::from_be_bytes(lower).unsigned_abs()
}

impl ShouldSample for TraceIdRatioSampler {
    fn should_sample(
        &self,
        parent_context: Option<&Context>,
        trace_id: TraceId,
        _name: &str,
        _span_kind: &SpanKind,
        _attributes: &[KeyValue],
        _links: &[Link],
    ) -> SamplingResult {
        let config = self.config.load();
        let (parent_state, parent_span_id) = parent_state(parent_context);

        if trace_id_value(trace_id) < config.threshold {
            SamplingResult {
                decision: SamplingDecision::RecordAndSample,
                attributes: [
                    KeyValue::new(SAMPLING_RATIO_KEY, config.ratio),
                    KeyValue::new(SAMPLING_MODE_KEY, config.recording_mode.as_str()),
                ]
                .into_iter()
                .chain(trace_state::ancestor_attributes(&parent_state))
                .collect(),
                trace_state: trace_state::clear_ancestors(parent_state),
            }
        } else {
            SamplingResult {
                decision: SamplingDecision::Drop,
                attributes: Vec::new(),
                trace_state: trace_state::track_dropped_ancestor(
                    parent_state.clone(),
                    &parent_state,
                    parent_span_id,
                    config.recording_mode,
                ),
            }
        }
    }
}
