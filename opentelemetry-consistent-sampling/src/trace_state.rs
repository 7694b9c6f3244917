//! Trace state fields shared by the consistent samplers and the analysis pass.
//!
//! All values are stored as decimal strings, except for the sampled ancestor
//! span id which uses the usual 16 character hex form. Values that cannot be
//! parsed, or that fall outside of their valid range, are reported as absent.
use std::fmt;

use opentelemetry::{otel_debug, trace::SpanId, trace::TraceState, KeyValue};

use crate::{RecordingMode, SamplingError};

/// Key of the per-trace geometric random value.
pub const GEOMETRIC_RANDOM_VALUE_KEY: &str = "sampling-geometric-random-value";
/// Key of the rate exponent a span was sampled with.
pub const RATE_EXPONENT_KEY: &str = "sampling-rate-exponent";
/// Key of the number of consecutive dropped ancestors.
pub const NUMBER_DROPPED_ANCESTORS_KEY: &str = "number-dropped-ancestors";
/// Key of the span id of the nearest sampled ancestor.
pub const SAMPLED_ANCESTOR_SPAN_ID_KEY: &str = "sampled-ancestor-span-id";
/// Attribute carrying the raw sampling ratio of ratio based samplers.
pub const SAMPLING_RATIO_KEY: &str = "sampling-ratio";
/// Attribute carrying the [`RecordingMode`] of ratio based samplers.
pub const SAMPLING_MODE_KEY: &str = "sampling-mode";

/// Largest geometric random value a fresh draw can produce.
pub(crate) const MAX_DRAWN_GEOMETRIC_RANDOM_VALUE: u8 = 62;

/// A sampling rate encoded as a power of two.
///
/// Exponent `1` keeps every span, `k` in `2..=62` keeps a span with
/// probability `2^-(k-1)` and `63` never keeps a span.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RateExponent(pub(crate) u8);

impl RateExponent {
    /// Always keep.
    pub const ALWAYS: RateExponent = RateExponent(1);
    /// Never keep.
    pub const NEVER: RateExponent = RateExponent(63);

    /// Returns the raw exponent.
    pub fn value(self) -> u8 {
        self.0
    }

    /// Returns the sampling probability represented by this exponent.
    pub fn sampling_rate(self) -> f64 {
        if self == Self::NEVER {
            0.0
        } else {
            // exact for every exponent below 63
            1.0 / (1u64 << (self.0 - 1)) as f64
        }
    }
}

impl TryFrom<u8> for RateExponent {
    type Error = SamplingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::ALWAYS.0..=Self::NEVER.0).contains(&value) {
            Ok(RateExponent(value))
        } else {
            Err(SamplingError::InvalidRateExponent(value))
        }
    }
}

impl fmt::Display for RateExponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

fn parse_in_range(trace_state: &TraceState, key: &'static str, max: u8) -> Option<u8> {
    let raw = trace_state.get(key)?;
    match raw.parse::<u8>() {
        Ok(value) if (1..=max).contains(&value) => Some(value),
        _ => {
            otel_debug!(
                name: "ConsistentSampler.TraceState.MalformedValue",
                key = key,
                value = raw.to_string()
            );
            None
        }
    }
}

/// Reads the geometric random value, valid in `[1, 63]`.
pub fn geometric_random_value(trace_state: &TraceState) -> Option<u8> {
    parse_in_range(trace_state, GEOMETRIC_RANDOM_VALUE_KEY, RateExponent::NEVER.0)
}

/// Reads the rate exponent, valid in `[1, 63]`.
pub fn rate_exponent(trace_state: &TraceState) -> Option<RateExponent> {
    parse_in_range(trace_state, RATE_EXPONENT_KEY, RateExponent::NEVER.0).map(RateExponent)
}

/// Reads the number of dropped ancestors.
pub fn number_dropped_ancestors(trace_state: &TraceState) -> Option<u64> {
    let raw = trace_state.get(NUMBER_DROPPED_ANCESTORS_KEY)?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            otel_debug!(
                name: "ConsistentSampler.TraceState.MalformedValue",
                key = NUMBER_DROPPED_ANCESTORS_KEY,
                value = raw.to_string()
            );
            None
        }
    }
}

/// Reads the span id of the nearest sampled ancestor.
pub fn sampled_ancestor_span_id(trace_state: &TraceState) -> Option<SpanId> {
    let raw = trace_state.get(SAMPLED_ANCESTOR_SPAN_ID_KEY)?;
    match SpanId::from_hex(raw) {
        Ok(span_id) => Some(span_id),
        Err(_) => {
            otel_debug!(
                name: "ConsistentSampler.TraceState.MalformedValue",
                key = SAMPLED_ANCESTOR_SPAN_ID_KEY,
                value = raw.to_string()
            );
            None
        }
    }
}

pub(crate) fn put(trace_state: TraceState, key: &'static str, value: String) -> TraceState {
    match trace_state.insert(key, value) {
        Ok(updated) => updated,
        Err(err) => {
            otel_debug!(
                name: "ConsistentSampler.TraceState.WriteFailed",
                key = key,
                error = err.to_string()
            );
            trace_state
        }
    }
}

pub(crate) fn remove(trace_state: TraceState, key: &'static str) -> TraceState {
    match trace_state.delete(key) {
        Ok(updated) => updated,
        Err(err) => {
            otel_debug!(
                name: "ConsistentSampler.TraceState.WriteFailed",
                key = key,
                error = err.to_string()
            );
            trace_state
        }
    }
}

/// Removes both ancestor tracking keys, as done for every kept span.
pub(crate) fn clear_ancestors(trace_state: TraceState) -> TraceState {
    let trace_state = remove(trace_state, NUMBER_DROPPED_ANCESTORS_KEY);
    remove(trace_state, SAMPLED_ANCESTOR_SPAN_ID_KEY)
}

/// Maintains the ancestor tracking keys of a dropped span.
///
/// `parent` is the state inherited from the parent span and `parent_span_id`
/// the id of that parent, [`SpanId::INVALID`] for a root.
pub(crate) fn track_dropped_ancestor(
    trace_state: TraceState,
    parent: &TraceState,
    parent_span_id: SpanId,
    mode: RecordingMode,
) -> TraceState {
    let trace_state = if mode.collect_ancestor_distance() {
        let dropped = number_dropped_ancestors(parent).unwrap_or(0);
        put(
            trace_state,
            NUMBER_DROPPED_ANCESTORS_KEY,
            dropped.saturating_add(1).to_string(),
        )
    } else {
        remove(trace_state, NUMBER_DROPPED_ANCESTORS_KEY)
    };

    if mode.collect_ancestor_link() {
        let ancestor = sampled_ancestor_span_id(parent).unwrap_or(parent_span_id);
        put(
            trace_state,
            SAMPLED_ANCESTOR_SPAN_ID_KEY,
            ancestor.to_string(),
        )
    } else {
        remove(trace_state, SAMPLED_ANCESTOR_SPAN_ID_KEY)
    }
}

/// Builds the published state of a kept span.
pub(crate) fn record_kept(
    parent: &TraceState,
    geometric_random_value: u8,
    rate_exponent: RateExponent,
) -> TraceState {
    let trace_state = put(
        parent.clone(),
        GEOMETRIC_RANDOM_VALUE_KEY,
        geometric_random_value.to_string(),
    );
    let trace_state = put(trace_state, RATE_EXPONENT_KEY, rate_exponent.to_string());
    clear_ancestors(trace_state)
}

/// The ancestor fields a kept span inherited, as span attributes.
///
/// Kept spans clear these keys from the state they publish, so exporters only
/// see the link to the nearest sampled ancestor through the attributes.
pub(crate) fn ancestor_attributes(parent: &TraceState) -> Vec<KeyValue> {
    let mut attributes = Vec::new();
    if let Some(dropped) = number_dropped_ancestors(parent) {
        attributes.push(KeyValue::new(
            NUMBER_DROPPED_ANCESTORS_KEY,
            dropped.to_string(),
        ));
    }
    if let Some(ancestor) = sampled_ancestor_span_id(parent) {
        attributes.push(KeyValue::new(
            SAMPLED_ANCESTOR_SPAN_ID_KEY,
            ancestor.to_string(),
        ));
    }
    attributes
}

/// Whether `key` names one of the ancestor tracking fields.
pub(crate) fn is_ancestor_key(key: &str) -> bool {
    key == NUMBER_DROPPED_ANCESTORS_KEY || key == SAMPLED_ANCESTOR_SPAN_ID_KEY
}

/// Rebuilds the inherited ancestor fields from exported span attributes.
pub(crate) fn ancestor_state(attributes: &[KeyValue]) -> TraceState {
    attributes
        .iter()
        .fold(TraceState::default(), |trace_state, kv| match kv.key.as_str() {
            NUMBER_DROPPED_ANCESTORS_KEY => put(
                trace_state,
                NUMBER_DROPPED_ANCESTORS_KEY,
                kv.value.as_str().into_owned(),
            ),
            SAMPLED_ANCESTOR_SPAN_ID_KEY => put(
                trace_state,
                SAMPLED_ANCESTOR_SPAN_ID_KEY,
                kv.value.as_str().into_owned(),
            ),
            _ => trace_state,
        })
}

/// Builds the published state of a dropped span.
pub(crate) fn record_dropped(
    parent: &TraceState,
    parent_span_id: SpanId,
    geometric_random_value: u8,
    rate_exponent: RateExponent,
    mode: RecordingMode,
) -> TraceState {
    let trace_state = put(
        parent.clone(),
        GEOMETRIC_RANDOM_VALUE_KEY,
        geometric_random_value.to_string(),
    );
    let trace_state = put(trace_state, RATE_EXPONENT_KEY, rate_exponent.to_string());
    track_dropped_ancestor(trace_state, parent, parent_span_id, mode)
}
