use opentelemetry::trace::{SpanId, TraceId};
use thiserror::Error;

/// Errors returned when a sampler, estimator or reservoir is used outside of
/// its contract.
///
/// Malformed values found in an inherited trace state are never reported
/// through this type. They are treated as absent instead.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum SamplingError {
    /// A sampling probability was outside of `[0, 1]` or not a number.
    #[error("sampling probability must be within [0, 1], got {0}")]
    InvalidProbability(f64),

    /// A rate exponent was outside of `[1, 63]`.
    #[error("sampling rate exponent must be within [1, 63], got {0}")]
    InvalidRateExponent(u8),

    /// Spans handed to a per-trace operation belong to different traces.
    #[error("spans belong to more than one trace ({first} and {second})")]
    MultipleTraces {
        /// Trace id of the first span in the collection.
        first: TraceId,
        /// First trace id that differs from `first`.
        second: TraceId,
    },

    /// A span carries neither a valid rate exponent nor a positive sampling ratio.
    #[error("span {0} carries no usable sampling rate")]
    MissingSamplingRate(SpanId),

    /// A span collection mixes exponent based and ratio based sampling rates.
    #[error("spans mix exponent based and ratio based sampling rates")]
    MixedRateEncodings,

    /// A reservoir was created without room for a single item.
    #[error("reservoir capacity must be greater than zero")]
    InvalidCapacity,

    /// The sample rate of a reservoir's finest rate index was not exactly one.
    #[error("sample rate at index 0 must be exactly 1.0, got {0}")]
    InvalidBaseSampleRate(f64),

    /// A reservoir's internal buffer invariant does not hold.
    #[error("reservoir invariant violated: {0}")]
    InconsistentReservoir(String),

    /// A configuration value could not be turned into a sampler.
    #[error("invalid sampler configuration: {0}")]
    InvalidConfiguration(String),
}
