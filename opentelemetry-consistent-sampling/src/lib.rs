//! # OpenTelemetry Consistent Sampling
//!
//! Samplers for the OpenTelemetry SDK that make consistent keep or drop
//! decisions across all spans of a trace, and the tools to estimate
//! population quantities from the traces sampled that way.
//!
//! Every trace carries a geometric random value in its [`TraceState`], drawn
//! at the root and inherited by all descendants. A span is kept when this
//! value reaches the rate exponent chosen for it, so all spans of a trace
//! agree on which sampling rates keep the trace. Dropped spans hand the id of
//! their nearest sampled ancestor, and the number of spans dropped in between,
//! down to their children, so sampled spans can still be arranged into trees.
//!
//! ```
//! use opentelemetry::trace::{Tracer, TracerProvider as _};
//! use opentelemetry_consistent_sampling::{
//!     ConsistentSampler, FixedRate, RateExponentPolicy, SkipPeriod,
//! };
//! use opentelemetry_sdk::trace::SdkTracerProvider;
//! use std::time::Duration;
//!
//! // keep a quarter of the spans, plus one span per second
//! let policy = FixedRate::new(0.25)
//!     .unwrap()
//!     .or(SkipPeriod::new(Duration::from_secs(1)));
//! let provider = SdkTracerProvider::builder()
//!     .with_sampler(ConsistentSampler::new(policy))
//!     .build();
//!
//! provider.tracer("example").in_span("operation", |_cx| {});
//! ```
//!
//! Sampled spans are analysed offline with [`down_sample`], [`estimate`],
//! [`estimate_vector`] and [`extract_trees`]. [`reservoir::ReservoirSampler`]
//! bounds the memory needed to collect them.
//!
//! [`TraceState`]: opentelemetry::trace::TraceState
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]
#![doc(
    html_logo_url = "https://raw.githubusercontent.com/open-telemetry/opentelemetry-rust/main/assets/logo.svg"
)]

pub mod config;
mod downsample;
mod error;
pub mod estimation;
pub mod random;
mod recording_mode;
pub mod reservoir;
pub mod sampler;
mod span;
pub mod trace_state;
mod tree;

pub use config::{Config, SamplerKind};
pub use downsample::down_sample;
pub use error::SamplingError;
pub use estimation::{estimate, estimate_vector};
pub use recording_mode::RecordingMode;
pub use sampler::{
    Composed, ConsistentSampler, FixedRate, RateExponentPolicy, SamplingRequest, SkipPeriod,
    TraceIdRatioSampler,
};
pub use span::SpanRecord;
pub use trace_state::RateExponent;
pub use tree::{extract_trees, TraceTree, TreeNode};
