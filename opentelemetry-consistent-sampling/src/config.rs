//! Sampler configuration
//!
//! The default configuration is read from the environment:
//!
//! | Variable | Values |
//! |---|---|
//! | `OTEL_TRACES_SAMPLER` | `consistent_fixed_rate`, `consistent_traceidratio`, `consistent_skip_period` |
//! | `OTEL_TRACES_SAMPLER_ARG` | sampling probability, or the period in milliseconds for `consistent_skip_period` |
//! | `OTEL_TRACES_SAMPLER_RECORDING_MODE` | `parent_link`, `ancestor_link`, `ancestor_link_and_distance` |
//!
//! Missing or invalid values fall back to a fixed rate of `1.0` with ancestor
//! links and distances recorded.
use std::{env, time::Duration};

use opentelemetry::otel_warn;
use opentelemetry_sdk::trace::ShouldSample;

use crate::{ConsistentSampler, RecordingMode, SamplingError, TraceIdRatioSampler};

/// Environment variable selecting the sampler.
pub const OTEL_TRACES_SAMPLER: &str = "OTEL_TRACES_SAMPLER";
/// Environment variable carrying the sampler argument.
pub const OTEL_TRACES_SAMPLER_ARG: &str = "OTEL_TRACES_SAMPLER_ARG";
/// Environment variable selecting the recording mode.
pub const OTEL_TRACES_SAMPLER_RECORDING_MODE: &str = "OTEL_TRACES_SAMPLER_RECORDING_MODE";

/// The sampler to build.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum SamplerKind {
    /// A [`ConsistentSampler`] with a fixed sampling probability.
    FixedRate(f64),
    /// A [`TraceIdRatioSampler`] with the given ratio.
    TraceIdRatio(f64),
    /// A [`ConsistentSampler`] keeping one span per period.
    SkipPeriod(Duration),
}

/// Sampler configuration
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub struct Config {
    /// The sampler to build
    pub sampler: SamplerKind,

    /// What dropped spans record about their ancestors
    pub recording_mode: RecordingMode,
}

impl Default for Config {
    /// Create the configuration from the environment.
    fn default() -> Self {
        let mut config = Config {
            sampler: SamplerKind::FixedRate(1.0),
            recording_mode: RecordingMode::default(),
        };

        if let Ok(mode) = env::var(OTEL_TRACES_SAMPLER_RECORDING_MODE) {
            match mode.parse::<RecordingMode>() {
                Ok(mode) => config.recording_mode = mode,
                Err(_) => {
                    otel_warn!(
                        name: "ConsistentSampler.Config.InvalidRecordingMode",
                        message = "OTEL_TRACES_SAMPLER_RECORDING_MODE must be one of parent_link, ancestor_link or ancestor_link_and_distance. Falling back to ancestor_link_and_distance",
                        otel_traces_sampler_recording_mode = mode.as_str()
                    );
                }
            }
        }

        let sampler_arg = env::var(OTEL_TRACES_SAMPLER_ARG).ok();
        if let Ok(sampler) = env::var(OTEL_TRACES_SAMPLER) {
            config.sampler = match sampler.as_str() {
                "consistent_fixed_rate" => {
                    SamplerKind::FixedRate(probability_arg(sampler_arg.as_deref(), &sampler))
                }
                "consistent_traceidratio" => {
                    SamplerKind::TraceIdRatio(probability_arg(sampler_arg.as_deref(), &sampler))
                }
                "consistent_skip_period" => {
                    match sampler_arg.as_deref().and_then(|arg| arg.parse::<u64>().ok()) {
                        Some(millis) => SamplerKind::SkipPeriod(Duration::from_millis(millis)),
                        None => {
                            otel_warn!(
                                name: "ConsistentSampler.Config.InvalidSamplerArgument",
                                message = "OTEL_TRACES_SAMPLER is set to 'consistent_skip_period' but OTEL_TRACES_SAMPLER_ARG is missing or not a period in milliseconds. Falling back to consistent_fixed_rate with probability 1.0",
                                otel_traces_sampler_arg = format!("{:?}", sampler_arg)
                            );
                            SamplerKind::FixedRate(1.0)
                        }
                    }
                }
                s => {
                    otel_warn!(
                        name: "ConsistentSampler.Config.InvalidSamplerType",
                        message = format!(
                            "Unrecognized sampler type '{}' in OTEL_TRACES_SAMPLER environment variable. Valid values are: consistent_fixed_rate, consistent_traceidratio, consistent_skip_period. Falling back to consistent_fixed_rate with probability 1.0",
                            s
                        ),
                    );
                    SamplerKind::FixedRate(1.0)
                }
            };
        }

        config
    }
}

fn probability_arg(arg: Option<&str>, sampler: &str) -> f64 {
    match arg.and_then(|arg| arg.parse::<f64>().ok()) {
        Some(probability) if (0.0..=1.0).contains(&probability) => probability,
        _ => {
            otel_warn!(
                name: "ConsistentSampler.Config.InvalidSamplerArgument",
                message = format!(
                    "OTEL_TRACES_SAMPLER is set to '{}' but OTEL_TRACES_SAMPLER_ARG is missing or not a probability between 0.0 and 1.0. Falling back to probability 1.0",
                    sampler
                ),
                otel_traces_sampler_arg = format!("{:?}", arg)
            );
            1.0
        }
    }
}

impl Config {
    /// Replaces the sampler kind.
    pub fn with_sampler(mut self, sampler: SamplerKind) -> Self {
        self.sampler = sampler;
        self
    }

    /// Replaces the recording mode.
    pub fn with_recording_mode(mut self, recording_mode: RecordingMode) -> Self {
        self.recording_mode = recording_mode;
        self
    }

    /// Builds the configured sampler, ready to be installed on a tracer provider.
    pub fn build_sampler(&self) -> Result<Box<dyn ShouldSample>, SamplingError> {
        Ok(match self.sampler {
            SamplerKind::FixedRate(probability) => Box::new(
                ConsistentSampler::fixed_rate(probability)?
                    .with_recording_mode(self.recording_mode),
            ),
            SamplerKind::TraceIdRatio(ratio) => {
                Box::new(TraceIdRatioSampler::new(ratio, self.recording_mode)?)
            }
            SamplerKind::SkipPeriod(period) => Box::new(
                ConsistentSampler::skip_period(period).with_recording_mode(self.recording_mode),
            ),
        })
    }
}
