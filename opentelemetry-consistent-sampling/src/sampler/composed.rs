use crate::{
    random::RandomBitSource,
    sampler::{RateExponentPolicy, SamplingRequest},
    trace_state::RateExponent,
};

/// Samples a span if either of two policies would sample it.
///
/// The smaller of the two rate exponents wins. Since every decision compares
/// the same inherited random value, this keeps exactly the spans kept by
/// at least one of the two policies.
#[derive(Clone, Debug)]
pub struct Composed<A, B> {
    first: A,
    second: B,
}

impl<A: RateExponentPolicy, B: RateExponentPolicy> Composed<A, B> {
    /// Combines `first` and `second`.
    pub fn new(first: A, second: B) -> Self {
        Composed { first, second }
    }
}

impl<A: RateExponentPolicy, B: RateExponentPolicy> RateExponentPolicy for Composed<A, B> {
    fn rate_exponent(
        &self,
        request: &SamplingRequest<'_>,
        random: &dyn RandomBitSource,
    ) -> RateExponent {
        let first = self.first.rate_exponent(request, random);
        let second = self.second.rate_exponent(request, random);
        first.min(second)
    }

    fn description(&self) -> String {
        format!(
            "ConsistentComposedOr{{{}, {}}}",
            self.first.description(),
            self.second.description()
        )
    }
}
