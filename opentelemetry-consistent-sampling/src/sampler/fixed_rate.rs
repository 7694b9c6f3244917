use crate::{
    random::RandomBitSource,
    sampler::{RateExponentPolicy, SamplingRequest},
    trace_state::RateExponent,
    SamplingError,
};

/// Samples spans with a fixed probability.
///
/// Probabilities that are not a power of two are realized by mixing the two
/// neighbouring exponents, so the expected sampling rate equals the requested
/// probability exactly.
#[derive(Clone, Debug, PartialEq)]
pub struct FixedRate {
    probability: f64,
    lower_bound_exponent: RateExponent,
    upper_bound_exponent: RateExponent,
    probability_to_use_lower_bound: f64,
}

impl FixedRate {
    /// Creates the policy, failing for probabilities outside of `[0, 1]`.
    pub fn new(probability: f64) -> Result<Self, SamplingError> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(SamplingError::InvalidProbability(probability));
        }

        let rate = |exponent: u8| RateExponent(exponent).sampling_rate();

        let mut lower = RateExponent::ALWAYS.0;
        while lower < RateExponent::NEVER.0 && rate(lower + 1) >= probability {
            lower += 1;
        }
        let mut upper = RateExponent::NEVER.0;
        while upper > RateExponent::ALWAYS.0 && rate(upper - 1) <= probability {
            upper -= 1;
        }

        let probability_to_use_lower_bound = if lower == upper {
            1.0
        } else {
            (probability - rate(upper)) / (rate(lower) - rate(upper))
        };

        Ok(FixedRate {
            probability,
            lower_bound_exponent: RateExponent(lower),
            upper_bound_exponent: RateExponent(upper),
            probability_to_use_lower_bound,
        })
    }

    /// The requested sampling probability.
    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// The exponent with the higher sampling rate of the two brackets.
    pub fn lower_bound_exponent(&self) -> RateExponent {
        self.lower_bound_exponent
    }

    /// The exponent with the lower sampling rate of the two brackets.
    pub fn upper_bound_exponent(&self) -> RateExponent {
        self.upper_bound_exponent
    }

    /// Probability of choosing [`lower_bound_exponent`](Self::lower_bound_exponent).
    pub fn probability_to_use_lower_bound(&self) -> f64 {
        self.probability_to_use_lower_bound
    }
}

impl RateExponentPolicy for FixedRate {
    fn rate_exponent(
        &self,
        _request: &SamplingRequest<'_>,
        random: &dyn RandomBitSource,
    ) -> RateExponent {
        if self.lower_bound_exponent == self.upper_bound_exponent
            || bernoulli(self.probability_to_use_lower_bound, random)
        {
            self.lower_bound_exponent
        } else {
            self.upper_bound_exponent
        }
    }

    fn description(&self) -> String {
        format!("ConsistentFixedRate{{{}}}", self.probability)
    }
}

/// Returns `true` with probability `probability`, consuming one random bit
/// per binary digit of the probability that is inspected.
fn bernoulli(mut probability: f64, random: &dyn RandomBitSource) -> bool {
    loop {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        let upper_half = probability > 0.5;
        if random.next_bit() {
            return upper_half;
        }
        probability += probability;
        if upper_half {
            probability -= 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::SeededRandomBits;
    use opentelemetry::trace::TraceId;
    use rstest::rstest;

    #[rstest]
    #[case(-0.1)]
    #[case(1.5)]
    #[case(f64::NAN)]
    fn rejects_invalid_probability(#[case] probability: f64) {
        assert!(matches!(
            FixedRate::new(probability),
            Err(SamplingError::InvalidProbability(_))
        ));
    }

    #[rstest]
    #[case(1.0, 1, 1, 1.0)]
    #[case(0.5, 2, 2, 1.0)]
    #[case(0.25, 3, 3, 1.0)]
    #[case(0.3, 2, 3, 0.2)]
    #[case(0.75, 1, 2, 0.5)]
    #[case(0.0, 63, 63, 1.0)]
    fn brackets_probability(
        #[case] probability: f64,
        #[case] lower: u8,
        #[case] upper: u8,
        #[case] use_lower: f64,
    ) {
        let policy = FixedRate::new(probability).unwrap();
        assert_eq!(policy.lower_bound_exponent().value(), lower);
        assert_eq!(policy.upper_bound_exponent().value(), upper);
        assert!((policy.probability_to_use_lower_bound() - use_lower).abs() < 1e-12);
    }

    #[test]
    fn tiny_probability_mixes_with_never() {
        let policy = FixedRate::new(1e-30).unwrap();
        assert_eq!(policy.lower_bound_exponent().value(), 62);
        assert_eq!(policy.upper_bound_exponent(), RateExponent::NEVER);
    }

    #[rstest]
    #[case(0.0)]
    #[case(0.1)]
    #[case(0.5)]
    #[case(0.9)]
    #[case(1.0)]
    fn bernoulli_matches_probability(#[case] probability: f64) {
        let random = SeededRandomBits::new(17);
        let total = 100_000;
        let hits = (0..total).filter(|_| bernoulli(probability, &random)).count();
        let observed = hits as f64 / total as f64;

        let z = 4.75342;
        let tolerance = z * (probability * (1.0 - probability) / total as f64).sqrt();
        assert!(
            (observed - probability).abs() <= tolerance,
            "observed {observed}, expected {probability}, tolerance {tolerance}"
        );
    }

    #[test]
    fn expected_rate_matches_probability() {
        let policy = FixedRate::new(0.3).unwrap();
        let random = SeededRandomBits::new(5);
        let request = SamplingRequest::root(TraceId::from(1u128), "span");
        let total = 100_000;
        let mean = (0..total)
            .map(|_| policy.rate_exponent(&request, &random).sampling_rate())
            .sum::<f64>()
            / total as f64;
        // rates are 0.5 or 0.25, so the standard deviation is at most 0.125
        let tolerance = 4.75342 * 0.125 / (total as f64).sqrt();
        assert!((mean - 0.3).abs() < tolerance, "mean {mean}");
    }
}
