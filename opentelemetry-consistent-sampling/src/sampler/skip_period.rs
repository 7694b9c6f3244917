use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use crate::{
    random::RandomBitSource,
    sampler::{RateExponentPolicy, SamplingRequest},
    trace_state::RateExponent,
};

/// Keeps at most one span per period of wall-clock time.
///
/// The first span asking after the period has elapsed is always kept, every
/// other span is always dropped. Clones share the same period budget.
#[derive(Clone, Debug)]
pub struct SkipPeriod {
    period_millis: u64,
    next_allowed_millis: Arc<AtomicU64>,
}

impl SkipPeriod {
    /// Creates the policy with the given period.
    pub fn new(period: Duration) -> Self {
        SkipPeriod {
            period_millis: u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            next_allowed_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The period between two kept spans.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_millis)
    }

    /// Returns the exponent for a span created at `now_millis` since the epoch.
    pub(crate) fn rate_exponent_at(&self, now_millis: u64) -> RateExponent {
        let mut next_allowed = self.next_allowed_millis.load(Ordering::Acquire);
        loop {
            if now_millis < next_allowed {
                return RateExponent::NEVER;
            }
            match self.next_allowed_millis.compare_exchange_weak(
                next_allowed,
                now_millis.saturating_add(self.period_millis),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return RateExponent::ALWAYS,
                Err(actual) => next_allowed = actual,
            }
        }
    }
}

impl RateExponentPolicy for SkipPeriod {
    fn rate_exponent(
        &self,
        _request: &SamplingRequest<'_>,
        _random: &dyn RandomBitSource,
    ) -> RateExponent {
        let now_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        self.rate_exponent_at(now_millis)
    }

    fn description(&self) -> String {
        format!("ConsistentSkipPeriod{{{}ms}}", self.period_millis)
    }
}
