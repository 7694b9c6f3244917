//! A memory bounded sample of a stream of items with per-item sampling rates.
//!
//! Every item comes with the greatest sample rate index at which it is still
//! eligible, typically derived from a random value attached to the item. The
//! reservoir keeps at most `capacity` items and coarsens its own sample rate
//! index whenever it runs out of room, so that each retained item can later
//! be extrapolated by the reciprocal of the sample rate it was retained at.
use std::{fmt, mem};

use rand::Rng;

use crate::SamplingError;

/// An item retained by a [`ReservoirSampler`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample<T> {
    /// The retained item.
    pub item: T,
    /// Index of the sample rate the item was retained at.
    pub sample_rate_index: u32,
}

/// The sample rate `2^-index`.
pub fn power_of_two_sample_rate(index: u32) -> f64 {
    (-f64::from(index)).exp2()
}

type GreatestSampleRateIndexFn<T> = Box<dyn Fn(&T) -> u32 + Send + Sync>;
type SampleRateFn = Box<dyn Fn(u32) -> f64 + Send + Sync>;

/// Reservoir sampler over items with individual eligible sample rates.
///
/// Once full, the buffer is split at a separator. Items before the separator
/// are retained at the current sample rate index, items from the separator on
/// at the previous, one step finer, index. Every item in either region is
/// eligible at the index of its region.
///
/// The sampler is not synchronized. Concurrent producers need to wrap it in a
/// lock or feed it from a single task.
pub struct ReservoirSampler<T, R> {
    buffer: Vec<T>,
    capacity: usize,
    separator: usize,
    sample_rate_index: u32,
    counter: u64,
    greatest_sample_rate_index: GreatestSampleRateIndexFn<T>,
    sample_rate: SampleRateFn,
    rng: R,
}

impl<T, R: Rng> ReservoirSampler<T, R> {
    /// Creates an empty reservoir.
    ///
    /// `greatest_sample_rate_index` returns the greatest index at which an
    /// item is still eligible. `sample_rate` maps indices to a descending
    /// sequence of sample rates starting at exactly `1.0` for index `0`.
    pub fn new<G, S>(
        capacity: usize,
        greatest_sample_rate_index: G,
        sample_rate: S,
        rng: R,
    ) -> Result<Self, SamplingError>
    where
        G: Fn(&T) -> u32 + Send + Sync + 'static,
        S: Fn(u32) -> f64 + Send + Sync + 'static,
    {
        if capacity == 0 {
            return Err(SamplingError::InvalidCapacity);
        }
        let base_rate = sample_rate(0);
        if base_rate != 1.0 {
            return Err(SamplingError::InvalidBaseSampleRate(base_rate));
        }
        Ok(ReservoirSampler {
            buffer: Vec::with_capacity(capacity),
            capacity,
            separator: 0,
            sample_rate_index: 0,
            counter: 0,
            greatest_sample_rate_index: Box::new(greatest_sample_rate_index),
            sample_rate: Box::new(sample_rate),
            rng,
        })
    }

    /// Offers an item to the reservoir.
    ///
    /// # Errors
    ///
    /// Fails when the reservoir would have to coarsen past the last index with
    /// a positive sample rate, which happens when items claim to be eligible
    /// at every index.
    pub fn add(&mut self, mut item: T) -> Result<(), SamplingError> {
        if self.sample_rate_index == 0 {
            self.buffer.push(item);
            if self.buffer.len() == self.capacity {
                self.coarsen()?;
            }
            return Ok(());
        }

        // eligible at the finer of the two buffer indices
        while (self.greatest_sample_rate_index)(&item).saturating_add(1) >= self.sample_rate_index
        {
            self.counter += 1;
            let separator = self.separator as u64;
            let slot = self.rng.random_range(separator..separator + self.counter);
            if let Ok(slot) = usize::try_from(slot) {
                if slot < self.capacity {
                    mem::swap(&mut self.buffer[slot], &mut item);
                }
            }

            while self.separator < self.capacity
                && (self.greatest_sample_rate_index)(&item) >= self.sample_rate_index
            {
                let slot = self.rng.random_range(self.separator..self.capacity);
                self.buffer.swap(slot, self.separator);
                mem::swap(&mut self.buffer[self.separator], &mut item);
                self.separator += 1;
            }

            if self.separator < self.capacity {
                break;
            }
            self.coarsen()?;
        }
        Ok(())
    }

    fn coarsen(&mut self) -> Result<(), SamplingError> {
        let next = self
            .sample_rate_index
            .checked_add(1)
            .filter(|&next| (self.sample_rate)(next) > 0.0)
            .ok_or_else(|| {
                SamplingError::InconsistentReservoir(format!(
                    "cannot coarsen beyond sample rate index {}",
                    self.sample_rate_index
                ))
            })?;
        self.separator = 0;
        self.sample_rate_index = next;
        self.counter = self.capacity as u64;
        Ok(())
    }

    /// The retained items with the sample rate index they were retained at.
    pub fn samples(&self) -> impl Iterator<Item = Sample<&T>> + '_ {
        self.buffer.iter().enumerate().map(|(position, item)| Sample {
            item,
            sample_rate_index: self.region_index(position),
        })
    }

    /// Consumes the reservoir and returns the retained items.
    pub fn into_samples(self) -> Vec<Sample<T>> {
        let separator = self.separator;
        let index = self.sample_rate_index;
        self.buffer
            .into_iter()
            .enumerate()
            .map(|(position, item)| Sample {
                item,
                sample_rate_index: if index == 0 || position < separator {
                    index
                } else {
                    index - 1
                },
            })
            .collect()
    }

    fn region_index(&self, position: usize) -> u32 {
        if self.sample_rate_index == 0 || position < self.separator {
            self.sample_rate_index
        } else {
            self.sample_rate_index - 1
        }
    }

    /// The sample rate of an index.
    pub fn sample_rate(&self, sample_rate_index: u32) -> f64 {
        (self.sample_rate)(sample_rate_index)
    }

    /// Number of retained items.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether no item has been retained yet.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Maximum number of retained items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Verifies the buffer invariants.
    pub fn check_consistency(&self) -> Result<(), SamplingError> {
        if self.sample_rate_index == 0 {
            if self.buffer.len() >= self.capacity {
                return Err(SamplingError::InconsistentReservoir(format!(
                    "{} items at the base rate exceed the capacity of {}",
                    self.buffer.len(),
                    self.capacity
                )));
            }
            return Ok(());
        }

        if self.buffer.len() != self.capacity {
            return Err(SamplingError::InconsistentReservoir(format!(
                "coarsened reservoir holds {} of {} items",
                self.buffer.len(),
                self.capacity
            )));
        }
        if self.separator >= self.capacity {
            return Err(SamplingError::InconsistentReservoir(format!(
                "separator {} is out of bounds",
                self.separator
            )));
        }
        for (position, item) in self.buffer.iter().enumerate() {
            let required = self.region_index(position);
            let greatest = (self.greatest_sample_rate_index)(item);
            if greatest < required {
                return Err(SamplingError::InconsistentReservoir(format!(
                    "item at {position} is eligible up to index {greatest} but kept at {required}"
                )));
            }
        }
        Ok(())
    }
}

impl<T: fmt::Debug, R> fmt::Debug for ReservoirSampler<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservoirSampler")
            .field("capacity", &self.capacity)
            .field("separator", &self.separator)
            .field("sample_rate_index", &self.sample_rate_index)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    /// Items eligible at index `k` with probability `2^-k`.
    fn leading_zeros(value: &u64) -> u32 {
        value.leading_zeros()
    }

    #[test]
    fn rejects_invalid_arguments() {
        assert_eq!(
            ReservoirSampler::<u64, _>::new(
                0,
                leading_zeros,
                power_of_two_sample_rate,
                StdRng::seed_from_u64(0)
            )
            .err(),
            Some(SamplingError::InvalidCapacity)
        );
        assert_eq!(
            ReservoirSampler::<u64, _>::new(
                4,
                leading_zeros,
                |index| 0.5 * power_of_two_sample_rate(index),
                StdRng::seed_from_u64(0)
            )
            .err(),
            Some(SamplingError::InvalidBaseSampleRate(0.5))
        );
    }

    #[test]
    fn power_of_two_rates() {
        assert_eq!(power_of_two_sample_rate(0), 1.0);
        assert_eq!(power_of_two_sample_rate(1), 0.5);
        assert_eq!(power_of_two_sample_rate(10), 1.0 / 1024.0);
    }

    #[test]
    fn keeps_everything_until_full() {
        let mut reservoir =
            ReservoirSampler::new(4, leading_zeros, power_of_two_sample_rate, StdRng::seed_from_u64(1))
                .unwrap();
        for value in [1u64, 2, 3] {
            reservoir.add(value).unwrap();
        }

        assert_eq!(reservoir.len(), 3);
        assert_eq!(
            reservoir.samples().collect::<Vec<_>>(),
            vec![
                Sample { item: &1, sample_rate_index: 0 },
                Sample { item: &2, sample_rate_index: 0 },
                Sample { item: &3, sample_rate_index: 0 },
            ]
        );
        reservoir.check_consistency().unwrap();
    }

    #[test]
    fn never_exceeds_capacity_and_stays_consistent() {
        let mut data = StdRng::seed_from_u64(234);
        let mut reservoir = ReservoirSampler::new(
            20,
            leading_zeros,
            power_of_two_sample_rate,
            StdRng::seed_from_u64(0),
        )
        .unwrap();
        reservoir.check_consistency().unwrap();

        for _ in 0..10_000 {
            reservoir.add(data.random::<u64>()).unwrap();
            reservoir.check_consistency().unwrap();
            assert!(reservoir.len() <= reservoir.capacity());
        }
        assert_eq!(reservoir.len(), 20);
        assert!(reservoir.samples().all(|sample| sample.sample_rate_index > 0));
    }

    #[test]
    fn items_eligible_everywhere_stop_at_the_last_positive_rate() {
        let mut reservoir = ReservoirSampler::new(
            2,
            |_: &u64| u32::MAX,
            power_of_two_sample_rate,
            StdRng::seed_from_u64(4),
        )
        .unwrap();
        reservoir.add(1).unwrap();
        reservoir.add(2).unwrap();

        assert!(matches!(
            reservoir.add(3),
            Err(SamplingError::InconsistentReservoir(_))
        ));
        assert_eq!(reservoir.len(), 2);
        assert!(power_of_two_sample_rate(reservoir.sample_rate_index) > 0.0);
    }

    #[test]
    fn extrapolated_counts_are_unbiased() {
        let capacity = 10;
        let items = 100;
        let trials = 20_000;
        let mut rng = StdRng::seed_from_u64(0x88e2_3b99_0958_cdcd);

        let mut totals = Vec::with_capacity(trials);
        let mut first_halves = Vec::with_capacity(trials);
        for _ in 0..trials {
            let mut reservoir = ReservoirSampler::new(
                capacity,
                |item: &(usize, u32)| item.1,
                power_of_two_sample_rate,
                StdRng::from_rng(&mut rng),
            )
            .unwrap();
            for idx in 0..items {
                reservoir.add((idx, rng.random::<u64>().leading_zeros())).unwrap();
            }

            let mut total = 0.0;
            let mut first_half = 0.0;
            for sample in reservoir.into_samples() {
                let factor = 1.0 / power_of_two_sample_rate(sample.sample_rate_index);
                total += factor;
                if sample.item.0 < items / 2 {
                    first_half += factor;
                }
            }
            totals.push(total);
            first_halves.push(first_half);
        }

        for (values, expected) in [(totals, items as f64), (first_halves, items as f64 / 2.0)] {
            let n = values.len() as f64;
            let mean = values.iter().sum::<f64>() / n;
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
            let tolerance = 4.75342 * (variance / n).sqrt();
            assert!(
                (mean - expected).abs() < tolerance,
                "mean {mean}, expected {expected}, tolerance {tolerance}"
            );
        }
    }
}
