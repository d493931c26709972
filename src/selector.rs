//! Weighted random selection over a fixed list of weights.
//!
//! # Example
//!
//! ```rust
//! use rand::{rngs::StdRng, SeedableRng};
//! use swarmlet::selector::WeightedTable;
//!
//! let table = WeightedTable::new(&[80.0, 20.0]).unwrap();
//! let mut rng = StdRng::seed_from_u64(7);
//! let index = table.pick(&mut rng);
//! // 80% chance of 0, 20% chance of 1
//! assert!(index < 2);
//! ```

use rand::Rng;

#[derive(Debug, Clone)]
pub struct WeightedTable {
    cumulative_weights: Vec<f64>,
    total_weight: f64,
}

impl WeightedTable {
    /// Builds the cumulative table.
    ///
    /// Returns `None` for an empty list or any weight that is not positive
    /// and finite.
    pub fn new(weights: &[f64]) -> Option<Self> {
        if weights.is_empty() {
            return None;
        }

        let mut cumulative = Vec::with_capacity(weights.len());
        let mut sum = 0.0;
        for weight in weights {
            if !weight.is_finite() || *weight <= 0.0 {
                return None;
            }
            sum += weight;
            cumulative.push(sum);
        }

        Some(Self {
            cumulative_weights: cumulative,
            total_weight: sum,
        })
    }

    /// Picks an index with one random draw and a binary search.
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> usize {
        let random = rng.gen_range(0.0..self.total_weight);

        let index = self
            .cumulative_weights
            .binary_search_by(|weight| {
                if *weight <= random {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Greater
                }
            })
            .unwrap_or_else(|i| i);

        // Float rounding can put `random` on the last boundary.
        index.min(self.cumulative_weights.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.cumulative_weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cumulative_weights.is_empty()
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    /// Selection probability of each index.
    pub fn probabilities(&self) -> Vec<f64> {
        let mut previous = 0.0;
        self.cumulative_weights
            .iter()
            .map(|cumulative| {
                let p = (cumulative - previous) / self.total_weight;
                previous = *cumulative;
                p
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn rejects_bad_weights() {
        assert!(WeightedTable::new(&[]).is_none());
        assert!(WeightedTable::new(&[1.0, 0.0]).is_none());
        assert!(WeightedTable::new(&[-1.0]).is_none());
        assert!(WeightedTable::new(&[f64::NAN]).is_none());
        assert!(WeightedTable::new(&[f64::INFINITY]).is_none());
    }

    #[test]
    fn probabilities() {
        let table = WeightedTable::new(&[80.0, 15.0, 5.0]).unwrap();
        let probs = table.probabilities();
        assert!((probs[0] - 0.80).abs() < 0.001);
        assert!((probs[1] - 0.15).abs() < 0.001);
        assert!((probs[2] - 0.05).abs() < 0.001);
        assert_eq!(table.total_weight(), 100.0);
    }

    #[test]
    fn single_entry_always_wins() {
        let table = WeightedTable::new(&[3.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            assert_eq!(table.pick(&mut rng), 0);
        }
    }

    #[test]
    fn distribution_follows_weights() {
        let table = WeightedTable::new(&[3.0, 1.0]).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0usize; 2];
        for _ in 0..10_000 {
            counts[table.pick(&mut rng)] += 1;
        }
        let share = counts[0] as f64 / 10_000.0;
        assert!((0.72..0.78).contains(&share), "share was {}", share);
    }

    #[test]
    fn seeded_draws_are_reproducible() {
        let table = WeightedTable::new(&[1.0, 1.0, 1.0]).unwrap();
        let mut a = StdRng::seed_from_u64(9);
        let mut b = StdRng::seed_from_u64(9);
        let left: Vec<_> = (0..50).map(|_| table.pick(&mut a)).collect();
        let right: Vec<_> = (0..50).map(|_| table.pick(&mut b)).collect();
        assert_eq!(left, right);
    }
}
