//! Bounded FIFO histories for rolling averages

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// FIFO of the newest `N` observations, ordered oldest→newest.
///
/// Serializes as a plain array. Deserializing an over-long array keeps only
/// the newest `N` entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<f64>", into = "Vec<f64>")]
pub struct History<const N: usize> {
    values: VecDeque<f64>,
}

impl<const N: usize> History<N> {
    pub fn new() -> Self {
        Self {
            values: VecDeque::with_capacity(N),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Append, evicting the oldest entry when full
    pub fn push(&mut self, value: f64) {
        if self.values.len() == N {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    /// Append; the very first value is written `copies` times.
    ///
    /// Lets short rolling averages report immediately instead of waiting for
    /// enough laps to fill the window.
    pub fn push_prefilled(&mut self, value: f64, copies: usize) {
        let times = if self.values.is_empty() { copies.max(1) } else { 1 };
        for _ in 0..times {
            self.push(value);
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn latest(&self) -> Option<f64> {
        self.values.back().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().copied()
    }

    /// Mean of the newest `n` entries, `None` until at least `n` exist
    pub fn mean_last(&self, n: usize) -> Option<f64> {
        if n == 0 || self.values.len() < n {
            return None;
        }
        Some(running_mean(self.values.iter().skip(self.values.len() - n).copied()))
    }

    /// Mean of everything held, `None` when empty
    pub fn mean(&self) -> Option<f64> {
        self.mean_last(self.values.len())
    }
}

// Incremental mean: identical inputs average to exactly that input.
fn running_mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut mean = 0.0;
    for (i, v) in values.enumerate() {
        mean += (v - mean) / (i + 1) as f64;
    }
    mean
}

impl<const N: usize> From<Vec<f64>> for History<N> {
    fn from(values: Vec<f64>) -> Self {
        let skip = values.len().saturating_sub(N);
        Self {
            values: values.into_iter().skip(skip).collect(),
        }
    }
}

impl<const N: usize> From<History<N>> for Vec<f64> {
    fn from(history: History<N>) -> Self {
        history.values.into_iter().collect()
    }
}
