use std::collections::VecDeque;
use std::ops::{Add, Div};

use serde::{Deserialize, Serialize};

use crate::config::METRIC_BUFFER_LEN;

/// Averaged evaluation results for one genome: cost, correct-answer cost and
/// accuracy (%) over the training buffers, then the same three over the
/// testing sections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub training_cost: f32,
    pub training_ca_cost: f32,
    pub training_accuracy: f32,
    pub testing_cost: f32,
    pub testing_ca_cost: f32,
    pub testing_accuracy: f32,
}

impl Add for Metrics {
    type Output = Metrics;

    fn add(self, other: Metrics) -> Metrics {
        Metrics {
            training_cost: self.training_cost + other.training_cost,
            training_ca_cost: self.training_ca_cost + other.training_ca_cost,
            training_accuracy: self.training_accuracy + other.training_accuracy,
            testing_cost: self.testing_cost + other.testing_cost,
            testing_ca_cost: self.testing_ca_cost + other.testing_ca_cost,
            testing_accuracy: self.testing_accuracy + other.testing_accuracy,
        }
    }
}

impl Div<f32> for Metrics {
    type Output = Metrics;

    fn div(self, divisor: f32) -> Metrics {
        Metrics {
            training_cost: self.training_cost / divisor,
            training_ca_cost: self.training_ca_cost / divisor,
            training_accuracy: self.training_accuracy / divisor,
            testing_cost: self.testing_cost / divisor,
            testing_ca_cost: self.testing_ca_cost / divisor,
            testing_accuracy: self.testing_accuracy / divisor,
        }
    }
}

/// Per-minibatch results, before any buffering.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BatchStats {
    pub cost: f32,
    pub ca_cost: f32,
    pub accuracy: f32,
}

impl Add for BatchStats {
    type Output = BatchStats;

    fn add(self, other: BatchStats) -> BatchStats {
        BatchStats {
            cost: self.cost + other.cost,
            ca_cost: self.ca_cost + other.ca_cost,
            accuracy: self.accuracy + other.accuracy,
        }
    }
}

impl Div<f32> for BatchStats {
    type Output = BatchStats;

    fn div(self, divisor: f32) -> BatchStats {
        BatchStats {
            cost: self.cost / divisor,
            ca_cost: self.ca_cost / divisor,
            accuracy: self.accuracy / divisor,
        }
    }
}

/// Fixed-length FIFO of per-batch values; the mean over its contents is the
/// running average reported while training.
#[derive(Clone, Debug, Default)]
pub struct RollingBuffer {
    values: VecDeque<f32>,
}

impl RollingBuffer {
    pub fn push(&mut self, value: f32) {
        self.values.push_back(value);
        if self.values.len() > METRIC_BUFFER_LEN {
            self.values.pop_front();
        }
    }

    pub fn mean(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_buffer_caps_at_buffer_len() {
        let mut buffer = RollingBuffer::default();
        for i in 0..250 {
            buffer.push(i as f32);
        }
        assert_eq!(buffer.len(), METRIC_BUFFER_LEN);
        // Oldest entries fell off the front.
        let expected: f32 = (150..250).map(|i| i as f32).sum::<f32>() / 100.0;
        assert!((buffer.mean() - expected).abs() < 1.0e-3);
    }

    #[test]
    fn metrics_average_like_the_crossval_sum() {
        let a = Metrics { training_cost: 2.0, testing_accuracy: 80.0, ..Metrics::default() };
        let b = Metrics { training_cost: 4.0, testing_accuracy: 60.0, ..Metrics::default() };
        let avg = (a + b) / 2.0;
        assert_eq!(avg.training_cost, 3.0);
        assert_eq!(avg.testing_accuracy, 70.0);
    }
}
