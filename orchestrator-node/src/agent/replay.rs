//! Prioritized experience replay
//!
//! Experiences are sampled with probability proportional to |TD error|^alpha;
//! importance-sampling weights correct the induced bias and are normalized by
//! the batch maximum.

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One transition observed by the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub state: Vec<f64>,
    pub action: usize,
    pub reward: f64,
    pub next_state: Vec<f64>,
    pub terminal: bool,
}

/// Priority floor keeping every experience sampleable
const PRIORITY_EPS: f64 = 1e-6;

#[derive(Debug, Serialize, Deserialize)]
pub struct PrioritizedReplay {
    capacity: usize,
    alpha: f64,
    buffer: VecDeque<Experience>,
    priorities: VecDeque<f64>,
}

impl PrioritizedReplay {
    pub fn new(capacity: usize, alpha: f64) -> Self {
        Self {
            capacity,
            alpha,
            buffer: VecDeque::with_capacity(capacity),
            priorities: VecDeque::with_capacity(capacity),
        }
    }

    /// Insert with the current maximum priority so new experiences are
    /// sampled at least once before their TD error is known
    pub fn push(&mut self, experience: Experience) {
        let priority = self
            .priorities
            .iter()
            .cloned()
            .fold(f64::MIN, f64::max)
            .max(1.0);
        if self.buffer.len() == self.capacity {
            self.buffer.pop_front();
            self.priorities.pop_front();
        }
        self.buffer.push_back(experience);
        self.priorities.push_back(priority);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Normalized sampling distribution: p_i^alpha / sum_j p_j^alpha
    pub fn sampling_probabilities(&self) -> Vec<f64> {
        let raised: Vec<f64> = self
            .priorities
            .iter()
            .map(|p| p.powf(self.alpha))
            .collect();
        let total: f64 = raised.iter().sum();
        if total <= 0.0 {
            let uniform = 1.0 / raised.len().max(1) as f64;
            return vec![uniform; raised.len()];
        }
        raised.into_iter().map(|p| p / total).collect()
    }

    /// Sample a batch with replacement. Returns indices, experiences, and
    /// importance-sampling weights (N * P(i))^-beta normalized by the max.
    pub fn sample(
        &self,
        batch_size: usize,
        beta: f64,
        rng: &mut StdRng,
    ) -> (Vec<usize>, Vec<Experience>, Vec<f64>) {
        let n = self.buffer.len();
        if n == 0 {
            return (Vec::new(), Vec::new(), Vec::new());
        }
        let probabilities = self.sampling_probabilities();

        let mut indices = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let mut draw: f64 = rng.gen();
            let mut chosen = n - 1;
            for (i, p) in probabilities.iter().enumerate() {
                if draw < *p {
                    chosen = i;
                    break;
                }
                draw -= p;
            }
            indices.push(chosen);
        }

        let mut weights: Vec<f64> = indices
            .iter()
            .map(|&i| (n as f64 * probabilities[i]).powf(-beta))
            .collect();
        let max_weight = weights.iter().cloned().fold(f64::MIN, f64::max).max(1e-12);
        for w in &mut weights {
            *w /= max_weight;
        }

        let experiences = indices.iter().map(|&i| self.buffer[i].clone()).collect();
        (indices, experiences, weights)
    }

    /// Re-prioritize sampled experiences from their new TD errors
    pub fn update_priorities(&mut self, indices: &[usize], td_errors: &[f64]) {
        for (&index, &td) in indices.iter().zip(td_errors) {
            if let Some(priority) = self.priorities.get_mut(index) {
                *priority = td.abs() + PRIORITY_EPS;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn experience(reward: f64) -> Experience {
        Experience {
            state: vec![0.0; 4],
            action: 0,
            reward,
            next_state: vec![0.0; 4],
            terminal: false,
        }
    }

    #[test]
    fn test_capacity_eviction() {
        let mut replay = PrioritizedReplay::new(3, 0.6);
        for i in 0..5 {
            replay.push(experience(i as f64));
        }
        assert_eq!(replay.len(), 3);
    }

    #[test]
    fn test_sampling_proportional_to_priority_power() {
        let mut replay = PrioritizedReplay::new(8, 0.6);
        for _ in 0..4 {
            replay.push(experience(0.0));
        }
        // Assign TD errors 1, 2, 4, 8
        replay.update_priorities(&[0, 1, 2, 3], &[1.0, 2.0, 4.0, 8.0]);

        let probs = replay.sampling_probabilities();
        // P(i) proportional to |e_i|^alpha, up to normalization
        let expected_ratio = (8.0f64 / 1.0f64).powf(0.6);
        let observed_ratio = probs[3] / probs[0];
        assert!(
            (observed_ratio - expected_ratio).abs() / expected_ratio < 1e-6,
            "observed {observed_ratio}, expected {expected_ratio}"
        );
        let total: f64 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_importance_weights_normalized() {
        let mut replay = PrioritizedReplay::new(16, 0.6);
        for i in 0..10 {
            replay.push(experience(i as f64));
        }
        replay.update_priorities(&[0, 5], &[0.1, 9.0]);

        let mut rng = StdRng::seed_from_u64(3);
        let (indices, experiences, weights) = replay.sample(6, 0.4, &mut rng);
        assert_eq!(indices.len(), 6);
        assert_eq!(experiences.len(), 6);
        assert!(weights.iter().all(|w| *w > 0.0 && *w <= 1.0 + 1e-12));
    }

    #[test]
    fn test_sampling_is_deterministic_per_seed() {
        let mut replay = PrioritizedReplay::new(16, 0.6);
        for i in 0..10 {
            replay.push(experience(i as f64));
        }
        let (a, _, _) = replay.sample(5, 0.4, &mut StdRng::seed_from_u64(11));
        let (b, _, _) = replay.sample(5, 0.4, &mut StdRng::seed_from_u64(11));
        assert_eq!(a, b);
    }
}
