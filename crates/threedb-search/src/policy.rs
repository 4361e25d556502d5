// SPDX-License-Identifier: Apache-2.0
//! The `Policy` abstraction and its two built-ins: grid search and random
//! search over a [`crate::SearchSpace`]'s axes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// One packed sample: unit-interval continuous coordinates plus discrete
/// axis indices, in the order [`crate::SearchSpace::generate_description`]
/// reports.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedSample {
    /// Continuous coordinates in `[0, 1]`, one per continuous axis.
    pub continuous: Vec<f64>,
    /// Discrete axis indices, one per discrete axis.
    pub discrete: Vec<usize>,
}

/// Per-channel stacked rows returned by a batch render.
///
/// Each `Vec<u8>` is one sample's raw row bytes for that channel, in the
/// same order as the batch submitted to [`BatchRenderer::render_batch`].
pub type ChannelStacks = BTreeMap<String, Vec<Vec<u8>>>;

/// Collaborator a [`Policy`] drives to turn packed samples into rendered,
/// logged results. Implemented by the policy controller.
#[async_trait]
pub trait BatchRenderer: Send + Sync {
    /// Renders, evaluates, and logs one batch, returning the results
    /// stacked per channel in input order.
    async fn render_batch(&self, samples: Vec<PackedSample>) -> ChannelStacks;
}

/// A terminating sampling strategy over a search space's packed axes.
#[async_trait]
pub trait Policy: Send + Sync {
    /// `(concurrency_preference, expected_total_count)`, a hint the
    /// scheduler uses for admission control; not a hard guarantee.
    fn hint_scheduler(&self) -> (usize, usize);

    /// Drives `renderer` to completion. Must terminate after a finite
    /// number of samples.
    async fn run(&self, renderer: &dyn BatchRenderer);
}

/// Maximum number of samples submitted to `render_batch` per call, matching
/// the original grid search's batching.
const GRID_CHUNK_SIZE: usize = 1000;

/// Cartesian product of a uniform grid over continuous axes and full
/// enumeration of discrete axes, emitted in chunks.
#[derive(Debug, Clone)]
pub struct GridSearchPolicy {
    continuous_dim: usize,
    discrete_sizes: Vec<usize>,
    samples_per_dim: usize,
}

impl GridSearchPolicy {
    /// Builds a grid search over `continuous_dim` continuous axes (each
    /// sampled at `samples_per_dim` evenly spaced points in `[0, 1]`) and
    /// full enumeration of `discrete_sizes` discrete axes.
    #[must_use]
    pub const fn new(continuous_dim: usize, discrete_sizes: Vec<usize>, samples_per_dim: usize) -> Self {
        Self {
            continuous_dim,
            discrete_sizes,
            samples_per_dim,
        }
    }

    fn continuous_grid(&self) -> Vec<f64> {
        if self.samples_per_dim <= 1 {
            return vec![0.0; self.samples_per_dim];
        }
        (0..self.samples_per_dim)
            .map(|i| i as f64 / (self.samples_per_dim - 1) as f64)
            .collect()
    }

    fn all_samples(&self) -> Vec<PackedSample> {
        let grid = self.continuous_grid();
        let mut continuous_combos: Vec<Vec<f64>> = vec![Vec::new()];
        for _ in 0..self.continuous_dim {
            continuous_combos = continuous_combos
                .into_iter()
                .flat_map(|combo| {
                    grid.iter().map(move |&v| {
                        let mut next = combo.clone();
                        next.push(v);
                        next
                    })
                })
                .collect();
        }

        let mut discrete_combos: Vec<Vec<usize>> = vec![Vec::new()];
        for &size in &self.discrete_sizes {
            discrete_combos = discrete_combos
                .into_iter()
                .flat_map(|combo| {
                    (0..size).map(move |idx| {
                        let mut next = combo.clone();
                        next.push(idx);
                        next
                    })
                })
                .collect();
        }

        let mut samples = Vec::with_capacity(continuous_combos.len() * discrete_combos.len());
        for continuous in &continuous_combos {
            for discrete in &discrete_combos {
                samples.push(PackedSample {
                    continuous: continuous.clone(),
                    discrete: discrete.clone(),
                });
            }
        }
        samples
    }
}

#[async_trait]
impl Policy for GridSearchPolicy {
    fn hint_scheduler(&self) -> (usize, usize) {
        let continuous_total = self.samples_per_dim.pow(self.continuous_dim as u32);
        let discrete_total: usize = self.discrete_sizes.iter().product::<usize>().max(1);
        (1, continuous_total * discrete_total)
    }

    async fn run(&self, renderer: &dyn BatchRenderer) {
        for chunk in self.all_samples().chunks(GRID_CHUNK_SIZE) {
            renderer.render_batch(chunk.to_vec()).await;
        }
    }
}

/// A fixed number of independently sampled packed vectors, optionally seeded
/// for reproducibility.
#[derive(Debug, Clone)]
pub struct RandomSearchPolicy {
    continuous_dim: usize,
    discrete_sizes: Vec<usize>,
    samples: usize,
    seed: Option<u64>,
}

impl RandomSearchPolicy {
    /// Builds a random search drawing `samples` independent vectors over
    /// `continuous_dim` continuous axes and `discrete_sizes` discrete axes.
    #[must_use]
    pub const fn new(
        continuous_dim: usize,
        discrete_sizes: Vec<usize>,
        samples: usize,
        seed: Option<u64>,
    ) -> Self {
        Self {
            continuous_dim,
            discrete_sizes,
            samples,
            seed,
        }
    }

    fn sample_all(&self) -> Vec<PackedSample> {
        let mut rng = self.seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        (0..self.samples)
            .map(|_| PackedSample {
                continuous: (0..self.continuous_dim).map(|_| rng.gen_range(0.0..1.0)).collect(),
                discrete: self
                    .discrete_sizes
                    .iter()
                    .map(|&size| rng.gen_range(0..size))
                    .collect(),
            })
            .collect()
    }
}

#[async_trait]
impl Policy for RandomSearchPolicy {
    fn hint_scheduler(&self) -> (usize, usize) {
        (1, self.samples)
    }

    async fn run(&self, renderer: &dyn BatchRenderer) {
        renderer.render_batch(self.sample_all()).await;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingRenderer {
        batches: Mutex<Vec<usize>>,
        total_samples: AtomicUsize,
    }

    impl RecordingRenderer {
        fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                total_samples: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl BatchRenderer for RecordingRenderer {
        async fn render_batch(&self, samples: Vec<PackedSample>) -> ChannelStacks {
            self.total_samples.fetch_add(samples.len(), Ordering::SeqCst);
            self.batches.lock().unwrap_or_else(|e| e.into_inner()).push(samples.len());
            ChannelStacks::new()
        }
    }

    #[tokio::test]
    async fn grid_search_total_matches_hint_and_emits_all_samples() {
        let policy = GridSearchPolicy::new(1, vec![2], 3);
        let (concurrency, total) = policy.hint_scheduler();
        assert_eq!(concurrency, 1);
        assert_eq!(total, 6);

        let renderer = RecordingRenderer::new();
        policy.run(&renderer).await;
        assert_eq!(renderer.total_samples.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn grid_search_chunks_large_batches() {
        let policy = GridSearchPolicy::new(0, vec![2500], 1);
        let renderer = RecordingRenderer::new();
        policy.run(&renderer).await;
        let batches = renderer.batches.lock().unwrap_or_else(|e| e.into_inner()).clone();
        assert_eq!(batches.iter().sum::<usize>(), 2500);
        assert!(batches.iter().all(|&n| n <= GRID_CHUNK_SIZE));
    }

    #[tokio::test]
    async fn random_search_draws_exactly_the_requested_sample_count() {
        let policy = RandomSearchPolicy::new(2, vec![4], 25, Some(7));
        assert_eq!(policy.hint_scheduler(), (1, 25));

        let renderer = RecordingRenderer::new();
        policy.run(&renderer).await;
        assert_eq!(renderer.total_samples.load(Ordering::SeqCst), 25);
    }

    #[test]
    fn random_search_is_deterministic_given_a_seed() {
        let a = RandomSearchPolicy::new(2, vec![4], 5, Some(42)).sample_all();
        let b = RandomSearchPolicy::new(2, vec![4], 5, Some(42)).sample_all();
        assert_eq!(a, b);
    }
}
