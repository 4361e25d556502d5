// SPDX-License-Identifier: Apache-2.0
//! Console progress: a `Renderings` bar tracking valid renders against the
//! experiment's expected total, and a `Policies` bar tracking how many
//! `(environment, model)` controllers have finished sampling. Postfix
//! fields surface the same `waste%`/`pending`/`workers`/`running` counters
//! the source's console reporter printed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::AppState;

/// Owns the two live progress bars and the counters their postfix fields
/// report. Cheap to clone: every field is itself reference-counted.
#[derive(Clone)]
pub struct ProgressHandles {
    renderings: ProgressBar,
    policies: ProgressBar,
    running: Arc<AtomicU64>,
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix:>11} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

impl ProgressHandles {
    /// Creates both bars, initially empty; call [`Self::set_renderings_total`]
    /// and [`Self::set_policies_total`] once the experiment's shape is known.
    #[must_use]
    pub fn new() -> Self {
        let multi = MultiProgress::new();

        let renderings = multi.add(ProgressBar::new(0));
        renderings.set_style(bar_style());
        renderings.set_prefix("Renderings");

        let policies = multi.add(ProgressBar::new(0));
        policies.set_style(bar_style());
        policies.set_prefix("Policies");

        Self {
            renderings,
            policies,
            running: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Sets the expected total render count (sum of every policy's
    /// `hint_scheduler` count across every controller).
    pub fn set_renderings_total(&self, total: u64) {
        self.renderings.set_length(total);
    }

    /// Sets the total number of `(environment, model)` controllers.
    pub fn set_policies_total(&self, total: u64) {
        self.policies.set_length(total);
    }

    /// Marks one policy controller as having started sampling.
    pub fn start_policy(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    /// Marks one policy controller as having finished sampling.
    pub fn finish_policy(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.policies.inc(1);
    }

    /// Refreshes both bars' position and postfix fields from live state.
    pub async fn tick(&self, state: &AppState) {
        let valid = u64::from(state.buffer.valid_renders());
        let total = u64::from(state.buffer.total_renders());
        let waste_pct = if total == 0 { 0.0 } else { (total - valid) as f64 / total as f64 * 100.0 };
        let pending = state.pending.lock().await.len();
        let workers = state.worker_count.load(Ordering::SeqCst);
        let running = self.running.load(Ordering::SeqCst);

        self.renderings.set_position(valid);
        self.renderings
            .set_message(format!("workers={workers} pending={pending} waste={waste_pct:.1}%"));
        self.policies.set_message(format!("running={running}"));
    }

    /// Finalizes both bars so their last state stays printed after exit.
    pub fn finish(&self) {
        self.renderings.finish();
        self.policies.finish();
    }
}

impl Default for ProgressHandles {
    fn default() -> Self {
        Self::new()
    }
}
