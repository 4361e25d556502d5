// SPDX-License-Identifier: Apache-2.0
//! Resolves a config's `policy.module` name and arguments into one of the
//! built-in sampling policies, shaped against the flattened search space.

use std::sync::Arc;

use serde::Deserialize;
use threedb_config::PolicyConfig;
use threedb_search::{GridSearchPolicy, Policy, RandomSearchPolicy, SearchSpace};

use crate::error::SchedulerError;

#[derive(Debug, Deserialize)]
struct GridSearchArgs {
    #[serde(default = "default_samples_per_dim")]
    samples_per_dim: usize,
}

const fn default_samples_per_dim() -> usize {
    8
}

#[derive(Debug, Deserialize)]
struct RandomSearchArgs {
    samples: usize,
    #[serde(default)]
    seed: Option<u64>,
}

/// Builds the policy named by `cfg.module`, sized against `search_space`'s
/// flattened axis counts.
pub fn build_policy(cfg: &PolicyConfig, search_space: &SearchSpace) -> Result<Arc<dyn Policy>, SchedulerError> {
    let (continuous_count, discrete_cards) = search_space.generate_description();

    match cfg.module.as_str() {
        "grid_search" | "GridSearchPolicy" => {
            let args: GridSearchArgs = serde_json::from_value(cfg.args.clone())
                .unwrap_or(GridSearchArgs { samples_per_dim: default_samples_per_dim() });
            Ok(Arc::new(GridSearchPolicy::new(continuous_count, discrete_cards, args.samples_per_dim)))
        }
        "random_search" | "RandomSearchPolicy" => {
            let args: RandomSearchArgs = serde_json::from_value(cfg.args.clone())?;
            Ok(Arc::new(RandomSearchPolicy::new(continuous_count, discrete_cards, args.samples, args.seed)))
        }
        other => Err(SchedulerError::UnknownPolicy(other.to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use threedb_search::ControlDecl;

    fn empty_space() -> SearchSpace {
        SearchSpace::new(vec![ControlDecl {
            name: "Camera".to_string(),
            continuous_dims: [("distance".to_string(), threedb_search::ContinuousDim::Range { lo: 0.0, hi: 1.0 })]
                .into_iter()
                .collect(),
            discrete_dims: std::collections::BTreeMap::new(),
        }])
        .expect("builds")
    }

    #[test]
    fn grid_search_resolves_with_default_samples_per_dim() {
        let cfg = PolicyConfig {
            module: "grid_search".to_string(),
            args: serde_json::json!({}),
        };
        let policy = build_policy(&cfg, &empty_space()).expect("resolves");
        assert_eq!(policy.hint_scheduler(), (1, default_samples_per_dim()));
    }

    #[test]
    fn random_search_requires_a_sample_count() {
        let cfg = PolicyConfig {
            module: "random_search".to_string(),
            args: serde_json::json!({ "samples": 12, "seed": 7 }),
        };
        let policy = build_policy(&cfg, &empty_space()).expect("resolves");
        assert_eq!(policy.hint_scheduler(), (1, 12));
    }

    #[test]
    fn unknown_policy_module_is_rejected() {
        let cfg = PolicyConfig {
            module: "not_a_policy".to_string(),
            args: serde_json::json!({}),
        };
        assert!(matches!(
            build_policy(&cfg, &empty_space()),
            Err(SchedulerError::UnknownPolicy(name)) if name == "not_a_policy"
        ));
    }
}
