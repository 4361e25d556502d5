// SPDX-License-Identifier: Apache-2.0
//! Bridges a loaded experiment config into the scheduler's runtime shapes:
//! a flattened [`SearchSpace`] and the opaque `info` bundle sent to workers.

use std::collections::BTreeMap;

use serde_json::Value;
use threedb_config::{ControlConfig, ExperimentConfig};
use threedb_control::{Control, ControlRegistry};
use threedb_proto::{InfoBundle, ParamValue};
use threedb_search::{ContinuousDim, ControlDecl, SearchSpace};

use crate::error::SchedulerError;

/// Builds a [`SearchSpace`] from the config's `controls` list, resolving
/// each entry's declared dims through `registry` and applying its
/// `dim_overrides`.
///
/// Mirrors `overwrite_control` from the source's `utils.py`: a continuous
/// override is either a `[lo, hi]` pair (narrows the range) or a bare
/// number (collapses the axis to a fixed value); a discrete override is a
/// list of candidate values. An override key matching neither of a
/// control's declared dims is rejected, same as the source's
/// `AttributeError`.
pub fn build_search_space(
    configs: &[ControlConfig],
    registry: &ControlRegistry,
) -> Result<SearchSpace, SchedulerError> {
    let mut decls = Vec::with_capacity(configs.len());

    for cfg in configs {
        let control = registry
            .create(&cfg.module)
            .ok_or_else(|| SchedulerError::UnknownControl(cfg.module.clone()))?;

        let mut continuous_dims: BTreeMap<String, ContinuousDim> = control
            .continuous_dims()
            .into_iter()
            .map(|(name, (lo, hi))| (name, ContinuousDim::Range { lo, hi }))
            .collect();
        let mut discrete_dims = control.discrete_dims();

        for (key, value) in &cfg.dim_overrides {
            if continuous_dims.contains_key(key) {
                let dim = parse_continuous_override(value).ok_or_else(|| SchedulerError::InvalidOverrideShape {
                    control: cfg.module.clone(),
                    param: key.clone(),
                })?;
                continuous_dims.insert(key.clone(), dim);
            } else if discrete_dims.contains_key(key) {
                let values = parse_discrete_override(value).ok_or_else(|| SchedulerError::InvalidOverrideShape {
                    control: cfg.module.clone(),
                    param: key.clone(),
                })?;
                discrete_dims.insert(key.clone(), values);
            } else {
                return Err(SchedulerError::UnknownOverrideAttribute {
                    control: cfg.module.clone(),
                    param: key.clone(),
                });
            }
        }

        decls.push(ControlDecl {
            name: control.name().to_string(),
            continuous_dims,
            discrete_dims,
        });
    }

    Ok(SearchSpace::new(decls)?)
}

fn parse_continuous_override(value: &Value) -> Option<ContinuousDim> {
    if let Some(scalar) = value.as_f64() {
        return Some(ContinuousDim::Fixed(scalar));
    }
    let arr = value.as_array()?;
    if arr.len() != 2 {
        return None;
    }
    Some(ContinuousDim::Range {
        lo: arr[0].as_f64()?,
        hi: arr[1].as_f64()?,
    })
}

fn parse_discrete_override(value: &Value) -> Option<Vec<ParamValue>> {
    value.as_array()?.iter().map(parse_param_value).collect()
}

fn parse_param_value(value: &Value) -> Option<ParamValue> {
    match value {
        Value::Bool(b) => Some(ParamValue::Bool(*b)),
        Value::String(s) => Some(ParamValue::Str(s.clone())),
        Value::Number(n) => n.as_i64().map(ParamValue::Int).or_else(|| n.as_f64().map(ParamValue::Float)),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Builds the static `info` bundle handed to every worker: environment and
/// model lists plus the opaque config sections each worker resolves its own
/// collaborators against.
pub fn build_info_bundle(
    config: &ExperimentConfig,
    environments: Vec<String>,
    models: Vec<String>,
) -> Result<InfoBundle, SchedulerError> {
    let mut controls_args = serde_json::Map::new();
    for control in &config.controls {
        let args = control.args.clone().unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        controls_args.insert(control.module.clone(), args);
    }

    Ok(InfoBundle {
        environments,
        models,
        render_args: serde_json::to_value(&config.render_args)?,
        inference: serde_json::to_value(&config.inference)?,
        controls_args: Value::Object(controls_args),
        evaluation_args: serde_json::to_value(&config.evaluation)?,
    })
}
