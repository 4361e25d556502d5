// SPDX-License-Identifier: Apache-2.0
//! Experiment configuration document types and a `base_config`-inheriting
//! YAML loader.

mod document;

pub use document::{
    ControlConfig, EvaluationConfig, ExperimentConfig, InferenceConfig, LoggingConfig, Normalization,
    PolicyConfig, RenderArgs,
};

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Maximum `base_config` chain length before it's treated as a cycle.
const MAX_INHERITANCE_DEPTH: usize = 32;

/// Errors raised while loading an [`ExperimentConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// A config file was not valid YAML, or didn't match [`ExperimentConfig`]'s shape.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying YAML error.
        #[source]
        source: serde_yaml::Error,
    },
    /// `base_config` inheritance revisited a file already in the chain, or
    /// exceeded [`MAX_INHERITANCE_DEPTH`].
    #[error("base_config inheritance chain is cyclic or too deep (> {MAX_INHERITANCE_DEPTH}) at {0}")]
    InheritanceCycle(PathBuf),
}

/// Loads an [`ExperimentConfig`] from `path`, resolving any `base_config`
/// inheritance chain.
///
/// Each file's raw YAML mapping is shallow-merged under its `base_config`
/// target (the referenced file is loaded first; this file's keys overwrite
/// it key-for-key, matching the source loader's `dict.update` semantics),
/// then the fully merged document is deserialized once.
pub fn load_config(path: &Path) -> Result<ExperimentConfig, ConfigError> {
    let mut seen = HashSet::new();
    let merged = load_raw(path, &mut seen, 0)?;
    serde_yaml::from_value(merged).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn load_raw(path: &Path, seen: &mut HashSet<PathBuf>, depth: usize) -> Result<serde_yaml::Value, ConfigError> {
    if depth > MAX_INHERITANCE_DEPTH {
        return Err(ConfigError::InheritanceCycle(path.to_path_buf()));
    }
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !seen.insert(canonical) {
        return Err(ConfigError::InheritanceCycle(path.to_path_buf()));
    }

    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let base_config_path = value
        .as_mapping()
        .and_then(|m| m.get("base_config"))
        .and_then(serde_yaml::Value::as_str)
        .map(|rel| path.parent().unwrap_or_else(|| Path::new(".")).join(rel));

    match base_config_path {
        Some(base_path) => {
            let mut base = load_raw(&base_path, seen, depth + 1)?;
            shallow_merge(&mut base, &value);
            Ok(base)
        }
        None => Ok(value),
    }
}

/// Overwrites every top-level key of `base` with `overlay`'s value for that
/// key, leaving keys only `base` has untouched. Matches Python's
/// `dict.update`: a shallow, whole-value replacement, not a recursive merge.
fn shallow_merge(base: &mut serde_yaml::Value, overlay: &serde_yaml::Value) {
    if let (Some(base_map), Some(overlay_map)) = (base.as_mapping_mut(), overlay.as_mapping()) {
        for (key, value) in overlay_map {
            base_map.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("create fixture file");
        file.write_all(contents.as_bytes()).expect("write fixture file");
        path
    }

    fn minimal_sections() -> &'static str {
        r#"
policy:
  module: RandomSearchPolicy
  samples: 10
inference:
  module: torchvision
  class: Resnet50
  resolution: 224
  normalization:
    mean: [0.485, 0.456, 0.406]
    std: [0.229, 0.224, 0.225]
  output_shape: [1000]
evaluation:
  module: TopKAccuracy
logging:
  logger_modules: [JSONLogger]
"#
    }

    #[test]
    fn loads_a_single_file_with_render_arg_defaults_applied() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_file(&dir, "config.yaml", minimal_sections());

        let config = load_config(&path).expect("load config");
        assert_eq!(config.render_args.resolution, 256);
        assert_eq!(config.render_args.max_depth, 10);
        assert!(!config.render_args.with_depth);
        assert_eq!(config.logging.logger_modules, vec!["JSONLogger".to_string()]);
    }

    #[test]
    fn base_config_is_shallow_merged_with_child_overriding() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base_body = format!(
            "{minimal}\nrender_args:\n  engine: BlenderRenderer\n  resolution: 128\n",
            minimal = minimal_sections()
        );
        write_file(&dir, "base.yaml", &base_body);

        let child = "base_config: base.yaml\nrender_args:\n  engine: BlenderRenderer\n  resolution: 512\n";
        let child_path = write_file(&dir, "child.yaml", child);

        let config = load_config(&child_path).expect("load config");
        assert_eq!(config.render_args.resolution, 512);
        assert_eq!(config.render_args.engine, "BlenderRenderer");
        assert_eq!(config.policy.module, "RandomSearchPolicy");
    }

    #[test]
    fn self_referential_base_config_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("loop.yaml");
        std::fs::write(&path, "base_config: loop.yaml\n").expect("write fixture");

        assert!(matches!(load_config(&path), Err(ConfigError::InheritanceCycle(_))));
    }
}
