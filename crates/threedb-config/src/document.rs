// SPDX-License-Identifier: Apache-2.0
//! Typed shape of an experiment config document, matching the section
//! table in the design: `policy`, `controls`, `inference`, `evaluation`,
//! `logging`, `render_args`.

use serde::{Deserialize, Serialize};

/// Top-level experiment configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Sampling policy to run.
    pub policy: PolicyConfig,
    /// Ordered list of controls to apply, in `control_order`.
    #[serde(default)]
    pub controls: Vec<ControlConfig>,
    /// Inference model configuration.
    pub inference: InferenceConfig,
    /// Evaluator configuration.
    pub evaluation: EvaluationConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Renderer configuration, merged under [`RenderArgs::default`].
    #[serde(default)]
    pub render_args: RenderArgs,
}

/// `policy` section: which policy to run and its type-specific arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Registered policy type name.
    pub module: String,
    /// Policy-specific arguments, passed through opaquely.
    #[serde(flatten)]
    pub args: serde_json::Value,
}

/// One entry of the `controls` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Registered control type name.
    pub module: String,
    /// Construction arguments for the control, if any.
    #[serde(default)]
    pub args: Option<serde_json::Value>,
    /// Dimension overrides (e.g. narrowing a declared `(lo, hi)` range),
    /// keyed by dimension name.
    #[serde(flatten)]
    pub dim_overrides: serde_json::Map<String, serde_json::Value>,
}

/// `inference` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Registered inference model type name.
    pub module: String,
    /// Class/variant name within that module's registration.
    pub class: String,
    /// Model construction arguments.
    #[serde(default)]
    pub args: serde_json::Value,
    /// Input resolution the model expects.
    pub resolution: u32,
    /// Input normalization.
    pub normalization: Normalization,
    /// Expected output tensor shape.
    pub output_shape: Vec<usize>,
}

/// Per-channel input normalization statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalization {
    /// Per-channel mean.
    pub mean: Vec<f64>,
    /// Per-channel standard deviation.
    pub std: Vec<f64>,
}

/// `evaluation` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Registered evaluator type name.
    pub module: String,
    /// Evaluator construction arguments.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// `logging` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Registered logger type names to run, in the order they fan out.
    #[serde(default)]
    pub logger_modules: Vec<String>,
}

/// `render_args` section. `engine` has no default since it selects which
/// renderer registration to use; every other field falls back to
/// [`RenderArgs::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderArgs {
    /// Registered renderer type name.
    #[serde(default)]
    pub engine: String,
    /// Output resolution, in pixels, per side.
    #[serde(default = "default_resolution")]
    pub resolution: u32,
    /// Samples per pixel.
    #[serde(default = "default_samples")]
    pub samples: u32,
    /// Whether to additionally render a UV channel.
    #[serde(default)]
    pub with_uv: bool,
    /// Whether to additionally render a depth channel.
    #[serde(default)]
    pub with_depth: bool,
    /// Whether to additionally render a segmentation channel.
    #[serde(default)]
    pub with_segmentation: bool,
    /// Maximum ray-trace depth.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Renderer-specific extra arguments.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

const fn default_resolution() -> u32 {
    256
}

const fn default_samples() -> u32 {
    256
}

const fn default_max_depth() -> u32 {
    10
}

impl Default for RenderArgs {
    fn default() -> Self {
        Self {
            engine: String::new(),
            resolution: default_resolution(),
            samples: default_samples(),
            with_uv: false,
            with_depth: false,
            with_segmentation: false,
            max_depth: default_max_depth(),
            extra: serde_json::Map::new(),
        }
    }
}
