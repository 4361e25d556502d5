// SPDX-License-Identifier: Apache-2.0
//! Interfaces the orchestration core consumes from its external
//! collaborators: the renderer, the evaluator, and the inference model.
//!
//! None of these are implemented here — per scope, the ray-traced engine,
//! the concrete inference model, and the evaluator are supplied by the
//! caller. This crate fixes the trait boundary and hosts the static
//! registries that resolve a config's `module`/type name to a concrete
//! implementation, replacing the source's dynamic module import.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use threedb_control::RgbImage;
use threedb_proto::{DeclaredOutputs, ElementType};

/// Errors raised by a renderer, evaluator, or inference model collaborator,
/// or by resolving one from a [registry](RendererRegistry).
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    /// No factory registered under this type name.
    #[error("no implementation registered under type name {0:?}")]
    UnknownType(String),
    /// The collaborator failed in a way it chose to surface as fatal.
    #[error("{0}")]
    Failed(String),
}

/// Opaque handle to a loaded model, scoped to the renderer that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelHandle(pub u64);

/// Opaque handle to a loaded environment, scoped to the renderer that
/// issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvHandle(pub u64);

/// A single tagged tensor value: shape, element type, and raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorBuf {
    /// Tensor shape.
    pub shape: Vec<usize>,
    /// Element type of `bytes`.
    pub dtype: ElementType,
    /// Raw row-major bytes.
    pub bytes: Vec<u8>,
}

/// The ray-traced (or otherwise) rendering engine the worker drives.
pub trait Renderer: Send {
    /// Lists model identifiers available under `root`.
    fn enumerate_models(&self, root: &Path) -> Vec<String>;

    /// Lists environment identifiers available under `root`.
    fn enumerate_environments(&self, root: &Path) -> Vec<String>;

    /// Declares the channel schema this renderer produces.
    fn declare_outputs(&self) -> DeclaredOutputs;

    /// Loads a model by id, returning an opaque handle to it.
    fn load_model(&mut self, id: &str) -> Result<ModelHandle, RenderError>;

    /// Returns the renderer-assigned unique id for a loaded model.
    fn get_model_uid(&self, handle: ModelHandle) -> String;

    /// Loads an environment (scene) by id, returning an opaque handle to it.
    fn load_env(&mut self, id: &str) -> Result<EnvHandle, RenderError>;

    /// Prepares `model` to be rendered within `env`.
    fn setup_render(&mut self, model: ModelHandle, env: EnvHandle) -> Result<(), RenderError>;

    /// Builds the opaque scene-context value pre-controls mutate.
    fn get_context_dict(&mut self, model_uid: &str, label: &str) -> serde_json::Value;

    /// Renders the current scene state, returning one tensor per declared
    /// output channel.
    ///
    /// `context` is the (possibly pre-control-mutated) value from
    /// [`Self::get_context_dict`]. The source renderer reads scene overrides
    /// off the same dict object a pre-control mutated in place; since Rust
    /// has no implicit shared-mutable-dict aliasing across that boundary,
    /// this port threads it through explicitly instead.
    fn render(
        &mut self,
        model_uid: &str,
        model: ModelHandle,
        env: EnvHandle,
        context: &serde_json::Value,
    ) -> Result<BTreeMap<String, TensorBuf>, RenderError>;
}

/// The opaque prediction+label metrics collaborator.
pub trait Evaluator: Send {
    /// The segmentation label id a model's predictions should be compared
    /// against, if applicable.
    fn get_segmentation_label(&self, model_uid: &str) -> i64;

    /// Extracts the ground-truth target from a render's output.
    fn get_target(&self, model_uid: &str, render_output: &BTreeMap<String, TensorBuf>) -> TensorBuf;

    /// Computes scalar summary statistics from a prediction and its target.
    fn summary_stats(&self, prediction: &TensorBuf, label: &TensorBuf) -> BTreeMap<String, f64>;

    /// Declares the channel schema this evaluator's stats occupy.
    fn declare_outputs(&self) -> DeclaredOutputs;

    /// Converts a prediction into the tensor shape the buffer expects.
    fn to_tensor(
        &self,
        prediction: &TensorBuf,
        output_shape: &[usize],
        input_shape: &[usize],
    ) -> Result<TensorBuf, RenderError>;
}

/// The opaque image → prediction model under test.
pub trait InferenceModel: Send {
    /// Runs inference on a controls-applied RGB frame.
    fn predict(&mut self, image: &RgbImage) -> Result<TensorBuf, RenderError>;
}

/// A name-keyed factory registry, replacing the source's dynamic module
/// import with a static lookup populated at program init.
pub struct Registry<T: ?Sized> {
    factories: RwLock<BTreeMap<String, Arc<dyn Fn() -> Box<T> + Send + Sync>>>,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self {
            factories: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<T: ?Sized> Registry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `name`, overwriting any prior registration.
    pub fn register(&self, name: impl Into<String>, factory: impl Fn() -> Box<T> + Send + Sync + 'static) {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    /// Instantiates the implementation registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<T>, RenderError> {
        let factories = self.factories.read();
        let factory = factories
            .get(name)
            .ok_or_else(|| RenderError::UnknownType(name.to_string()))?;
        Ok(factory())
    }

    /// `true` if some factory is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }
}

/// Registry of renderer implementations, keyed by the config's renderer
/// type name.
pub type RendererRegistry = Registry<dyn Renderer>;

/// Registry of evaluator implementations, keyed by the config's evaluator
/// type name.
pub type EvaluatorRegistry = Registry<dyn Evaluator>;

/// Registry of inference model implementations, keyed by the config's
/// inference `class` name.
pub type InferenceModelRegistry = Registry<dyn InferenceModel>;

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    struct StubEvaluator;
    impl Evaluator for StubEvaluator {
        fn get_segmentation_label(&self, _model_uid: &str) -> i64 {
            0
        }
        fn get_target(&self, _model_uid: &str, _render_output: &BTreeMap<String, TensorBuf>) -> TensorBuf {
            TensorBuf {
                shape: vec![1],
                dtype: ElementType::I64,
                bytes: vec![0; 8],
            }
        }
        fn summary_stats(&self, _prediction: &TensorBuf, _label: &TensorBuf) -> BTreeMap<String, f64> {
            BTreeMap::new()
        }
        fn declare_outputs(&self) -> DeclaredOutputs {
            DeclaredOutputs::new()
        }
        fn to_tensor(
            &self,
            prediction: &TensorBuf,
            _output_shape: &[usize],
            _input_shape: &[usize],
        ) -> Result<TensorBuf, RenderError> {
            Ok(prediction.clone())
        }
    }

    #[test]
    fn registry_resolves_by_name_and_reports_unknown_names() {
        let registry: EvaluatorRegistry = Registry::new();
        registry.register("stub", || Box::new(StubEvaluator));

        assert!(registry.contains("stub"));
        let instance = registry.create("stub").expect("stub resolves");
        assert_eq!(instance.get_segmentation_label("anything"), 0);

        assert!(matches!(
            registry.create("missing"),
            Err(RenderError::UnknownType(name)) if name == "missing"
        ));
    }
}
