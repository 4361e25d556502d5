// SPDX-License-Identifier: Apache-2.0
//! Extension point: wires concrete renderer, evaluator, inference-model,
//! and control implementations into the registries the worker resolves the
//! `info` bundle's module/class names against.
//!
//! Nothing is registered here by default — the renderer, evaluator,
//! inference model, and concrete controls are external collaborators per
//! the orchestration core's scope. An integrator building a complete 3DB
//! deployment links their implementations in by calling `register` on
//! these registries before `main` starts its connect/pull/push loop.

use threedb_render::{EvaluatorRegistry, InferenceModelRegistry, RendererRegistry};
use threedb_worker::{PostControlRegistry, PreControlRegistry};

/// Populates `registry` with every known [`threedb_render::Renderer`]
/// factory.
pub fn register_renderers(_registry: &RendererRegistry) {}

/// Populates `registry` with every known [`threedb_render::Evaluator`]
/// factory.
pub fn register_evaluators(_registry: &EvaluatorRegistry) {}

/// Populates `registry` with every known [`threedb_render::InferenceModel`]
/// factory.
pub fn register_inference_models(_registry: &InferenceModelRegistry) {}

/// Populates both control registries with every known pre- and
/// post-process control factory.
pub fn register_controls(_pre: &PreControlRegistry, _post: &PostControlRegistry) {}
