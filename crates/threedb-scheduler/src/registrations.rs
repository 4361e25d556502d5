// SPDX-License-Identifier: Apache-2.0
//! Extension point: wires concrete renderer and control implementations
//! into the registries the scheduler resolves `render_args.engine` and
//! `controls[].module` names against.
//!
//! The renderer, its declared models/environments, and the concrete
//! controls are external collaborators (per the orchestration core's
//! scope); nothing is registered here by default. An integrator building a
//! complete 3DB deployment links their implementations in by calling
//! `register` on these registries before `main` starts the accept loop,
//! replacing the source's dynamic `importlib.import_module` lookup with a
//! static one resolved at program init.

use threedb_control::ControlRegistry;
use threedb_render::RendererRegistry;

/// Populates `registry` with every known [`threedb_render::Renderer`]
/// factory. Empty until an integrator registers one.
pub fn register_renderers(_registry: &RendererRegistry) {}

/// Populates `registry` with every known [`threedb_control::Control`]
/// factory, used here only to read declared dimensions when building the
/// search space (not to apply/unapply — that's the worker's job). Empty
/// until an integrator registers one.
pub fn register_controls(_registry: &ControlRegistry) {}
