// SPDX-License-Identifier: Apache-2.0
//! Resolves a job's `control_order` into a runnable [`ControlPipeline`],
//! looking each qualified name up in whichever of the pre/post registries
//! claims it — replacing the source's `isinstance(control, PreProcessControl)`
//! branch with two distinct registries instead of one mixed one.

use threedb_control::{ControlPipeline, PostProcessControl, PreProcessControl, Registry};
use threedb_proto::Job;

/// Scene-context value a [`PreProcessControl`] mutates. The renderer hands
/// this back from `get_context_dict` as an opaque JSON value (see
/// [`threedb_render::Renderer::get_context_dict`]).
pub type RenderContext = serde_json::Value;

/// Registry of pre-render scene-mutating controls, keyed by the config's
/// `controls[].module` name.
pub type PreControlRegistry = Registry<dyn PreProcessControl<Context = RenderContext>>;

/// Registry of post-render pixel-space controls, keyed by the same name
/// space as [`PreControlRegistry`].
pub type PostControlRegistry = Registry<dyn PostProcessControl>;

/// Errors raised while resolving a job's `control_order` against the
/// worker's registries.
#[derive(Debug, thiserror::Error)]
pub enum ControlInstantiationError {
    /// Neither registry has a factory under this name.
    #[error("control {0:?} is registered in neither the pre- nor post-process registry")]
    UnknownControl(String),
}

/// Builds the pipeline for one job: each `control_order` entry is resolved
/// against the pre-control registry first, then the post-control registry,
/// in the order the job declares them.
pub fn build_control_pipeline(
    job: &Job,
    pre_registry: &PreControlRegistry,
    post_registry: &PostControlRegistry,
) -> Result<ControlPipeline<RenderContext>, ControlInstantiationError> {
    let mut pre = Vec::new();
    let mut post = Vec::new();

    for name in &job.control_order {
        if let Some(control) = pre_registry.create(name) {
            pre.push(control);
        } else if let Some(control) = post_registry.create(name) {
            post.push(control);
        } else {
            return Err(ControlInstantiationError::UnknownControl(name.clone()));
        }
    }

    Ok(ControlPipeline::new(pre, post))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use threedb_control::{Control, ControlError, RgbImage};
    use threedb_proto::{ParamValue, RenderArg};
    use uuid::Uuid;

    struct Camera;
    impl Control for Camera {
        fn name(&self) -> &str {
            "Camera"
        }
    }
    impl PreProcessControl for Camera {
        type Context = RenderContext;
        fn apply(&mut self, _ctx: &mut RenderContext, _args: &BTreeMap<String, ParamValue>) -> Result<(), ControlError> {
            Ok(())
        }
    }

    struct Blur;
    impl Control for Blur {
        fn name(&self) -> &str {
            "Blur"
        }
    }
    impl PostProcessControl for Blur {
        fn apply(&mut self, _rgb: &mut RgbImage, _args: &BTreeMap<String, ParamValue>) -> Result<(), ControlError> {
            Ok(())
        }
    }

    fn job_with_controls(control_order: Vec<String>) -> Job {
        Job {
            job_id: Uuid::nil(),
            order: 0,
            environment: "env".into(),
            model: "model".into(),
            render_args: vec![RenderArg {
                control: "Camera".into(),
                param: "distance".into(),
                value: ParamValue::Float(1.0),
            }],
            control_order,
        }
    }

    #[test]
    fn resolves_pre_and_post_controls_from_their_respective_registries() {
        let pre_registry: PreControlRegistry = Registry::new();
        pre_registry.register("Camera", || Box::new(Camera));
        let post_registry: PostControlRegistry = Registry::new();
        post_registry.register("Blur", || Box::new(Blur));

        let job = job_with_controls(vec!["Camera".into(), "Blur".into()]);
        let pipeline = build_control_pipeline(&job, &pre_registry, &post_registry);
        assert!(pipeline.is_ok());
    }

    #[test]
    fn unregistered_control_name_is_rejected() {
        let pre_registry: PreControlRegistry = Registry::new();
        let post_registry: PostControlRegistry = Registry::new();
        let job = job_with_controls(vec!["Nonexistent".into()]);
        assert!(matches!(
            build_control_pipeline(&job, &pre_registry, &post_registry),
            Err(ControlInstantiationError::UnknownControl(name)) if name == "Nonexistent"
        ));
    }
}
