// SPDX-License-Identifier: Apache-2.0
//! Per-job control pipeline: scene-mutating pre-controls and pure
//! pixel-space post-controls, executed in a fixed order around a render.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use threedb_proto::{Job, ParamValue};

/// Errors raised while validating or running a control.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// A supplied argument isn't one of the control's declared dims.
    #[error("control {control:?} has no dimension named {param:?}")]
    UnknownParam {
        /// Offending control name.
        control: String,
        /// Offending parameter name.
        param: String,
    },
    /// A continuous argument fell outside its declared `(lo, hi)` range.
    #[error("control {control:?} param {param:?} value {value} is outside declared range [{lo}, {hi}]")]
    OutOfRange {
        /// Offending control name.
        control: String,
        /// Offending parameter name.
        param: String,
        /// Supplied value.
        value: f64,
        /// Declared lower bound.
        lo: f64,
        /// Declared upper bound.
        hi: f64,
    },
    /// A discrete argument wasn't one of its declared candidate values.
    #[error("control {control:?} param {param:?} value {value:?} is not a declared option")]
    NotADeclaredOption {
        /// Offending control name.
        control: String,
        /// Offending parameter name.
        param: String,
        /// Supplied value.
        value: ParamValue,
    },
    /// An argument's type didn't match the dim kind it was checked against.
    #[error("control {control:?} param {param:?} has the wrong value type")]
    WrongType {
        /// Offending control name.
        control: String,
        /// Offending parameter name.
        param: String,
    },
    /// Opaque failure raised by a control's own `apply`/`unapply`.
    #[error("control {control:?} failed: {message}")]
    Failed {
        /// Offending control name.
        control: String,
        /// Human-readable detail.
        message: String,
    },
}

/// Per-(control, param) argument map grouped out of a [`Job`]'s flattened
/// `render_args`.
pub type ArgsByControl = BTreeMap<String, BTreeMap<String, ParamValue>>;

/// Groups a job's flattened render args by owning control name.
#[must_use]
pub fn group_args_by_control(job: &Job) -> ArgsByControl {
    let mut grouped: ArgsByControl = ArgsByControl::new();
    for arg in &job.render_args {
        grouped
            .entry(arg.control.clone())
            .or_default()
            .insert(arg.param.clone(), arg.value.clone());
    }
    grouped
}

/// Shared identity and declared-dimension surface of every control.
pub trait Control: Send {
    /// Name this control is addressed by in `control_order` and render args.
    fn name(&self) -> &str;

    /// Continuous dims this control declares, name → `(lo, hi)`.
    fn continuous_dims(&self) -> BTreeMap<String, (f64, f64)> {
        BTreeMap::new()
    }

    /// Discrete dims this control declares, name → candidate values.
    fn discrete_dims(&self) -> BTreeMap<String, Vec<ParamValue>> {
        BTreeMap::new()
    }

    /// Validates `args` against this control's declared dims.
    fn validate_args(&self, args: &BTreeMap<String, ParamValue>) -> Result<(), ControlError> {
        let continuous = self.continuous_dims();
        let discrete = self.discrete_dims();

        for (param, value) in args {
            if let Some(&(lo, hi)) = continuous.get(param) {
                match value {
                    ParamValue::Float(v) => {
                        if *v < lo || *v > hi {
                            return Err(ControlError::OutOfRange {
                                control: self.name().to_string(),
                                param: param.clone(),
                                value: *v,
                                lo,
                                hi,
                            });
                        }
                    }
                    _ => {
                        return Err(ControlError::WrongType {
                            control: self.name().to_string(),
                            param: param.clone(),
                        })
                    }
                }
            } else if let Some(options) = discrete.get(param) {
                if !options.contains(value) {
                    return Err(ControlError::NotADeclaredOption {
                        control: self.name().to_string(),
                        param: param.clone(),
                        value: value.clone(),
                    });
                }
            } else {
                return Err(ControlError::UnknownParam {
                    control: self.name().to_string(),
                    param: param.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A control that mutates scene state before rendering and must reverse
/// every mutation afterward so it never leaks into the next render.
pub trait PreProcessControl: Control {
    /// Renderer-specific scene handle this control mutates.
    type Context;

    /// Applies this control's effect to `context`.
    fn apply(&mut self, context: &mut Self::Context, args: &BTreeMap<String, ParamValue>) -> Result<(), ControlError>;

    /// Reverses this control's effect. Default is a no-op, for controls
    /// whose `apply` has no lingering scene-state effect.
    fn unapply(&mut self, _context: &mut Self::Context) -> Result<(), ControlError> {
        Ok(())
    }
}

/// A pure pixel-space transform applied to the rendered RGB frame.
pub trait PostProcessControl: Control {
    /// Transforms `rgb` in place.
    fn apply(&mut self, rgb: &mut RgbImage, args: &BTreeMap<String, ParamValue>) -> Result<(), ControlError>;
}

/// A packed, 3-channel RGB frame as handed to post-process controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RgbImage {
    /// Frame width in pixels.
    pub width: usize,
    /// Frame height in pixels.
    pub height: usize,
    /// Row-major, interleaved RGB bytes, length `width * height * 3`.
    pub data: Vec<u8>,
}

/// Executes a job's pre- and post-controls around a render in the order
/// codified for this port: pre-controls apply, the render runs, then
/// post-controls apply, then pre-controls unapply in reverse of their
/// apply order.
pub struct ControlPipeline<Ctx> {
    pre: Vec<Box<dyn PreProcessControl<Context = Ctx>>>,
    post: Vec<Box<dyn PostProcessControl>>,
}

impl<Ctx> ControlPipeline<Ctx> {
    /// Builds a pipeline from its pre- and post-process controls, in the
    /// order they will be applied.
    #[must_use]
    pub fn new(
        pre: Vec<Box<dyn PreProcessControl<Context = Ctx>>>,
        post: Vec<Box<dyn PostProcessControl>>,
    ) -> Self {
        Self { pre, post }
    }

    /// Runs pre-controls, then `render`, then post-controls, then unwinds
    /// pre-controls in reverse apply order.
    pub fn execute<F>(
        &mut self,
        context: &mut Ctx,
        args_by_control: &ArgsByControl,
        render: F,
    ) -> Result<RgbImage, ControlError>
    where
        F: FnOnce(&mut Ctx) -> Result<RgbImage, ControlError>,
    {
        self.apply_pre(context, args_by_control)?;
        let mut rgb = render(context)?;
        self.apply_post(&mut rgb, args_by_control)?;
        self.unapply_pre(context)?;
        Ok(rgb)
    }

    fn apply_pre(&mut self, context: &mut Ctx, args_by_control: &ArgsByControl) -> Result<(), ControlError> {
        for control in &mut self.pre {
            let empty = BTreeMap::new();
            let args = args_by_control.get(control.name()).unwrap_or(&empty);
            control.validate_args(args)?;
            control.apply(context, args)?;
        }
        Ok(())
    }

    fn apply_post(&mut self, rgb: &mut RgbImage, args_by_control: &ArgsByControl) -> Result<(), ControlError> {
        for control in &mut self.post {
            let empty = BTreeMap::new();
            let args = args_by_control.get(control.name()).unwrap_or(&empty);
            control.validate_args(args)?;
            control.apply(rgb, args)?;
        }
        Ok(())
    }

    fn unapply_pre(&mut self, context: &mut Ctx) -> Result<(), ControlError> {
        for control in self.pre.iter_mut().rev() {
            control.unapply(context)?;
        }
        Ok(())
    }
}

/// A name-keyed factory registry resolving a config's control `module` name
/// to a concrete [`Control`], replacing the source's dynamic module import.
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

    /// Instantiates the implementation registered under `name`, if any.
    #[must_use]
    pub fn create(&self, name: &str) -> Option<Box<T>> {
        self.factories.read().get(name).map(|factory| factory())
    }

    /// `true` if some factory is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }
}

/// Registry of control implementations, keyed by the config's `module` name.
pub type ControlRegistry = Registry<dyn Control>;

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use threedb_proto::RenderArg;
    use uuid::Uuid;

    struct Scene {
        log: Vec<&'static str>,
    }

    struct MoveCamera {
        distance_applied: Option<f64>,
    }

    impl Control for MoveCamera {
        fn name(&self) -> &str {
            "MoveCamera"
        }
        fn continuous_dims(&self) -> BTreeMap<String, (f64, f64)> {
            [("distance".to_string(), (0.0, 10.0))].into_iter().collect()
        }
    }

    impl PreProcessControl for MoveCamera {
        type Context = Scene;
        fn apply(&mut self, context: &mut Scene, args: &BTreeMap<String, ParamValue>) -> Result<(), ControlError> {
            if let Some(ParamValue::Float(d)) = args.get("distance") {
                self.distance_applied = Some(*d);
                context.log.push("apply-camera");
            }
            Ok(())
        }
        fn unapply(&mut self, context: &mut Scene) -> Result<(), ControlError> {
            context.log.push("unapply-camera");
            Ok(())
        }
    }

    struct Grayscale;
    impl Control for Grayscale {
        fn name(&self) -> &str {
            "Grayscale"
        }
    }
    impl PostProcessControl for Grayscale {
        fn apply(&mut self, rgb: &mut RgbImage, _args: &BTreeMap<String, ParamValue>) -> Result<(), ControlError> {
            for px in rgb.data.chunks_mut(3) {
                let avg = ((u16::from(px[0]) + u16::from(px[1]) + u16::from(px[2])) / 3) as u8;
                px[0] = avg;
                px[1] = avg;
                px[2] = avg;
            }
            Ok(())
        }
    }

    fn sample_job() -> Job {
        Job {
            job_id: Uuid::nil(),
            order: 0,
            environment: "env".into(),
            model: "model".into(),
            render_args: vec![RenderArg {
                control: "MoveCamera".into(),
                param: "distance".into(),
                value: ParamValue::Float(5.0),
            }],
            control_order: vec!["MoveCamera".into()],
        }
    }

    #[test]
    fn execute_runs_pre_then_render_then_post_then_unapply_in_reverse() {
        let args = group_args_by_control(&sample_job());
        let mut scene = Scene { log: Vec::new() };

        let mut pipeline: ControlPipeline<Scene> = ControlPipeline::new(
            vec![Box::new(MoveCamera { distance_applied: None })],
            vec![Box::new(Grayscale)],
        );

        let rgb = pipeline
            .execute(&mut scene, &args, |ctx| {
                ctx.log.push("render");
                Ok(RgbImage {
                    width: 1,
                    height: 1,
                    data: vec![10, 20, 30],
                })
            })
            .expect("pipeline executes");

        assert_eq!(scene.log, vec!["apply-camera", "render", "unapply-camera"]);
        assert_eq!(rgb.data, vec![20, 20, 20]);
    }

    #[test]
    fn validate_args_rejects_out_of_range_continuous_value() {
        let control = MoveCamera { distance_applied: None };
        let mut args = BTreeMap::new();
        args.insert("distance".to_string(), ParamValue::Float(99.0));
        assert!(matches!(
            control.validate_args(&args),
            Err(ControlError::OutOfRange { .. })
        ));
    }

    #[test]
    fn validate_args_rejects_unknown_param() {
        let control = Grayscale;
        let mut args = BTreeMap::new();
        args.insert("nope".to_string(), ParamValue::Bool(true));
        assert!(matches!(
            control.validate_args(&args),
            Err(ControlError::UnknownParam { .. })
        ));
    }

    #[test]
    fn group_args_by_control_buckets_by_control_name() {
        let grouped = group_args_by_control(&sample_job());
        assert_eq!(grouped.len(), 1);
        assert_eq!(
            grouped["MoveCamera"].get("distance"),
            Some(&ParamValue::Float(5.0))
        );
    }

    #[test]
    fn registry_resolves_by_name_and_reports_unknown_names() {
        let registry: ControlRegistry = Registry::new();
        registry.register("Grayscale", || Box::new(Grayscale));

        assert!(registry.contains("Grayscale"));
        let control = registry.create("Grayscale").expect("Grayscale resolves");
        assert_eq!(control.name(), "Grayscale");
        assert!(registry.create("NoSuchControl").is_none());
    }
}
