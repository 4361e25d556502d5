// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire schema for the 3DB scheduler/worker protocol.
//!
//! Every exchange is request/reply: a worker sends one [`Envelope`], the
//! scheduler answers with exactly one [`Envelope`]. A handful of request
//! kinds (notably `push`) are followed by a run of binary tensor frames;
//! see [`wire`] for the framing helpers that carry those.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub mod wire;

#[cfg(feature = "tokio-io")]
pub mod stream;

/// Unique identifier for a [`Job`].
pub type JobId = Uuid;

/// Fresh identifier a worker mints for itself on startup.
pub type WorkerId = Uuid;

/// Index into the result buffer's fixed-capacity slot table.
pub type SlotIndex = u32;

/// Scalar element type carried by a declared output channel.
///
/// Kept as a closed enum, rather than a free-form string, so a dtype
/// mismatch between two `decl` calls - or between a pushed tensor and its
/// declared schema - is a plain equality check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    /// 32-bit IEEE-754 float.
    F32,
    /// 64-bit IEEE-754 float.
    F64,
    /// Unsigned 8-bit integer (e.g. an 0-255 image channel).
    U8,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
}

impl ElementType {
    /// Size in bytes of one scalar element of this type.
    #[must_use]
    pub const fn size_of(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

/// Shape and element type of one declared output channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSchema {
    /// Per-row shape, e.g. `[3, 256, 256]` for an RGB image channel.
    pub shape: Vec<usize>,
    /// Element type stored in the channel.
    pub dtype: ElementType,
}

impl ChannelSchema {
    /// Number of scalar elements in one row of this channel (product of `shape`).
    #[must_use]
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of bytes one row of this channel occupies.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size_of()
    }
}

/// The once-fixed schema of channel shapes and dtypes the result buffer holds.
///
/// Declared exactly once, by the first worker's `decl`; every subsequent
/// `decl` must match byte-for-byte.
pub type DeclaredOutputs = BTreeMap<String, ChannelSchema>;

/// A scalar render-argument value.
///
/// `render_args` is conceptually a free-form `(control, param) -> scalar`
/// mapping. JSON map keys must be strings, so qualified entries are carried
/// as a flat list of [`RenderArg`] records instead of a tuple-keyed map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// A floating point parameter value (e.g. a continuous axis sample).
    Float(f64),
    /// An integer parameter value (e.g. a discrete axis index).
    Int(i64),
    /// A string parameter value (e.g. a discrete axis resolved to a name).
    Str(String),
    /// A boolean parameter value.
    Bool(bool),
}

/// One `(control_name, param_name) -> value` entry of a job's render args.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderArg {
    /// Qualified control type name this parameter belongs to.
    pub control: String,
    /// Parameter name within that control.
    pub param: String,
    /// The resolved scalar value.
    pub value: ParamValue,
}

/// Immutable record describing one rendering task.
///
/// Created by a policy controller when its policy requests renders;
/// retired once its buffer slot has been freed by every registrant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Globally unique job identifier.
    pub job_id: JobId,
    /// Position of this job within its originating batch, used to
    /// reassemble results in input order.
    pub order: usize,
    /// Environment (scene) identifier to render against.
    pub environment: String,
    /// Model identifier to render.
    pub model: String,
    /// Flattened `(control, param) -> value` render arguments.
    pub render_args: Vec<RenderArg>,
    /// Ordered list of qualified control type names to re-instantiate
    /// worker-side for this job.
    pub control_order: Vec<String>,
}

impl Job {
    /// Builds a lookup map from this job's flattened render args.
    #[must_use]
    pub fn render_args_map(&self) -> BTreeMap<(&str, &str), &ParamValue> {
        self.render_args
            .iter()
            .map(|arg| ((arg.control.as_str(), arg.param.as_str()), &arg.value))
            .collect()
    }
}

/// Static, experiment-wide information the scheduler hands back on `info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfoBundle {
    /// All known environment identifiers.
    pub environments: Vec<String>,
    /// All known model identifiers.
    pub models: Vec<String>,
    /// Opaque render-args config section, forwarded verbatim to workers.
    pub render_args: serde_json::Value,
    /// Opaque inference config section.
    pub inference: serde_json::Value,
    /// Opaque per-control config section.
    pub controls_args: serde_json::Value,
    /// Opaque evaluator config section.
    pub evaluation_args: serde_json::Value,
}

/// Request/reply envelope exchanged between worker and scheduler.
///
/// Tagged on the wire by `kind`: `info`, `decl`, `pull`, `push` (requests)
/// and `info`, `ack`, `work`, `die`, `bad_query` (replies) share this one
/// enum, since both directions multiplex the same connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// Request for the static experiment bundle; also used as the reply
    /// carrying that bundle.
    Info {
        /// Present only on the reply; `None` on the request.
        #[serde(flatten, skip_serializing_if = "Option::is_none")]
        bundle: Option<InfoBundle>,
    },
    /// Declare (or re-declare) the buffer's channel schema.
    Decl {
        /// Channel schema this worker intends to write.
        declared_outputs: DeclaredOutputs,
    },
    /// Ask for up to `batch_size` jobs to render.
    Pull {
        /// Maximum number of jobs to receive in this batch.
        batch_size: usize,
        /// Environment this worker last rendered, for affinity scoring.
        last_environment: Option<String>,
        /// Model this worker last rendered, for affinity scoring.
        last_model: Option<String>,
    },
    /// Reply to a `pull` carrying the jobs selected for this worker.
    Work {
        /// Jobs to render, possibly empty.
        params_to_render: Vec<Job>,
    },
    /// Push a completed job's result. The tensor payload for `result_keys`
    /// follows as a run of binary frames (see [`wire`]); the buffer slot
    /// it lands in is assigned by the scheduler while those frames are
    /// received, so it has no place in this envelope.
    Push {
        /// The job this result answers.
        job: JobId,
        /// Channel names carried in the binary frames that follow.
        result_keys: Vec<String>,
    },
    /// Generic acknowledgement reply.
    Ack,
    /// Terminal reply instructing the worker to exit.
    Die,
    /// Reply for a malformed or out-of-sequence request.
    BadQuery,
}

impl Envelope {
    /// `true` if this is the `info` request variant with no bundle attached.
    #[must_use]
    pub const fn is_info_request(&self) -> bool {
        matches!(self, Self::Info { bundle: None })
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::Pull {
            batch_size: 4,
            last_environment: Some("env_a".into()),
            last_model: None,
        };
        let bytes = serde_json::to_vec(&env).unwrap_or_default();
        let back: Envelope = serde_json::from_slice(&bytes).unwrap_or(Envelope::Ack);
        assert_eq!(env, back);
    }

    #[test]
    fn info_reply_distinguishes_from_request() {
        let request = Envelope::Info { bundle: None };
        assert!(request.is_info_request());

        let reply = Envelope::Info {
            bundle: Some(InfoBundle {
                environments: vec!["e".into()],
                models: vec!["m".into()],
                render_args: serde_json::Value::Null,
                inference: serde_json::Value::Null,
                controls_args: serde_json::Value::Null,
                evaluation_args: serde_json::Value::Null,
            }),
        };
        assert!(!reply.is_info_request());
    }

    #[test]
    fn job_render_args_map_looks_up_by_qualified_name() {
        let job = Job {
            job_id: Uuid::nil(),
            order: 0,
            environment: "env_a".into(),
            model: "model_a".into(),
            render_args: vec![RenderArg {
                control: "Camera".into(),
                param: "distance".into(),
                value: ParamValue::Float(1.5),
            }],
            control_order: vec!["Camera".into()],
        };
        let map = job.render_args_map();
        assert_eq!(
            map.get(&("Camera", "distance")),
            Some(&&ParamValue::Float(1.5))
        );
    }

    #[test]
    fn channel_schema_computes_byte_len() {
        let schema = ChannelSchema {
            shape: vec![3, 4, 4],
            dtype: ElementType::F32,
        };
        assert_eq!(schema.element_count(), 48);
        assert_eq!(schema.byte_len(), 192);
    }
}
