// SPDX-License-Identifier: Apache-2.0
//! Error types raised while bridging config into runtime state and while
//! driving the scheduler's connection loop.

use thiserror::Error;

/// Errors raised resolving config against the control/renderer registries
/// or driving the scheduler's connection and dispatch loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A `controls[].module` name has no registered control factory.
    #[error("no control registered under type name {0:?}")]
    UnknownControl(String),
    /// A `dim_overrides` key doesn't name one of the control's declared dims.
    #[error("control {control:?} has no dimension named {param:?} to override")]
    UnknownOverrideAttribute {
        /// Offending control module name.
        control: String,
        /// Offending override key.
        param: String,
    },
    /// A `dim_overrides` value has the wrong shape for the dim it targets.
    #[error("control {control:?} override for {param:?} has the wrong shape")]
    InvalidOverrideShape {
        /// Offending control module name.
        control: String,
        /// Offending override key.
        param: String,
    },
    /// A `policy.module` name matches none of the built-in sampling policies.
    #[error("no policy registered under type name {0:?}")]
    UnknownPolicy(String),
    /// A `push`'s tensor frames arrived out of order relative to `result_keys`.
    #[error("push carried channel {got:?} where {expected:?} was expected")]
    UnexpectedChannel {
        /// Channel name `result_keys` declared at this position.
        expected: String,
        /// Channel name the tensor header actually carried.
        got: String,
    },
    /// A `logging.logger_modules` name matches none of the built-in loggers.
    #[error("no logger registered under type name {0:?}")]
    UnknownLogger(String),
    /// Error resolving or driving a renderer collaborator.
    #[error(transparent)]
    Render(#[from] threedb_render::RenderError),
    /// Error constructing the flattened search space from its control declarations.
    #[error(transparent)]
    SearchSpace(#[from] threedb_search::SearchSpaceError),
    /// Error registering or operating on the shared result buffer.
    #[error(transparent)]
    Buffer(#[from] threedb_buffer::BufferError),
    /// Error loading or merging the experiment config.
    #[error(transparent)]
    Config(#[from] threedb_config::ConfigError),
    /// Error spinning up a file-backed logger.
    #[error(transparent)]
    Logging(#[from] threedb_logging::LoggingError),
    /// Error serializing a config section into the opaque `info` bundle.
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
    /// Transport-level framing error on a worker connection.
    #[error(transparent)]
    Stream(#[from] threedb_proto::stream::StreamError),
    /// Underlying socket IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
