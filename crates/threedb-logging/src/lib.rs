// SPDX-License-Identifier: Apache-2.0
//! Background log consumers fed from the result buffer: a
//! [`LoggerManager`] fans each logged event out to every registered
//! [`Logger`], which reads its slot, serializes what it needs, and
//! releases its registrant bit.

mod json_logger;

pub use json_logger::JsonLogger;

use async_trait::async_trait;
use threedb_buffer::{BufferError, ResultBuffer};
use threedb_proto::{JobId, RenderArg, SlotIndex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One logged result, carrying the job's descriptor fields plus the slot
/// it landed in.
#[derive(Debug, Clone)]
pub struct LogEvent {
    /// Job this result answers.
    pub job_id: JobId,
    /// Position of this job within its originating batch.
    pub order: usize,
    /// Environment rendered.
    pub environment: String,
    /// Model rendered.
    pub model: String,
    /// Flattened render arguments used for this job.
    pub render_args: Vec<RenderArg>,
    /// Slot the result tensors were written to.
    pub result_ix: SlotIndex,
}

/// Errors raised by a [`Logger`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// The underlying result buffer rejected an operation.
    #[error(transparent)]
    Buffer(#[from] BufferError),
    /// Writing output failed.
    #[error("logger IO failure: {0}")]
    Io(#[from] std::io::Error),
    /// Serializing a log record failed.
    #[error("failed to serialize log record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A background consumer of [`LogEvent`]s, registered once with the result
/// buffer to acquire its own refcount bit.
#[async_trait]
pub trait Logger: Send {
    /// Reads `item`'s slot from `buffer`, serializes what this logger
    /// needs, then releases its registrant bit on the slot.
    async fn log(&mut self, buffer: &ResultBuffer, item: &LogEvent) -> Result<(), LoggingError>;

    /// Cleanup run once the manager shuts this logger down. No-op by
    /// default.
    async fn end(&mut self) {}
}

/// Fans logged events out to every registered logger, each running as its
/// own background task with its own bounded queue.
pub struct LoggerManager {
    senders: Vec<mpsc::Sender<LogEvent>>,
    handles: Vec<JoinHandle<()>>,
}

/// Queue depth for each logger's inbox before `log` backpressures the caller.
const LOGGER_QUEUE_DEPTH: usize = 256;

impl LoggerManager {
    /// Spawns one background task per logger in `loggers`.
    ///
    /// There is no explicit shutdown sentinel: dropping the manager (or
    /// calling [`LoggerManager::join`]) closes every logger's channel,
    /// which ends its task's receive loop, the same effect the source's
    /// `None` sentinel has.
    #[must_use]
    pub fn spawn(loggers: Vec<Box<dyn Logger>>, buffer: std::sync::Arc<ResultBuffer>) -> Self {
        let mut senders = Vec::with_capacity(loggers.len());
        let mut handles = Vec::with_capacity(loggers.len());

        for mut logger in loggers {
            let (tx, mut rx) = mpsc::channel::<LogEvent>(LOGGER_QUEUE_DEPTH);
            let buffer = std::sync::Arc::clone(&buffer);
            let handle = tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    if let Err(err) = logger.log(&buffer, &item).await {
                        tracing::warn!(error = %err, job_id = %item.job_id, "logger failed to process result");
                    }
                }
                logger.end().await;
            });
            senders.push(tx);
            handles.push(handle);
        }

        Self { senders, handles }
    }

    /// Fans `item` out to every logger's queue. Per-logger sends race
    /// independently; a slow logger backpressures only its own queue.
    pub async fn log(&self, item: LogEvent) {
        for sender in &self.senders {
            if sender.send(item.clone()).await.is_err() {
                tracing::warn!("a logger's task exited before its queue was closed");
            }
        }
    }

    /// Closes every logger's queue and waits for its task to drain and exit.
    pub async fn join(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "logger task panicked");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use threedb_proto::{ChannelSchema, DeclaredOutputs, ElementType};
    use uuid::Uuid;

    struct CountingLogger {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Logger for CountingLogger {
        async fn log(&mut self, buffer: &ResultBuffer, item: &LogEvent) -> Result<(), LoggingError> {
            let _ = buffer.read(item.result_ix)?;
            self.seen.fetch_add(1, Ordering::SeqCst);
            buffer.free(item.result_ix, 1)?;
            Ok(())
        }
    }

    fn declared_schema() -> DeclaredOutputs {
        let mut schema = DeclaredOutputs::new();
        schema.insert(
            "rgb".to_string(),
            ChannelSchema {
                shape: vec![3],
                dtype: ElementType::U8,
            },
        );
        schema
    }

    #[tokio::test]
    async fn manager_fans_out_and_joins_cleanly() {
        let buffer = Arc::new(ResultBuffer::new(2));
        buffer.declare(&declared_schema()).expect("declare");
        buffer.register().expect("register logger bit");

        let seen = Arc::new(AtomicUsize::new(0));
        let manager = LoggerManager::spawn(
            vec![Box::new(CountingLogger { seen: Arc::clone(&seen) })],
            Arc::clone(&buffer),
        );

        let mut data = BTreeMap::new();
        data.insert("rgb".to_string(), vec![1u8, 2, 3]);
        let slot = buffer.allocate(&data).expect("allocate");

        manager
            .log(LogEvent {
                job_id: Uuid::nil(),
                order: 0,
                environment: "env".into(),
                model: "model".into(),
                render_args: vec![],
                result_ix: slot,
            })
            .await;

        manager.join().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
