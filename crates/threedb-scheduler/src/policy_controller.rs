// SPDX-License-Identifier: Apache-2.0
//! One controller per `(environment, model)` pair: implements
//! [`BatchRenderer`] so a [`Policy`] can drive it, turning packed sample
//! vectors into [`Job`]s the scheduler's main loop dispatches to workers.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use threedb_buffer::ResultBuffer;
use threedb_logging::{LogEvent, LoggerManager};
use threedb_proto::{Job, JobId, RenderArg, SlotIndex};
use threedb_search::{BatchRenderer, ChannelStacks, PackedSample, SearchSpace};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// A job minted by a [`PolicyController`], paired with the channel its
/// result slot index should be delivered back on.
pub struct PendingJob {
    /// The job to dispatch to a worker.
    pub job: Job,
    /// Where to deliver `(job_id, slot_index)` once a worker's `push`
    /// resolves this job.
    pub reply_to: mpsc::UnboundedSender<(JobId, SlotIndex)>,
}

/// Drives one `(environment, model)` pair's render traffic: mints jobs onto
/// a shared outbox the scheduler drains, and awaits their resolved slots on
/// a private inbox the scheduler's `push` handler feeds.
pub struct PolicyController {
    environment: String,
    model: String,
    search_space: Arc<SearchSpace>,
    buffer: Arc<ResultBuffer>,
    logger_manager: Arc<LoggerManager>,
    regid: u8,
    outbox_tx: mpsc::UnboundedSender<PendingJob>,
    inbox_tx: mpsc::UnboundedSender<(JobId, SlotIndex)>,
    inbox_rx: Mutex<mpsc::UnboundedReceiver<(JobId, SlotIndex)>>,
}

impl PolicyController {
    /// Wires a controller's outbox/inbox channels under the shared
    /// policy-controller buffer bit (`regid`). Every `PolicyController` in an
    /// experiment must be constructed with the *same* `regid` — mirroring
    /// the original's single `reg_id=1` shared by every policy controller
    /// (`original_source/threedb/scheduling/policy_controller.py`) — since a
    /// slot's refcount otherwise never reaches zero once more than one
    /// `(environment, model)` pair is running. Returns the controller and
    /// the receiving half of its outbox, which the scheduler holds and
    /// drains independently.
    pub fn new(
        environment: String,
        model: String,
        search_space: Arc<SearchSpace>,
        buffer: Arc<ResultBuffer>,
        logger_manager: Arc<LoggerManager>,
        regid: u8,
    ) -> (Self, mpsc::UnboundedReceiver<PendingJob>) {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        (
            Self {
                environment,
                model,
                search_space,
                buffer,
                logger_manager,
                regid,
                outbox_tx,
                inbox_tx,
                inbox_rx: Mutex::new(inbox_rx),
            },
            outbox_rx,
        )
    }

    /// `(environment, model)` label used for logs and progress display.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}/{}", self.environment, self.model)
    }
}

#[async_trait]
impl BatchRenderer for PolicyController {
    async fn render_batch(&self, samples: Vec<PackedSample>) -> ChannelStacks {
        let mut order_by_job: BTreeMap<JobId, (usize, Vec<RenderArg>)> = BTreeMap::new();
        for (order, sample) in samples.iter().enumerate() {
            let (args_map, control_order) =
                match self.search_space.unpack(&sample.continuous, &sample.discrete) {
                    Ok(unpacked) => unpacked,
                    Err(err) => {
                        tracing::error!(error = %err, label = %self.label(), "policy produced an out-of-bounds sample, skipping");
                        continue;
                    }
                };
            let render_args: Vec<RenderArg> = args_map
                .into_iter()
                .map(|((control, param), value)| RenderArg { control, param, value })
                .collect();
            let job = Job {
                job_id: Uuid::new_v4(),
                order,
                environment: self.environment.clone(),
                model: self.model.clone(),
                render_args: render_args.clone(),
                control_order,
            };
            order_by_job.insert(job.job_id, (order, render_args));
            if self
                .outbox_tx
                .send(PendingJob {
                    job,
                    reply_to: self.inbox_tx.clone(),
                })
                .is_err()
            {
                tracing::warn!(label = %self.label(), "scheduler no longer draining this controller's outbox");
            }
        }

        let expected = order_by_job.len();
        let mut per_index: Vec<Option<BTreeMap<String, Vec<u8>>>> = (0..samples.len()).map(|_| None).collect();
        let mut received = 0usize;
        let mut inbox = self.inbox_rx.lock().await;
        while received < expected {
            let Some((job_id, slot)) = inbox.recv().await else {
                tracing::error!(label = %self.label(), "inbox closed before every job resolved");
                break;
            };
            let Some((order, render_args)) = order_by_job.get(&job_id) else {
                tracing::warn!(label = %self.label(), %job_id, "push resolved a job this controller never issued");
                continue;
            };
            let order = *order;
            received += 1;

            let slot_data = match self.buffer.read(slot) {
                Ok(data) => data,
                Err(err) => {
                    tracing::error!(error = %err, "failed to read resolved slot");
                    continue;
                }
            };

            self.logger_manager
                .log(LogEvent {
                    job_id,
                    order,
                    environment: self.environment.clone(),
                    model: self.model.clone(),
                    render_args: render_args.clone(),
                    result_ix: slot,
                })
                .await;

            let channels = slot_data.into_iter().map(|(name, view)| (name, view.bytes)).collect();
            per_index[order] = Some(channels);

            if let Err(err) = self.buffer.free(slot, i16::from(self.regid)) {
                tracing::warn!(error = %err, "controller failed to release its bit on a resolved slot");
            }
        }

        let mut stacks: ChannelStacks = ChannelStacks::new();
        for row in per_index.into_iter().flatten() {
            for (channel, bytes) in row {
                stacks.entry(channel).or_default().push(bytes);
            }
        }
        stacks
    }
}
