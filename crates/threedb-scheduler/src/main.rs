// SPDX-License-Identifier: Apache-2.0
//! Scheduler binary: accepts worker connections over TCP, drives one policy
//! controller per `(environment, model)` pair, and dispatches the render
//! jobs those controllers mint.

mod error;
mod experiment;
mod policy_controller;
mod policy_factory;
mod progress;
mod registrations;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use threedb_buffer::ResultBuffer;
use threedb_config::LoggingConfig;
use threedb_control::ControlRegistry;
use threedb_logging::{JsonLogger, Logger, LoggerManager};
use threedb_proto::stream::{write_envelope, FrameReader};
use threedb_proto::{Envelope, InfoBundle, Job, JobId, SlotIndex};
use threedb_render::RendererRegistry;
use threedb_search::Policy;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::error::SchedulerError;
use crate::policy_controller::{PendingJob, PolicyController};
use crate::progress::ProgressHandles;

/// How often the progress bars refresh from live buffer/queue state.
const PROGRESS_TICK_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Parser)]
#[command(author, version, about = "Scene-perturbation stress-test scheduler")]
struct SchedulerCli {
    /// Root folder holding the environments and models the renderer loads from.
    root_folder: PathBuf,
    /// Path to the experiment config YAML file.
    config_file: PathBuf,
    /// Directory results and logs are written to.
    output_dir: PathBuf,
    /// TCP port workers connect to.
    #[arg(default_value_t = 7878)]
    port: u16,
    /// Only hand out jobs for the first model every renderer reports.
    #[arg(long)]
    single_model: bool,
    /// Maximum number of policy controllers sampling concurrently.
    #[arg(long, default_value_t = 4)]
    max_concurrent_policies: usize,
    /// Result buffer slot capacity.
    #[arg(long, default_value_t = 64)]
    buffer_capacity: usize,
}

/// One job handed to a worker but not yet resolved by a matching `push`.
struct PendingEntry {
    job: Job,
    reply_to: mpsc::UnboundedSender<(JobId, SlotIndex)>,
    times_issued: u32,
    first_issued_at: Instant,
}

/// Shared state every connection handler reads and mutates.
struct AppState {
    buffer: Arc<ResultBuffer>,
    info_bundle: InfoBundle,
    pending: Mutex<BTreeMap<JobId, PendingEntry>>,
    worker_count: AtomicU32,
    experiment_complete: AtomicBool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = SchedulerCli::parse();
    tokio::fs::create_dir_all(&cli.output_dir).await?;

    let config = threedb_config::load_config(&cli.config_file)?;

    let renderer_registry = RendererRegistry::new();
    let control_registry = ControlRegistry::new();
    registrations::register_renderers(&renderer_registry);
    registrations::register_controls(&control_registry);

    let search_space = Arc::new(experiment::build_search_space(&config.controls, &control_registry)?);

    let mut renderer = renderer_registry.create(&config.render_args.engine)?;
    let environments = renderer.enumerate_environments(&cli.root_folder);
    let models = renderer.enumerate_models(&cli.root_folder);
    drop(renderer);

    let info_bundle = experiment::build_info_bundle(&config, environments.clone(), models.clone())?;

    let models_to_run: Vec<String> = if cli.single_model {
        models.into_iter().take(1).collect()
    } else {
        models
    };

    let buffer = Arc::new(ResultBuffer::new(cli.buffer_capacity));
    let logger_manager = Arc::new(build_logger_manager(&config.logging, &cli.output_dir, &buffer).await?);
    let policy = policy_factory::build_policy(&config.policy, &search_space)?;

    let state = Arc::new(AppState {
        buffer: Arc::clone(&buffer),
        info_bundle,
        pending: Mutex::new(BTreeMap::new()),
        worker_count: AtomicU32::new(0),
        experiment_complete: AtomicBool::new(false),
    });

    let pairs: Vec<(String, String)> = environments
        .iter()
        .flat_map(|env| models_to_run.iter().map(move |model| (env.clone(), model.clone())))
        .collect();

    let progress = ProgressHandles::new();
    progress.set_policies_total(pairs.len() as u64);
    let (_, per_pair_total) = policy.hint_scheduler();
    progress.set_renderings_total((pairs.len() * per_pair_total) as u64);

    let policy_semaphore = Arc::new(Semaphore::new(cli.max_concurrent_policies.max(1)));
    let mut policy_tasks = JoinSet::new();

    // Every policy controller shares one buffer bit: a slot's refcount must
    // clear across *all* controllers plus the loggers, not just the one that
    // issued the job, or it never returns to the free list once more than
    // one (environment, model) pair is running.
    let policy_controller_regid = buffer.register()?;

    for (environment, model) in pairs {
        let (controller, outbox_rx) = PolicyController::new(
            environment,
            model,
            Arc::clone(&search_space),
            Arc::clone(&buffer),
            Arc::clone(&logger_manager),
            policy_controller_regid,
        );
        let controller = Arc::new(controller);
        spawn_outbox_drain(Arc::clone(&state), outbox_rx);

        let semaphore = Arc::clone(&policy_semaphore);
        let policy = Arc::clone(&policy);
        let progress = progress.clone();
        let label = controller.label();
        policy_tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                tracing::warn!(label = %label, "policy admission semaphore closed; skipping controller");
                return;
            };
            progress.start_policy();
            policy.run(controller.as_ref()).await;
            progress.finish_policy();
            tracing::info!(label = %label, "policy controller finished sampling");
        });
    }

    let completion_state = Arc::clone(&state);
    tokio::spawn(async move {
        while policy_tasks.join_next().await.is_some() {}
        completion_state.experiment_complete.store(true, Ordering::SeqCst);
        tracing::info!("every policy controller has finished sampling; workers drain out once pending empties");
    });

    let progress_for_tick = progress.clone();
    let state_for_tick = Arc::clone(&state);
    tokio::spawn(async move {
        loop {
            progress_for_tick.tick(&state_for_tick).await;
            tokio::time::sleep(PROGRESS_TICK_INTERVAL).await;
        }
    });

    let listener = TcpListener::bind(("0.0.0.0", cli.port)).await?;
    tracing::info!(port = cli.port, "scheduler listening for worker connections");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let state = Arc::clone(&state);
                        connections.spawn(async move {
                            if let Err(err) = handle_connection(stream, state).await {
                                tracing::warn!(%peer, error = %err, "worker connection ended with an error");
                            }
                        });
                    }
                    Err(err) => tracing::warn!(error = %err, "failed to accept a worker connection"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received, closing worker connections");
                break;
            }
        }
    }

    connections.shutdown().await;
    progress.finish();
    buffer.close();

    match Arc::try_unwrap(logger_manager) {
        Ok(manager) => manager.join().await,
        Err(_) => tracing::warn!("logger manager still referenced elsewhere at shutdown; skipping graceful join"),
    }

    tracing::info!(
        valid = buffer.valid_renders(),
        total = buffer.total_renders(),
        "scheduler exiting"
    );

    Ok(())
}

async fn build_logger_manager(
    logging: &LoggingConfig,
    output_dir: &Path,
    buffer: &Arc<ResultBuffer>,
) -> Result<LoggerManager, SchedulerError> {
    let mut loggers: Vec<Box<dyn Logger>> = Vec::with_capacity(logging.logger_modules.len());
    for name in &logging.logger_modules {
        match name.as_str() {
            "json" | "JsonLogger" | "JSONLogger" => {
                loggers.push(Box::new(JsonLogger::create(output_dir, buffer).await?));
            }
            other => return Err(SchedulerError::UnknownLogger(other.to_string())),
        }
    }
    Ok(LoggerManager::spawn(loggers, Arc::clone(buffer)))
}

fn spawn_outbox_drain(state: Arc<AppState>, mut outbox_rx: mpsc::UnboundedReceiver<PendingJob>) {
    tokio::spawn(async move {
        while let Some(pending_job) = outbox_rx.recv().await {
            let mut pending = state.pending.lock().await;
            pending.insert(
                pending_job.job.job_id,
                PendingEntry {
                    job: pending_job.job,
                    reply_to: pending_job.reply_to,
                    times_issued: 0,
                    first_issued_at: Instant::now(),
                },
            );
        }
    });
}

async fn handle_connection(stream: TcpStream, state: Arc<AppState>) -> Result<(), SchedulerError> {
    state.worker_count.fetch_add(1, Ordering::SeqCst);
    let result = handle_connection_inner(stream, &state).await;
    state.worker_count.fetch_sub(1, Ordering::SeqCst);
    result
}

async fn handle_connection_inner(stream: TcpStream, state: &AppState) -> Result<(), SchedulerError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    loop {
        let Some(envelope) = reader.next_envelope().await? else {
            return Ok(());
        };

        match envelope {
            Envelope::Info { bundle: None } => {
                let reply = Envelope::Info {
                    bundle: Some(state.info_bundle.clone()),
                };
                write_envelope(&mut write_half, &reply).await?;
            }
            Envelope::Decl { declared_outputs } => match state.buffer.declare(&declared_outputs) {
                Ok(()) => write_envelope(&mut write_half, &Envelope::Ack).await?,
                Err(err) => {
                    tracing::warn!(error = %err, "rejecting decl");
                    write_envelope(&mut write_half, &Envelope::BadQuery).await?;
                }
            },
            Envelope::Pull {
                batch_size,
                last_environment,
                last_model,
            } => {
                let jobs = pop_jobs(state, batch_size, last_environment.as_deref(), last_model.as_deref()).await;
                let reply = if jobs.is_empty() && state.experiment_complete.load(Ordering::SeqCst) {
                    Envelope::Die
                } else {
                    Envelope::Work { params_to_render: jobs }
                };
                write_envelope(&mut write_half, &reply).await?;
            }
            Envelope::Push { job, result_keys } => match handle_push(state, &mut reader, job, &result_keys).await {
                Ok(()) => write_envelope(&mut write_half, &Envelope::Ack).await?,
                Err(err) => {
                    tracing::warn!(error = %err, %job, "rejecting push");
                    write_envelope(&mut write_half, &Envelope::BadQuery).await?;
                }
            },
            Envelope::Info { bundle: Some(_) }
            | Envelope::Work { .. }
            | Envelope::Ack
            | Envelope::Die
            | Envelope::BadQuery => {
                write_envelope(&mut write_half, &Envelope::BadQuery).await?;
            }
        }
    }
}

/// `0` when both `last_environment` and `last_model` match `job`, `2` when
/// neither does, `1` for a partial match. Lower sorts first.
fn affinity_score(job: &Job, last_environment: Option<&str>, last_model: Option<&str>) -> u8 {
    let env_match = last_environment.is_some_and(|e| e == job.environment);
    let model_match = last_model.is_some_and(|m| m == job.model);
    match (env_match, model_match) {
        (true, true) => 0,
        (false, false) => 2,
        _ => 1,
    }
}

async fn pop_jobs(
    state: &AppState,
    batch_size: usize,
    last_environment: Option<&str>,
    last_model: Option<&str>,
) -> Vec<Job> {
    let mut pending = state.pending.lock().await;

    let mut ranked: Vec<(u32, u8, Instant, JobId)> = pending
        .iter()
        .map(|(job_id, entry)| {
            (
                entry.times_issued,
                affinity_score(&entry.job, last_environment, last_model),
                entry.first_issued_at,
                *job_id,
            )
        })
        .collect();
    ranked.sort_unstable();

    let mut jobs = Vec::with_capacity(batch_size.min(ranked.len()));
    for (.., job_id) in ranked.into_iter().take(batch_size) {
        if let Some(entry) = pending.get_mut(&job_id) {
            entry.times_issued += 1;
            jobs.push(entry.job.clone());
        }
    }
    jobs
}

async fn handle_push(
    state: &AppState,
    reader: &mut FrameReader<tokio::net::tcp::OwnedReadHalf>,
    job_id: JobId,
    result_keys: &[String],
) -> Result<(), SchedulerError> {
    let mut data = BTreeMap::new();
    for expected in result_keys {
        let header = reader.next_tensor_header().await?;
        if &header.channel != expected {
            return Err(SchedulerError::UnexpectedChannel {
                expected: expected.clone(),
                got: header.channel,
            });
        }
        let bytes = reader.next_tensor_data().await?;
        data.insert(header.channel, bytes);
    }
    reader.expect_done().await?;

    let entry = {
        let mut pending = state.pending.lock().await;
        pending.remove(&job_id)
    };

    let Some(entry) = entry else {
        tracing::debug!(%job_id, "push for a job no longer pending, discarding as a duplicate");
        state.buffer.record_duplicate_render();
        return Ok(());
    };

    let buffer = Arc::clone(&state.buffer);
    let slot = match tokio::task::spawn_blocking(move || buffer.allocate(&data))
        .await
        .map_err(|err| SchedulerError::Io(std::io::Error::other(err.to_string())))?
    {
        Ok(slot) => slot,
        Err(err) => {
            // The job's still good, only this push was malformed; put it back
            // so it stays eligible for reissue instead of stranding the
            // controller waiting on it forever.
            state.pending.lock().await.insert(job_id, entry);
            return Err(err.into());
        }
    };

    if entry.reply_to.send((job_id, slot)).is_err() {
        tracing::warn!(%job_id, "controller inbox closed before its result could be delivered");
        state.buffer.free(slot, -1)?;
        state.buffer.record_duplicate_render();
        return Ok(());
    }

    state.buffer.record_valid_render();
    Ok(())
}
