// SPDX-License-Identifier: Apache-2.0
//! Worker binary: connects to the scheduler, declares its output schema,
//! then loops pulling batches of jobs, rendering each through its control
//! pipeline, running inference and evaluation, and pushing the assembled
//! result back.

mod registrations;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use threedb_control::{group_args_by_control, ControlPipeline};
use threedb_proto::stream::{write_envelope, write_frame, FrameReader, StreamError};
use threedb_proto::wire::{encode_done, TensorHeader};
use threedb_proto::{DeclaredOutputs, Envelope, Job, JobId};
use threedb_render::{EnvHandle, EvaluatorRegistry, InferenceModelRegistry, ModelHandle, RendererRegistry, TensorBuf};
use threedb_worker::{
    build_control_pipeline, build_declared_outputs, check_evaluator_outputs, needs_reload, rgb_image_to_tensor,
    tensor_to_rgb_image, FakeResultsCache, PostControlRegistry, PreControlRegistry, RenderContext, WorkerError,
};
use tokio::net::TcpStream;
use uuid::Uuid;

/// How long to sleep after a `pull` came back with no jobs, before asking
/// again, matching the source client's `time.sleep(1)` idle wait.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(author, version, about = "Render worker for the 3DB stress-test orchestrator")]
struct WorkerCli {
    /// Folder containing all data (models, environments, etc).
    root_folder: PathBuf,
    /// How to contact the scheduler, as `host:port`.
    #[arg(long, short = 'a', default_value = "127.0.0.1:7878")]
    master_address: String,
    /// The GPU to render with (-1 for CPU).
    #[arg(long, default_value_t = -1)]
    gpu_id: i64,
    /// Number of CPU cores to use (omit to use all of them).
    #[arg(long)]
    cpu_cores: Option<usize>,
    /// Tile size used for GPU rendering.
    #[arg(long, default_value_t = 32)]
    tile_size: u32,
    /// How many jobs to ask for in a batch.
    #[arg(long, default_value_t = 1)]
    batch_size: usize,
    /// Always return the same result regardless of the parameters; useful
    /// to debug and produce large amounts of data quickly.
    #[arg(long)]
    fake_results: bool,
}

/// Errors raised while driving the worker's connect/pull/push loop.
#[derive(Debug, thiserror::Error)]
enum WorkerRuntimeError {
    /// Transport-level framing error on the scheduler connection.
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Error assembling one job's result.
    #[error(transparent)]
    Worker(#[from] WorkerError),
    /// The `decl` request was rejected by the scheduler.
    #[error("scheduler rejected this worker's declared output schema")]
    DeclRejected,
    /// A reply arrived of a kind this request never expects.
    #[error("unexpected reply kind for this request")]
    UnexpectedReply,
    /// The connection closed mid-exchange.
    #[error("scheduler closed the connection")]
    ConnectionClosed,
    /// Error resolving a renderer/evaluator/inference-model collaborator.
    #[error(transparent)]
    Render(#[from] threedb_render::RenderError),
    /// Error parsing the `info` bundle's opaque config sections.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = WorkerCli::parse();
    let worker_id = Uuid::new_v4();
    tracing::info!(%worker_id, root_folder = %cli.root_folder.display(), "starting worker");

    let renderer_registry = RendererRegistry::new();
    let evaluator_registry = EvaluatorRegistry::new();
    let inference_registry = InferenceModelRegistry::new();
    let pre_registry: PreControlRegistry = PreControlRegistry::new();
    let post_registry: PostControlRegistry = PostControlRegistry::new();
    registrations::register_renderers(&renderer_registry);
    registrations::register_evaluators(&evaluator_registry);
    registrations::register_inference_models(&inference_registry);
    registrations::register_controls(&pre_registry, &post_registry);

    let stream = TcpStream::connect(&cli.master_address).await?;
    tracing::info!(address = %cli.master_address, "connected to scheduler");
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);

    write_envelope(&mut write_half, &Envelope::Info { bundle: None }).await?;
    let Envelope::Info { bundle: Some(info) } = reader
        .next_envelope()
        .await?
        .ok_or(WorkerRuntimeError::ConnectionClosed)?
    else {
        return Err(WorkerRuntimeError::UnexpectedReply.into());
    };

    let mut renderer = renderer_registry.create(&render_engine_name(&info.render_args)?)?;
    let evaluation_module: EvaluationModuleRef = serde_json::from_value(info.evaluation_args.clone())?;
    let mut evaluator = evaluator_registry.create(&evaluation_module.module)?;
    let inference_cfg: InferenceCfgRef = serde_json::from_value(info.inference.clone())?;
    let mut inference_model = inference_registry.create(&inference_cfg.class)?;

    let renderer_outputs = renderer.declare_outputs();
    let evaluator_outputs = evaluator.declare_outputs();
    let declared_outputs =
        build_declared_outputs(renderer_outputs, evaluator_outputs.clone(), inference_cfg.output_shape.clone());

    write_envelope(&mut write_half, &Envelope::Decl { declared_outputs: declared_outputs.clone() }).await?;
    match reader.next_envelope().await?.ok_or(WorkerRuntimeError::ConnectionClosed)? {
        Envelope::Ack => {}
        _ => return Err(WorkerRuntimeError::DeclRejected.into()),
    }
    tracing::info!(channels = declared_outputs.len(), "declared output schema, entering pull/push loop");

    let mut last_environment: Option<String> = None;
    let mut last_model: Option<String> = None;
    let mut loaded_env: Option<EnvHandle> = None;
    let mut loaded_model: Option<ModelHandle> = None;
    let mut model_uid = String::new();
    let mut fake_cache = FakeResultsCache::new(cli.fake_results);

    loop {
        write_envelope(
            &mut write_half,
            &Envelope::Pull {
                batch_size: cli.batch_size,
                last_environment: last_environment.clone(),
                last_model: last_model.clone(),
            },
        )
        .await?;

        let jobs = match reader.next_envelope().await?.ok_or(WorkerRuntimeError::ConnectionClosed)? {
            Envelope::Die => {
                tracing::info!("received die from scheduler, exiting");
                break;
            }
            Envelope::Work { params_to_render } => params_to_render,
            _ => return Err(WorkerRuntimeError::UnexpectedReply.into()),
        };

        if jobs.is_empty() {
            tracing::debug!("nothing to do, sleeping");
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            continue;
        }

        for job in jobs {
            if needs_reload(last_environment.as_deref(), last_model.as_deref(), &job) {
                tracing::info!(environment = %job.environment, model = %job.model, "loading new environment/model pair");
                let env_handle = renderer.load_env(&job.environment)?;
                let model_handle = renderer.load_model(&job.model)?;
                model_uid = renderer.get_model_uid(model_handle);
                renderer.setup_render(model_handle, env_handle)?;
                loaded_env = Some(env_handle);
                loaded_model = Some(model_handle);
                last_environment = Some(job.environment.clone());
                last_model = Some(job.model.clone());
            }

            let result = match fake_cache.get() {
                Some(cached) => cached.clone(),
                None => {
                    let (Some(env_handle), Some(model_handle)) = (loaded_env, loaded_model) else {
                        tracing::warn!(job_id = %job.job_id, "no environment/model loaded yet, leaving job pending for reissue");
                        continue;
                    };
                    match render_one_job(
                        &job,
                        renderer.as_mut(),
                        evaluator.as_mut(),
                        inference_model.as_mut(),
                        &pre_registry,
                        &post_registry,
                        &model_uid,
                        model_handle,
                        env_handle,
                        &evaluator_outputs,
                        &inference_cfg.output_shape,
                    ) {
                        Ok(data) => {
                            fake_cache.offer(&data);
                            data
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, job_id = %job.job_id, "job failed before a result could be assembled; leaving it pending for reissue");
                            continue;
                        }
                    }
                }
            };

            send_push(&mut write_half, &mut reader, job.job_id, result).await?;
        }
    }

    Ok(())
}

/// Every opaque config section the worker needs a type-name out of.
#[derive(serde::Deserialize)]
struct EvaluationModuleRef {
    module: String,
}

#[derive(serde::Deserialize)]
struct InferenceCfgRef {
    class: String,
    output_shape: Vec<usize>,
}

fn render_engine_name(render_args: &serde_json::Value) -> Result<String, WorkerRuntimeError> {
    Ok(render_args
        .get("engine")
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string())
}

/// Runs one job end to end: reload is the caller's responsibility; this
/// builds the control pipeline, applies pre-controls, renders, applies
/// post-controls, unapplies pre-controls, runs inference and evaluation,
/// and assembles the pushed result dictionary.
#[allow(clippy::too_many_arguments)]
fn render_one_job(
    job: &Job,
    renderer: &mut dyn threedb_render::Renderer,
    evaluator: &mut dyn threedb_render::Evaluator,
    inference_model: &mut dyn threedb_render::InferenceModel,
    pre_registry: &PreControlRegistry,
    post_registry: &PostControlRegistry,
    model_uid: &str,
    model_handle: ModelHandle,
    env_handle: EnvHandle,
    evaluator_outputs: &DeclaredOutputs,
    output_shape: &[usize],
) -> Result<BTreeMap<String, TensorBuf>, WorkerError> {
    let mut pipeline: ControlPipeline<RenderContext> = build_control_pipeline(job, pre_registry, post_registry)?;
    let args_by_control = group_args_by_control(job);

    let label = evaluator.get_segmentation_label(model_uid);
    let mut context = renderer.get_context_dict(model_uid, &label.to_string());

    let mut render_output: Option<BTreeMap<String, TensorBuf>> = None;
    let rgb_image = pipeline.execute(&mut context, &args_by_control, |ctx| {
        let mut rendered = renderer.render(model_uid, model_handle, env_handle, ctx).map_err(|err| {
            threedb_control::ControlError::Failed {
                control: "render".to_string(),
                message: err.to_string(),
            }
        })?;
        let rgb_tensor = rendered.remove("rgb").ok_or_else(|| threedb_control::ControlError::Failed {
            control: "render".to_string(),
            message: WorkerError::MissingRgbChannel.to_string(),
        })?;
        let image = tensor_to_rgb_image(&rgb_tensor).map_err(|err| threedb_control::ControlError::Failed {
            control: "render".to_string(),
            message: err.to_string(),
        })?;
        render_output = Some(rendered);
        Ok(image)
    })?;

    let mut data = render_output.unwrap_or_default();
    data.insert("rgb".to_string(), rgb_image_to_tensor(&rgb_image));

    let prediction = inference_model.predict(&rgb_image)?;
    let target = evaluator.get_target(model_uid, &data);
    let stats = evaluator.summary_stats(&prediction, &target);
    check_evaluator_outputs(&stats, evaluator_outputs)?;

    let input_shape = vec![3, rgb_image.height, rgb_image.width];
    let output_tensor = evaluator.to_tensor(&prediction, output_shape, &input_shape)?;
    data.insert("output".to_string(), output_tensor);
    for (stat, value) in stats {
        data.insert(
            stat,
            TensorBuf {
                shape: vec![1],
                dtype: threedb_proto::ElementType::F64,
                bytes: value.to_le_bytes().to_vec(),
            },
        );
    }

    Ok(data)
}

/// Sends a `push`: the envelope naming the carried channels, then one
/// tensor-header/tensor-data frame pair per channel, closed by the `"done"`
/// marker, then awaits the `ack`/`bad_query` reply.
async fn send_push(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    reader: &mut FrameReader<tokio::net::tcp::OwnedReadHalf>,
    job_id: JobId,
    result: BTreeMap<String, TensorBuf>,
) -> Result<(), WorkerRuntimeError> {
    let result_keys: Vec<String> = result.keys().cloned().collect();
    write_envelope(write_half, &Envelope::Push { job: job_id, result_keys: result_keys.clone() }).await?;

    for key in &result_keys {
        let tensor = &result[key];
        let header = TensorHeader {
            channel: key.clone(),
            schema: threedb_proto::ChannelSchema {
                shape: tensor.shape.clone(),
                dtype: tensor.dtype,
            },
        };
        write_frame(write_half, &header.encode()?).await?;
        write_frame(write_half, &threedb_proto::wire::encode_tensor_data(&tensor.bytes)).await?;
    }
    write_frame(write_half, &encode_done()).await?;

    match reader.next_envelope().await?.ok_or(WorkerRuntimeError::ConnectionClosed)? {
        Envelope::Ack => Ok(()),
        _ => {
            tracing::warn!(%job_id, "scheduler rejected this push");
            Ok(())
        }
    }
}
