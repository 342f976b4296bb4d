//! Sluice node: synthetic training loop over the loopback backends.
//!
//! ```bash
//! # Two simulated machines, two devices each, one-bit compression
//! RUST_LOG=info cargo run --bin sluice-node -- train --workers 2 --devices 2 --codec onebit
//!
//! # Per-tensor overrides come from the environment
//! SLUICE_CODEC_OVERRIDES="layer0.weight=topk:k=0.01" cargo run --bin sluice-node -- train
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use sluice_net::{LoopbackServer, LoopbackTransport, MmapSharedMemory};
use sluice_pipeline::{Backends, Engine, EngineError, EngineStats};
use sluice_types::{CodecConfig, ContributorId, DataType, EngineConfig, TensorSpec};

const PARAMS_KEY: &str = "params";

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "sluice-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Sluice: tensor communication scheduling and compression"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a synthetic multi-step training loop against an in-process server.
    Train(TrainArgs),
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    /// Number of gradient tensors per step.
    #[arg(long, default_value_t = 4)]
    tensors: usize,

    /// Size of each gradient tensor in bytes (float32).
    #[arg(long, default_value_t = 1 << 20)]
    bytes: usize,

    #[arg(long, default_value_t = 10)]
    steps: u32,

    /// Local devices per machine contributing to each reduction.
    #[arg(long)]
    devices: Option<usize>,

    /// Simulated machines pushing to the shared server.
    #[arg(long, default_value_t = 1)]
    workers: u32,

    /// Default codec, e.g. `onebit`, `topk:k=0.01`, `dithering:levels=8`.
    #[arg(long)]
    codec: Option<CodecConfig>,

    #[arg(long)]
    partition_bytes: Option<usize>,

    #[arg(long)]
    threads: Option<usize>,

    /// Seed for the synthetic gradients.
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=sluice_pipeline=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train(args) => run_train(args).await,
    }
}

// ── Train mode ────────────────────────────────────────────────────────────────

struct Cluster {
    server: Arc<LoopbackServer>,
    engines: Vec<Engine>,
    keys: Vec<String>,
    devices: usize,
}

async fn run_train(args: TrainArgs) -> Result<()> {
    let config = engine_config(&args)?;
    let cluster = Arc::new(build_cluster(&args, config)?);
    let cancel = Arc::new(AtomicBool::new(false));

    let mut training = {
        let cluster = cluster.clone();
        let cancel = cancel.clone();
        let steps = args.steps;
        let elements = args.bytes / DataType::Float32.element_bytes();
        let seed = args.seed;
        tokio::task::spawn_blocking(move || train(&cluster, steps, elements, seed, &cancel))
    };

    let outcome = tokio::select! {
        joined = &mut training => joined.context("training thread panicked")?,
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C, aborting in-flight tensors");
            cancel.store(true, Ordering::SeqCst);
            for engine in &cluster.engines {
                for key in &cluster.keys {
                    if let Err(e) = engine.abort(key) {
                        warn!(engine = %engine.id(), tensor = %key, error = %e, "abort failed");
                    }
                }
            }
            training.await.context("training thread panicked")?
        }
    };

    for engine in &cluster.engines {
        log_totals(engine.id(), &engine.stats());
        engine.shutdown();
    }
    cluster.server.close();
    outcome
}

fn engine_config(args: &TrainArgs) -> Result<EngineConfig> {
    let mut config = EngineConfig::from_env().context("reading SLUICE_* environment")?;
    if let Some(codec) = &args.codec {
        config.default_codec = codec.clone();
    }
    if let Some(bytes) = args.partition_bytes {
        config.partition_bytes = bytes;
    }
    if let Some(threads) = args.threads {
        config.worker_threads = threads;
    }
    if let Some(devices) = args.devices {
        config.local_size = devices;
    }
    config.validate()?;
    Ok(config)
}

/// One engine per simulated machine, all pushing to one loopback server.
/// Parameters are seeded on the server and pulled once by every engine.
fn build_cluster(args: &TrainArgs, config: EngineConfig) -> Result<Cluster> {
    let server = Arc::new(LoopbackServer::new(args.workers.max(1) as usize));
    let keys: Vec<String> = (0..args.tensors).map(|i| format!("layer{i}.weight")).collect();
    let devices = config.local_size;

    let mut engines = Vec::with_capacity(args.workers as usize);
    for worker in 0..args.workers.max(1) {
        let transport = LoopbackTransport::new(server.clone(), worker);
        let backends = Backends::new(Arc::new(transport))
            .with_shared_memory(Arc::new(MmapSharedMemory::new()));
        let engine = Engine::init(config.clone(), backends)?;

        for key in &keys {
            engine.declare(TensorSpec::gradient(key.clone(), args.bytes, DataType::Float32))?;
        }
        let params = engine.declare(TensorSpec::parameter(PARAMS_KEY, args.bytes, DataType::Float32))?;
        if worker == 0 {
            let initial = vec![0u8; args.bytes];
            for part in &params {
                server.publish(part.id, DataType::Float32, initial[part.range()].to_vec())?;
            }
        }
        engine.pull(PARAMS_KEY)?;
        let fetched = engine.wait(PARAMS_KEY)?;
        info!(engine = %engine.id(), worker, bytes = fetched.len(), "initial parameters pulled");

        engines.push(engine);
    }

    info!(
        workers = engines.len(),
        devices,
        tensors = keys.len(),
        bytes = args.bytes,
        codec = %config.default_codec,
        "cluster ready"
    );
    Ok(Cluster {
        server,
        engines,
        keys,
        devices,
    })
}

fn train(cluster: &Cluster, steps: u32, elements: usize, seed: u64, cancel: &AtomicBool) -> Result<()> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut previous: Vec<EngineStats> = cluster.engines.iter().map(Engine::stats).collect();

    for step in 1..=steps {
        if cancel.load(Ordering::SeqCst) {
            break;
        }
        let step_id = Uuid::new_v4();
        let started = Instant::now();

        for engine in &cluster.engines {
            for key in &cluster.keys {
                for device in 0..cluster.devices {
                    let grad: Vec<f32> = (0..elements).map(|_| rng.gen_range(-1.0..1.0)).collect();
                    engine.push_pull(key, ContributorId(device as u32), bytemuck::cast_slice(&grad))?;
                }
            }
        }

        for engine in &cluster.engines {
            for key in &cluster.keys {
                match engine.wait(key) {
                    Ok(_) => {}
                    Err(EngineError::Aborted { .. }) if cancel.load(Ordering::SeqCst) => {
                        info!(step, %step_id, "step aborted");
                        return Ok(());
                    }
                    Err(e) => return Err(e).with_context(|| format!("step {step}, tensor {key}")),
                }
            }
        }

        let current: Vec<EngineStats> = cluster.engines.iter().map(Engine::stats).collect();
        let sent: u64 = current.iter().zip(&previous).map(|(c, p)| c.bytes_sent - p.bytes_sent).sum();
        let received: u64 = current
            .iter()
            .zip(&previous)
            .map(|(c, p)| c.bytes_received - p.bytes_received)
            .sum();
        previous = current;

        info!(
            step,
            %step_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            bytes_sent = sent,
            bytes_received = received,
            "step done"
        );
    }
    Ok(())
}

fn log_totals(engine: Uuid, stats: &EngineStats) {
    info!(
        %engine,
        steps_done = stats.steps_done,
        steps_failed = stats.steps_failed,
        partitions_done = stats.partitions_done,
        partitions_failed = stats.partitions_failed,
        bytes_sent = stats.bytes_sent,
        bytes_received = stats.bytes_received,
        "engine totals"
    );
}
