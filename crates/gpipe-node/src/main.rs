//! gpipe-node binary: inspect schedules and run demo pipelines on the host
//! backend.
//!
//! ```bash
//! # Print the clock cycles for 3 partitions and 4 micro-batches
//! cargo run --bin gpipe-node -- schedule --partitions 3 --chunks 4
//!
//! # Run 1..8 through two `x * 2 + 1` partitions in 4 micro-batches,
//! # then run the backward pass and report the stream events
//! RUST_LOG=debug cargo run --bin gpipe-node -- run --partitions 2 --chunks 4 \
//!     --input 1,2,3,4,5,6,7,8 --scale 2 --shift 1 --backward
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use gpipe_pipeline::host::{Affine, EventKind, HostBackend, HostTensor, Phase};
use gpipe_pipeline::{GPipe, Partition, Schedule};
use gpipe_types::{CheckpointMode, Device, GPipeConfig, GPipeError};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name    = "gpipe-node",
    version = env!("CARGO_PKG_VERSION"),
    about   = "Pipeline-parallel micro-batch scheduler"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the clock-cycle schedule for a pipeline shape.
    Schedule {
        #[arg(long, default_value_t = 2)]
        partitions: usize,

        #[arg(long, default_value_t = 4)]
        chunks: usize,

        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Run a mini-batch through a chain of affine partitions.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(long, default_value_t = 2)]
    partitions: usize,

    /// Micro-batches per mini-batch. Overrides the config file.
    #[arg(long)]
    chunks: Option<usize>,

    /// Comma-separated input values, e.g. `1,2,3,4`.
    #[arg(long, value_delimiter = ',', default_value = "1,2,3,4")]
    input: Vec<f32>,

    /// `always`, `except_last` or `never`. Overrides the config file.
    #[arg(long)]
    checkpoint: Option<String>,

    /// Comma-separated devices, one per partition, e.g. `cpu,accel:0`.
    #[arg(long, value_delimiter = ',')]
    devices: Option<Vec<String>>,

    /// JSON `GPipeConfig` file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 1.0)]
    scale: f32,

    #[arg(long, default_value_t = 0.0)]
    shift: f32,

    /// Run in evaluation mode (no checkpointing).
    #[arg(long)]
    eval: bool,

    /// Run the backward pass after the forward and report stream events.
    #[arg(long)]
    backward: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    // Default log level: INFO. Override with RUST_LOG=gpipe_pipeline=debug etc.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Schedule { partitions, chunks, json } => print_schedule(partitions, chunks, json),
        Command::Run(args) => run_pipeline(args),
    }
}

// ── Schedule mode ─────────────────────────────────────────────────────────────

fn print_schedule(partitions: usize, chunks: usize, json: bool) -> Result<()> {
    let schedule = Schedule::new(partitions, chunks);

    if json {
        let cycles: Vec<Vec<[usize; 2]>> = schedule
            .cycles()
            .iter()
            .map(|cycle| cycle.iter().map(|c| [c.partition, c.micro_batch]).collect())
            .collect();
        let doc = serde_json::json!({
            "partitions": partitions,
            "micro_batches": chunks,
            "cycles": cycles,
            "efficiency": schedule.efficiency(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    for (k, cycle) in schedule.cycles().iter().enumerate() {
        let cells: Vec<String> = cycle.iter().map(ToString::to_string).collect();
        println!("cycle {k:>3}  {}", cells.join(" "));
    }
    println!(
        "{} cycles, efficiency {:.1}%",
        schedule.total_cycles(),
        schedule.efficiency() * 100.0
    );
    Ok(())
}

// ── Run mode ──────────────────────────────────────────────────────────────────

fn load_config(args: &RunArgs) -> Result<GPipeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            GPipeConfig::from_json(&text)?
        }
        None => GPipeConfig::default(),
    };

    if let Some(chunks) = args.chunks {
        config.chunks = chunks;
    }
    if let Some(mode) = &args.checkpoint {
        config.checkpoint = CheckpointMode::parse(mode)
            .ok_or_else(|| GPipeError::Config(format!("unknown checkpoint mode {mode:?}")))?;
    }
    if let Some(names) = &args.devices {
        let devices = names
            .iter()
            .map(|name| {
                Device::parse(name.trim())
                    .ok_or_else(|| GPipeError::Device(format!("unknown device {name:?}")))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        config.devices = Some(devices);
    }

    config.validate()?;
    Ok(config)
}

fn run_pipeline(args: RunArgs) -> Result<()> {
    let config = load_config(&args)?;
    let devices = config.devices_for(args.partitions)?;

    let backend = Arc::new(HostBackend::new());
    let partitions: Vec<Arc<dyn Partition<HostTensor>>> = devices
        .iter()
        .enumerate()
        .map(|(i, device)| {
            let p = Affine::new(Arc::clone(&backend), format!("affine-{i}"), args.scale, args.shift)
                .on(*device);
            Arc::new(p) as Arc<dyn Partition<HostTensor>>
        })
        .collect();

    let mut model = GPipe::new(Arc::clone(&backend), partitions, config)?;
    model.train(!args.eval);

    info!(
        partitions = model.len(),
        chunks = model.chunks(),
        checkpoint = %model.checkpoint(),
        training = model.is_training(),
        "running demo pipeline"
    );

    let input = backend.tensor(args.input.clone());
    let outputs = model.forward(&[input])?;
    let output = outputs
        .first()
        .context("pipeline produced no output tensor")?;
    println!("output  {:?}", output.values());

    if args.backward {
        let visited = backend.backward(&outputs)?;
        let events = backend.events();
        let count = |kind: EventKind, phase: Phase| {
            events
                .iter()
                .filter(|e| e.kind == kind && e.phase == phase)
                .count()
        };
        println!("backward visited {} nodes", visited.len());
        println!("recompute nodes  {}", backend.tape().count_label("recompute"));
        println!(
            "copies  forward {}  backward {}",
            count(EventKind::Copy, Phase::Forward),
            count(EventKind::Copy, Phase::Backward)
        );
        println!(
            "waits   forward {}  backward {}",
            count(EventKind::Wait, Phase::Forward),
            count(EventKind::Wait, Phase::Backward)
        );
    }

    Ok(())
}
