//! dkge CLI - multi-process knowledge graph embedding training.
//!
//! # Usage
//!
//! ```bash
//! # Train TransE on FB15k with 4 worker processes, one relation set each
//! dkge train --model_name TransE --dataset FB15k --data_path data \
//!     --num_proc 4 --rel_part --max_step 20000 --hidden_dim 400 --gamma 19.9 --lr 0.25
//!
//! # Validate during training, test afterwards and export the embeddings
//! dkge train --dataset FB15k --valid --test --save_emb emb
//!
//! # Continue from an export
//! dkge train --dataset FB15k --resume_from emb --max_step 40000
//! ```
//!
//! `worker` and `eval-server` are started by `train` itself and are hidden.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dkge_core::Dataset;
use dkge_kge::checkpoint::prepare_run_dir;
use dkge_kge::orchestrator::{run_eval_server, run_worker_process};
use dkge_kge::{ModelName, Orchestrator, Phase, TrainConfig};
use indicatif::ProgressBar;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "dkge")]
#[command(about = "Distributed knowledge graph embedding training", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train embeddings on a dataset
    Train(TrainArgs),

    /// Run one training or test worker (started by `train`)
    #[command(hide = true)]
    Worker {
        /// Run manifest written by the orchestrator
        #[arg(long)]
        manifest: PathBuf,

        /// Worker rank
        #[arg(long)]
        rank: usize,

        /// `train` or `test`
        #[arg(long, default_value = "train")]
        phase: Phase,
    },

    /// Serve graph queries for filtered evaluation (started by `train`)
    #[command(hide = true)]
    EvalServer {
        /// Binary edge list of the full graph
        #[arg(long)]
        graph: PathBuf,

        /// Unix socket to listen on
        #[arg(long)]
        socket: PathBuf,

        /// Maximum concurrent client connections
        #[arg(long)]
        connections: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelArg {
    #[value(name = "TransE")]
    TransE,
    #[value(name = "TransH")]
    TransH,
    #[value(name = "TransR")]
    TransR,
    #[value(name = "TransD")]
    TransD,
    #[value(name = "RESCAL")]
    Rescal,
    #[value(name = "DistMult")]
    DistMult,
    #[value(name = "ComplEx")]
    ComplEx,
    #[value(name = "RotatE")]
    RotatE,
    #[value(name = "pRotatE")]
    PRotatE,
}

impl From<ModelArg> for ModelName {
    fn from(m: ModelArg) -> Self {
        match m {
            ModelArg::TransE => Self::TransE,
            ModelArg::TransH => Self::TransH,
            ModelArg::TransR => Self::TransR,
            ModelArg::TransD => Self::TransD,
            ModelArg::Rescal => Self::Rescal,
            ModelArg::DistMult => Self::DistMult,
            ModelArg::ComplEx => Self::ComplEx,
            ModelArg::RotatE => Self::RotatE,
            ModelArg::PRotatE => Self::PRotatE,
        }
    }
}

#[derive(Args)]
struct TrainArgs {
    /// Model to train
    #[arg(long = "model_name", default_value = "TransE")]
    model_name: ModelArg,

    /// Root directory of the datasets
    #[arg(long = "data_path", default_value = "data")]
    data_path: PathBuf,

    /// Dataset name (a directory under data_path)
    #[arg(long, default_value = "FB15k")]
    dataset: String,

    /// Dataset format
    #[arg(long, default_value = "1")]
    format: String,

    /// Directory for run directories
    #[arg(long = "save_path", default_value = "ckpts")]
    save_path: PathBuf,

    /// Export embeddings to this directory after training
    #[arg(long = "save_emb")]
    save_emb: Option<PathBuf>,

    /// Start from embeddings exported by an earlier run
    #[arg(long = "resume_from")]
    resume_from: Option<PathBuf>,

    /// Steps per worker
    #[arg(long = "max_step", default_value_t = 80000)]
    max_step: usize,

    #[arg(long = "batch_size", default_value_t = 1024)]
    batch_size: usize,

    #[arg(long = "batch_size_eval", default_value_t = 8)]
    batch_size_eval: usize,

    /// Negatives per positive
    #[arg(long = "neg_sample_size", default_value_t = 128)]
    neg_sample_size: usize,

    /// Candidates per validation query; negative means all entities
    #[arg(long = "neg_sample_size_valid", default_value_t = 1000, allow_negative_numbers = true)]
    neg_sample_size_valid: i64,

    /// Candidates per test query; negative means all entities
    #[arg(long = "neg_sample_size_test", default_value_t = -1, allow_negative_numbers = true)]
    neg_sample_size_test: i64,

    #[arg(long = "hidden_dim", default_value_t = 256)]
    hidden_dim: usize,

    #[arg(long, default_value_t = 0.0001)]
    lr: f32,

    /// Margin for distance-based models
    #[arg(long, default_value_t = 12.0)]
    gamma: f32,

    /// GPU id; only -1 (CPU) is supported
    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    gpu: i32,

    #[arg(long = "mix_cpu_gpu")]
    mix_cpu_gpu: bool,

    /// Double entity width (ComplEx, RotatE)
    #[arg(long = "double_ent")]
    double_ent: bool,

    /// Double relation width (ComplEx)
    #[arg(long = "double_rel")]
    double_rel: bool,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[arg(long = "log_interval", default_value_t = 1000)]
    log_interval: usize,

    #[arg(long = "eval_interval", default_value_t = 10000)]
    eval_interval: usize,

    #[arg(long = "neg_adversarial_sampling")]
    neg_adversarial_sampling: bool,

    #[arg(long = "adversarial_temperature", default_value_t = 1.0)]
    adversarial_temperature: f32,

    /// Evaluate on the validation set during training
    #[arg(long)]
    valid: bool,

    /// Evaluate on the test set after training
    #[arg(long)]
    test: bool,

    #[arg(long = "regularization_coef", default_value_t = 0.000002)]
    regularization_coef: f32,

    #[arg(long = "regularization_norm", default_value_t = 3)]
    regularization_norm: u32,

    /// Weight positives by subsampling weights
    #[arg(long = "non_uni_weight")]
    non_uni_weight: bool,

    /// Number of worker processes
    #[arg(long = "num_proc", default_value_t = 1)]
    num_proc: usize,

    /// Give each worker its own set of relations
    #[arg(long = "rel_part")]
    rel_part: bool,

    /// Deal training edges across workers
    #[arg(long = "edge_part")]
    edge_part: bool,

    /// Fraction of validation triples ranked at each evaluation
    #[arg(long = "eval_percent", default_value_t = 1.0)]
    eval_percent: f32,
}

impl TrainArgs {
    fn into_config(self) -> TrainConfig {
        TrainConfig {
            model_name: self.model_name.into(),
            dataset: self.dataset,
            data_path: self.data_path,
            format: self.format,
            save_path: self.save_path,
            save_emb: self.save_emb,
            resume_from: self.resume_from,
            max_step: self.max_step,
            init_step: 0,
            batch_size: self.batch_size,
            batch_size_eval: self.batch_size_eval,
            neg_sample_size: self.neg_sample_size,
            neg_sample_size_valid: self.neg_sample_size_valid,
            neg_sample_size_test: self.neg_sample_size_test,
            hidden_dim: self.hidden_dim,
            lr: self.lr,
            gamma: self.gamma,
            gpu: self.gpu,
            mix_cpu_gpu: self.mix_cpu_gpu,
            double_ent: self.double_ent,
            double_rel: self.double_rel,
            seed: self.seed,
            log_interval: self.log_interval,
            eval_interval: self.eval_interval,
            neg_adversarial_sampling: self.neg_adversarial_sampling,
            adversarial_temperature: self.adversarial_temperature,
            valid: self.valid,
            test: self.test,
            regularization_coef: self.regularization_coef,
            regularization_norm: self.regularization_norm,
            non_uni_weight: self.non_uni_weight,
            num_proc: self.num_proc,
            rel_part: self.rel_part,
            edge_part: self.edge_part,
            eval_percent: self.eval_percent,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => cmd_train(args.into_config()),
        Commands::Worker {
            manifest,
            rank,
            phase,
        } => cmd_worker(&manifest, rank, phase),
        Commands::EvalServer {
            graph,
            socket,
            connections,
        } => cmd_eval_server(&graph, &socket, connections),
    }
}

/// Log to `{run_dir}/train.log` (appending, shared by every process of
/// the run) and warnings to stderr. `RUST_LOG` overrides the level.
fn init_logging(run_dir: &Path) -> Result<PathBuf> {
    let path = run_dir.join("train.log");
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(filter),
        )
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(LevelFilter::WARN))
        .try_init()
        .context("Failed to install the log subscriber")?;
    Ok(path)
}

fn load_dataset(config: &TrainConfig) -> Result<Dataset> {
    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Loading {}...", config.dataset));

    let dataset = Dataset::load(&config.data_path, &config.dataset, &config.format).with_context(|| {
        format!(
            "Failed to load dataset {} from {}",
            config.dataset,
            config.data_path.display()
        )
    })?;

    pb.finish_with_message(format!("Loaded in {:.2?}", start.elapsed()));
    Ok(dataset)
}

fn cmd_train(config: TrainConfig) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    let run_dir = prepare_run_dir(&config.save_path, config.model_name, &config.dataset)
        .with_context(|| format!("Failed to create a run directory in {}", config.save_path.display()))?;
    let log_path = init_logging(&run_dir)?;
    println!("Logs are being recorded at: {}", log_path.display());
    tracing::info!(
        model = %config.model_name,
        dataset = %config.dataset,
        num_proc = config.num_proc,
        run_dir = %run_dir.display(),
        "starting training"
    );

    let dataset = load_dataset(&config)?;
    println!(
        "{}: {} entities, {} relations, {} training triples",
        dataset.name(),
        dataset.n_entities(),
        dataset.n_relations(),
        dataset.train().len()
    );

    let summary = Orchestrator::new(config)
        .run_with(dataset, &run_dir)
        .context("Training failed")?;

    for report in &summary.reports {
        println!("worker {}: {} steps", report.rank, report.steps);
    }
    println!("total steps: {}", summary.total_steps);
    println!("training takes {:.3} seconds", summary.train_secs);

    if let Some(meta) = &summary.export {
        println!(
            "Saved embeddings: entity ({}, {}), relation ({}, {})",
            meta.n_entities, meta.entity_dim, meta.n_relations, meta.relation_dim
        );
    }
    if let Some(metrics) = &summary.test_metrics {
        println!("Test average MRR: {:.4}", metrics.mrr);
        println!("Test average MR: {:.4}", metrics.mr);
        println!("Test average HITS@1: {:.4}", metrics.hits_at_1);
        println!("Test average HITS@3: {:.4}", metrics.hits_at_3);
        println!("Test average HITS@10: {:.4}", metrics.hits_at_10);
    }
    Ok(())
}

fn cmd_worker(manifest: &Path, rank: usize, phase: Phase) -> Result<()> {
    let run_dir = manifest.parent().unwrap_or_else(|| Path::new("."));
    init_logging(run_dir)?;
    run_worker_process(manifest, rank, phase)
        .with_context(|| format!("{phase} worker {rank} failed"))
}

fn cmd_eval_server(graph: &Path, socket: &Path, connections: usize) -> Result<()> {
    let run_dir = socket.parent().unwrap_or_else(|| Path::new("."));
    init_logging(run_dir)?;
    run_eval_server(graph, socket, connections).context("Evaluation service failed")
}
