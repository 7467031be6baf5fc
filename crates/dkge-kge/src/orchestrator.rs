//! Process lifecycle for a training run.
//!
//! The orchestrator prepares everything a child process needs as files in
//! the run directory, then re-executes the current program:
//!
//! | Child | Command line |
//! |-------|--------------|
//! | evaluation service | `{program} eval-server --graph graph.bin --socket eval.sock --connections N` |
//! | training worker | `{program} worker --manifest manifest.json --rank i --phase train` |
//! | test worker | `{program} worker --manifest manifest.json --rank i --phase test` |
//!
//! With `num_proc == 1` workers and the service run inside the calling
//! process instead.

use crate::checkpoint::{export_embeddings, load_checkpoint, prepare_run_dir, Checkpoint, CheckpointMeta};
use crate::config::TrainConfig;
use crate::error::{Error, Result};
use crate::evaluation::{FilterSource, RankMetrics};
use crate::scoring::Scorer;
use crate::service::{EvaluationService, ServiceClient};
use crate::store::{SharedEmbeddingStore, StoreShape, Table};
use crate::worker::{rank_slice, run_test, TrainingWorker, WorkerReport};
use dkge_core::graph::{load_triples, save_triples};
use dkge_core::{Dataset, EvalGraph, GraphPartitioner, Shard, Split};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{info, warn};

/// Line the evaluation service prints once it accepts connections.
pub const READY_LINE: &str = "ready";

/// Which half of the run a worker process performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Train,
    Test,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Train => "train",
            Self::Test => "test",
        })
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "train" => Ok(Self::Train),
            "test" => Ok(Self::Test),
            other => Err(Error::Configuration(format!("unknown phase `{other}`"))),
        }
    }
}

/// Everything a worker process needs, written to `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    /// Validated configuration with evaluation sizes resolved.
    pub config: TrainConfig,
    pub run_dir: PathBuf,
    pub store_path: PathBuf,
    pub socket_path: Option<PathBuf>,
    pub n_entities: usize,
    pub n_relations: usize,
    pub valid_path: Option<PathBuf>,
    pub test_path: Option<PathBuf>,
}

impl RunManifest {
    pub fn path(run_dir: &Path) -> PathBuf {
        run_dir.join("manifest.json")
    }

    pub fn shard_path(&self, rank: usize) -> PathBuf {
        self.run_dir.join(format!("shard_{rank}.bin"))
    }

    pub fn report_path(&self, rank: usize) -> PathBuf {
        self.run_dir.join(format!("worker_{rank}.json"))
    }

    pub fn test_report_path(&self, rank: usize) -> PathBuf {
        self.run_dir.join(format!("test_{rank}.json"))
    }

    pub fn save(&self) -> Result<()> {
        write_json(&Self::path(&self.run_dir), self)
    }

    pub fn load(path: &Path) -> Result<Self> {
        read_json(path)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush()?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    Ok(serde_json::from_reader(BufReader::new(File::open(path)?))?)
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_dir: PathBuf,
    /// One report per training worker, by rank.
    pub reports: Vec<WorkerReport>,
    pub total_steps: usize,
    /// Wall-clock time of the training phase.
    pub train_secs: f64,
    pub export: Option<CheckpointMeta>,
    pub test_metrics: Option<RankMetrics>,
}

/// A running evaluation service.
///
/// Dropping the handle without [`ServiceHandle::stop`] tears the service
/// down: a child is killed, an in-process service is sent `Shutdown`.
struct ServiceHandle {
    socket: PathBuf,
    runner: Option<ServiceRunner>,
}

enum ServiceRunner {
    InProcess(JoinHandle<Result<()>>),
    Child {
        child: Child,
        _stdout: BufReader<ChildStdout>,
    },
}

impl ServiceHandle {
    fn new(socket: &Path, runner: ServiceRunner) -> Self {
        Self {
            socket: socket.to_path_buf(),
            runner: Some(runner),
        }
    }

    /// Shut the service down and wait for it to exit.
    fn stop(mut self) -> Result<()> {
        let Some(runner) = self.runner.take() else {
            return Ok(());
        };
        if let Err(e) = ServiceClient::connect(&self.socket).and_then(ServiceClient::shutdown) {
            self.runner = Some(runner);
            return Err(e);
        }
        match runner {
            ServiceRunner::InProcess(handle) => handle
                .join()
                .map_err(|_| Error::Process("evaluation service thread panicked".into()))?,
            ServiceRunner::Child { mut child, .. } => {
                let status = child.wait()?;
                if status.success() {
                    Ok(())
                } else {
                    Err(Error::Process(format!("evaluation service exited with {status}")))
                }
            }
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        let Some(runner) = self.runner.take() else {
            return;
        };
        warn!(socket = %self.socket.display(), "tearing down evaluation service");
        match runner {
            ServiceRunner::InProcess(handle) => {
                // the serving thread leaves accept only on a Shutdown request
                if ServiceClient::connect(&self.socket)
                    .and_then(ServiceClient::shutdown)
                    .is_ok()
                {
                    let _ = handle.join();
                }
            }
            ServiceRunner::Child { mut child, .. } => {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        let _ = fs::remove_file(&self.socket);
    }
}

/// Removes the embedding store file when the run ends, however it ends.
struct StoreFile<'a>(&'a Path);

impl Drop for StoreFile<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(self.0) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(error = %e, path = %self.0.display(), "could not remove embedding store");
            }
        }
    }
}

/// Drives one training run from configuration to summary.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: TrainConfig,
    program: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(config: TrainConfig) -> Self {
        Self { config, program: None }
    }

    /// Binary re-executed for child processes (default: the current executable).
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Validate, load the dataset, create a run directory and run.
    pub fn run(&self) -> Result<RunSummary> {
        self.config.validate()?;
        let dataset = Dataset::load(&self.config.data_path, &self.config.dataset, &self.config.format)?;
        let run_dir = prepare_run_dir(&self.config.save_path, self.config.model_name, &self.config.dataset)?;
        self.run_with(dataset, &run_dir)
    }

    /// Run on an already loaded dataset inside an existing run directory.
    pub fn run_with(&self, dataset: Dataset, run_dir: &Path) -> Result<RunSummary> {
        let mut config = self.config.clone();
        config.validate()?;
        if config.mix_cpu_gpu {
            warn!("--mix_cpu_gpu has no effect: training runs on the CPU");
        }
        config.resolve_eval_sizes(dataset.n_entities());

        let shards = GraphPartitioner::new(config.partition_mode())
            .with_seed(config.seed)
            .partition(&dataset, config.num_proc)?;

        // resume before anything is spawned so shape errors surface early
        let checkpoint = match &config.resume_from {
            Some(dir) => {
                let ckpt = load_checkpoint(dir, &config.dataset, config.model_name)?;
                if ckpt.meta.step > config.max_step {
                    return Err(Error::Configuration(format!(
                        "checkpoint step {} is past max_step {}",
                        ckpt.meta.step, config.max_step
                    )));
                }
                config.init_step = ckpt.meta.step;
                Some(ckpt)
            }
            None => None,
        };

        let mut manifest = RunManifest {
            store_path: run_dir.join("store.bin"),
            run_dir: run_dir.to_path_buf(),
            socket_path: None,
            n_entities: dataset.n_entities(),
            n_relations: dataset.n_relations(),
            valid_path: None,
            test_path: None,
            config,
        };
        for shard in &shards {
            shard.save(manifest.shard_path(shard.rank))?;
        }
        drop(shards);

        let mut service = None;
        if manifest.config.needs_eval_service() {
            let graph_path = run_dir.join("graph.bin");
            let socket = run_dir.join("eval.sock");
            EvalGraph::from_dataset(&dataset).save(&graph_path)?;
            if manifest.config.valid {
                let path = run_dir.join("valid.bin");
                save_triples(&path, dataset.split(Split::Valid))?;
                manifest.valid_path = Some(path);
            }
            if manifest.config.test {
                let path = run_dir.join("test.bin");
                save_triples(&path, dataset.split(Split::Test))?;
                manifest.test_path = Some(path);
            }
            service = Some(self.start_service(&graph_path, &socket, manifest.config.num_connections())?);
            manifest.socket_path = Some(socket);
        }
        drop(dataset);

        let store_file = StoreFile(&manifest.store_path);
        let outcome = manifest
            .save()
            .and_then(|()| self.train_and_test(&manifest, checkpoint));

        let stopped = match service {
            Some(handle) if outcome.is_ok() => handle.stop(),
            failed => {
                // dropping the handle tears the service down
                drop(failed);
                Ok(())
            }
        };
        drop(store_file);

        let summary = outcome?;
        stopped?;
        Ok(summary)
    }

    fn train_and_test(
        &self,
        manifest: &RunManifest,
        checkpoint: Option<Checkpoint>,
    ) -> Result<RunSummary> {
        let config = &manifest.config;
        let shape = StoreShape::new(
            manifest.n_entities,
            manifest.n_relations,
            config.entity_dim(),
            config.relation_dim(),
        );
        let store = Arc::new(SharedEmbeddingStore::create(&manifest.store_path, shape)?);
        store.init_uniform(config.emb_init(), config.seed);
        if let Some(ckpt) = checkpoint {
            store.load(Table::Entity, &ckpt.entities)?;
            store.load(Table::Relation, &ckpt.relations)?;
            info!(step = ckpt.meta.step, "resumed from checkpoint");
        }
        store.flush()?;

        let start = Instant::now();
        if config.num_proc == 1 {
            train_rank(manifest, 0, Arc::clone(&store))?;
        } else {
            self.run_phase(manifest, Phase::Train)?;
        }
        let train_secs = start.elapsed().as_secs_f64();
        info!(train_secs, "training finished");

        let reports = (0..config.num_proc)
            .map(|rank| read_json::<WorkerReport>(&manifest.report_path(rank)))
            .collect::<Result<Vec<_>>>()?;
        let total_steps = reports.iter().map(|r| r.steps).sum();

        let export = match &config.save_emb {
            Some(dir) => Some(export_embeddings(dir, config, &store, config.max_step)?),
            None => None,
        };

        let test_metrics = if config.test {
            if config.num_proc == 1 {
                test_rank(manifest, 0, &store)?;
            } else {
                store.flush()?;
                self.run_phase(manifest, Phase::Test)?;
            }
            let per_rank = (0..config.num_proc)
                .map(|rank| read_json::<RankMetrics>(&manifest.test_report_path(rank)))
                .collect::<Result<Vec<_>>>()?;
            let merged = RankMetrics::merge(&per_rank);
            info!("test: {}", merged.summary());
            Some(merged)
        } else {
            None
        };

        Ok(RunSummary {
            run_dir: manifest.run_dir.clone(),
            reports,
            total_steps,
            train_secs,
            export,
            test_metrics,
        })
    }

    fn program(&self) -> Result<PathBuf> {
        match &self.program {
            Some(p) => Ok(p.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    /// Start the service and wait until it is listening.
    fn start_service(&self, graph: &Path, socket: &Path, connections: usize) -> Result<ServiceHandle> {
        if self.config.num_proc == 1 {
            let graph = EvalGraph::load(graph)?;
            let handle = EvaluationService::bind(graph, socket, connections)?.spawn();
            return Ok(ServiceHandle::new(socket, ServiceRunner::InProcess(handle)));
        }

        let mut child = Command::new(self.program()?)
            .arg("eval-server")
            .arg("--graph")
            .arg(graph)
            .arg("--socket")
            .arg(socket)
            .arg("--connections")
            .arg(connections.to_string())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Process(format!("could not start evaluation service: {e}")))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            return Err(Error::Process("evaluation service has no stdout".into()));
        };
        let mut stdout = BufReader::new(stdout);
        let mut line = String::new();
        stdout.read_line(&mut line)?;
        if line.trim() != READY_LINE {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Process(format!(
                "evaluation service did not report ready (got {:?})",
                line.trim()
            )));
        }
        info!(pid = child.id(), socket = %socket.display(), "evaluation service ready");
        Ok(ServiceHandle::new(
            socket,
            ServiceRunner::Child {
                child,
                _stdout: stdout,
            },
        ))
    }

    /// Spawn one worker process per rank and wait for all of them.
    fn run_phase(&self, manifest: &RunManifest, phase: Phase) -> Result<()> {
        let program = self.program()?;
        let manifest_path = RunManifest::path(&manifest.run_dir);

        let mut children = Vec::with_capacity(manifest.config.num_proc);
        for rank in 0..manifest.config.num_proc {
            let spawned = Command::new(&program)
                .arg("worker")
                .arg("--manifest")
                .arg(&manifest_path)
                .arg("--rank")
                .arg(rank.to_string())
                .arg("--phase")
                .arg(phase.to_string())
                .spawn();
            match spawned {
                Ok(child) => children.push((rank, child)),
                Err(e) => {
                    for (_, mut c) in children {
                        let _ = c.kill();
                        let _ = c.wait();
                    }
                    return Err(Error::Process(format!("could not spawn {phase} worker {rank}: {e}")));
                }
            }
        }
        info!(%phase, workers = children.len(), "spawned workers");

        // join every child before reporting any failure
        let mut failed = Vec::new();
        for (rank, mut child) in children {
            let status = child.wait()?;
            if !status.success() {
                failed.push(format!("worker {rank} ({status})"));
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::Process(format!("{phase} phase failed: {}", failed.join(", "))))
        }
    }
}

/// Train one rank against an opened store and write its report.
fn train_rank(manifest: &RunManifest, rank: usize, store: Arc<SharedEmbeddingStore>) -> Result<WorkerReport> {
    let config = manifest.config.clone();
    let shard = Arc::new(Shard::load(manifest.shard_path(rank))?);
    let scorer = Scorer::from_config(&config)?;

    let mut worker = TrainingWorker::new(rank, shard, store, scorer, config)?;
    if let (true, Some(valid), Some(socket)) =
        (manifest.config.valid, &manifest.valid_path, &manifest.socket_path)
    {
        let triples = rank_slice(&load_triples(valid)?, rank, manifest.config.num_proc);
        let client: Box<dyn FilterSource + Send> = Box::new(ServiceClient::connect(socket)?);
        worker = worker.with_validation(triples, client);
    }

    let report = worker.run()?;
    write_json(&manifest.report_path(rank), &report)?;
    Ok(report)
}

/// Rank one worker's slice of the test triples and write its metrics.
fn test_rank(manifest: &RunManifest, rank: usize, store: &SharedEmbeddingStore) -> Result<RankMetrics> {
    let config = &manifest.config;
    let scorer = Scorer::from_config(config)?;
    let triples = match &manifest.test_path {
        Some(path) => rank_slice(&load_triples(path)?, rank, config.num_proc),
        None => Vec::new(),
    };

    let mut client = match &manifest.socket_path {
        Some(socket) => Some(ServiceClient::connect(socket)?),
        None => None,
    };
    let filter = client.as_mut().map(|c| c as &mut dyn FilterSource);
    let metrics = run_test(rank, store, &scorer, config, &triples, filter)?;
    write_json(&manifest.test_report_path(rank), &metrics)?;
    Ok(metrics)
}

/// Entry point of a `worker` child process.
pub fn run_worker_process(manifest_path: &Path, rank: usize, phase: Phase) -> Result<()> {
    let manifest = RunManifest::load(manifest_path)?;
    if rank >= manifest.config.num_proc {
        return Err(Error::Configuration(format!(
            "rank {rank} out of range for {} workers",
            manifest.config.num_proc
        )));
    }
    let store = Arc::new(SharedEmbeddingStore::open(&manifest.store_path)?);
    match phase {
        Phase::Train => train_rank(&manifest, rank, Arc::clone(&store)).map(|_| ()),
        Phase::Test => test_rank(&manifest, rank, &store).map(|_| ()),
    }?;
    store.flush()
}

/// Entry point of an `eval-server` child process.
///
/// Prints [`READY_LINE`] on stdout once the socket is bound, then serves
/// until shut down.
pub fn run_eval_server(graph: &Path, socket: &Path, connections: usize) -> Result<()> {
    let service = EvaluationService::bind(EvalGraph::load(graph)?, socket, connections)?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{READY_LINE}")?;
    stdout.flush()?;
    drop(stdout);
    service.serve()
}
