//! The per-process training loop.
//!
//! A [`TrainingWorker`] owns one shard and its sampler and repeatedly:
//!
//! 1. pulls a [`Batch`](crate::sampler::Batch),
//! 2. reads the touched rows from the shared store,
//! 3. scores positives and negatives and computes the logistic loss,
//! 4. back-propagates through the [`ScoreModel`],
//! 5. writes Adagrad deltas back with [`SharedEmbeddingStore::update`].
//!
//! Every `eval_interval` steps it can rank a sample of validation triples.
//! Workers never wait for each other.

use crate::config::TrainConfig;
use crate::error::Result;
use crate::evaluation::{CandidateSet, Evaluator, FilterSource, RankMetrics};
use crate::sampler::NegativeSamplingIterator;
use crate::scoring::{ScoreModel, TripleGrad};
use crate::store::{SharedEmbeddingStore, Table};
use dkge_core::{Shard, Triple};
use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Adagrad denominator offset.
const ADAGRAD_EPS: f32 = 1e-10;

/// Where a worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Constructed, no step taken yet.
    Idle,
    /// Drawing the next batch.
    Sampling,
    /// Reading rows and computing loss and gradients.
    Scoring,
    /// Writing Adagrad updates to the store.
    Updating,
    /// Ranking validation triples.
    Evaluating,
    /// `max_step` reached.
    Done,
}

/// Loss components of one step (or a sum of several).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StepLoss {
    pub loss: f32,
    pub pos_loss: f32,
    pub neg_loss: f32,
    pub regularization: f32,
}

impl AddAssign for StepLoss {
    fn add_assign(&mut self, rhs: Self) {
        self.loss += rhs.loss;
        self.pos_loss += rhs.pos_loss;
        self.neg_loss += rhs.neg_loss;
        self.regularization += rhs.regularization;
    }
}

impl StepLoss {
    fn scaled(self, by: f32) -> Self {
        Self {
            loss: self.loss * by,
            pos_loss: self.pos_loss * by,
            neg_loss: self.neg_loss * by,
            regularization: self.regularization * by,
        }
    }
}

/// What a worker did, written to `worker_{rank}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReport {
    pub rank: usize,
    /// Steps executed by this worker.
    pub steps: usize,
    pub init_step: usize,
    pub final_step: usize,
    pub elapsed_secs: f64,
    /// Mean loss over the last logging window.
    pub last_loss: Option<StepLoss>,
    /// Result of the most recent validation, if any ran.
    pub last_valid: Option<RankMetrics>,
}

/// Validation triples and the source of filter sets.
struct Validation {
    triples: Vec<Triple>,
    filter: Box<dyn FilterSource + Send>,
}

/// One training process' loop over its shard.
pub struct TrainingWorker<S: ScoreModel> {
    rank: usize,
    config: TrainConfig,
    store: Arc<SharedEmbeddingStore>,
    scorer: S,
    sampler: NegativeSamplingIterator,
    validation: Option<Validation>,
    state: WorkerState,
    step: usize,
}

impl<S: ScoreModel> TrainingWorker<S> {
    /// Set up a worker at `config.init_step`.
    pub fn new(
        rank: usize,
        shard: Arc<Shard>,
        store: Arc<SharedEmbeddingStore>,
        scorer: S,
        config: TrainConfig,
    ) -> Result<Self> {
        let sampler = NegativeSamplingIterator::new(
            shard,
            store.shape().n_entities,
            config.batch_size,
            config.neg_sample_size,
            config.neg_mode(),
            worker_seed(config.seed, rank),
        )?;
        Ok(Self {
            rank,
            step: config.init_step,
            config,
            store,
            scorer,
            sampler,
            validation: None,
            state: WorkerState::Idle,
        })
    }

    /// Validate on `triples` every `eval_interval` steps, filtering with `filter`.
    pub fn with_validation(mut self, triples: Vec<Triple>, filter: Box<dyn FilterSource + Send>) -> Self {
        self.validation = Some(Validation { triples, filter });
        self
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Global step counter (starts at `init_step`).
    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Run one optimisation step.
    pub fn step(&mut self) -> Result<StepLoss> {
        self.state = WorkerState::Sampling;
        let batch = self.sampler.next_batch();

        self.state = WorkerState::Scoring;
        let shape = self.store.shape();
        let (ent_ids, ent_pos) = unique_ids(
            batch
                .positives
                .iter()
                .flat_map(|t| [t.head, t.tail])
                .chain(batch.negatives.iter().copied()),
        );
        let (rel_ids, rel_pos) = unique_ids(batch.positives.iter().map(|t| t.relation));

        let ent = Rows::new(self.store.read(Table::Entity, &ent_ids)?, shape.entity_dim);
        let rel = Rows::new(self.store.read(Table::Relation, &rel_ids)?, shape.relation_dim);
        let mut ent_grad = Array2::<f32>::zeros((ent_ids.len(), shape.entity_dim));
        let mut rel_grad = Array2::<f32>::zeros((rel_ids.len(), shape.relation_dim));
        let mut tg = TripleGrad::zeros(shape.entity_dim, shape.relation_dim);

        let sample_weights: Vec<f32> = if self.config.non_uni_weight {
            let total: f32 = batch.weights.iter().sum();
            batch.weights.iter().map(|w| w / total).collect()
        } else {
            vec![1.0 / batch.len() as f32; batch.len()]
        };

        let mut accumulate = |t: &Triple, upstream: f32, tg: &mut TripleGrad| {
            let (h, r, tl) = (ent_pos[&t.head], rel_pos[&t.relation], ent_pos[&t.tail]);
            tg.clear();
            self.scorer.backward(ent.row(h), rel.row(r), ent.row(tl), upstream, tg);
            add_row(&mut ent_grad, h, &tg.head);
            add_row(&mut rel_grad, r, &tg.relation);
            add_row(&mut ent_grad, tl, &tg.tail);
        };

        let mut pos_loss = 0.0;
        let mut neg_loss = 0.0;
        for (i, pos) in batch.positives.iter().enumerate() {
            let sw = sample_weights[i];
            let score = |t: &Triple| {
                self.scorer.score(
                    ent.row(ent_pos[&t.head]),
                    rel.row(rel_pos[&t.relation]),
                    ent.row(ent_pos[&t.tail]),
                )
            };

            let pos_score = score(pos);
            pos_loss += sw * softplus(-pos_score);

            let negs: Vec<Triple> = batch.negatives_of(i).iter().map(|&e| batch.corrupt(i, e)).collect();
            let neg_scores: Vec<f32> = negs.iter().map(score).collect();
            // adversarial weights are constants: no gradient flows through them
            let neg_weights = batch.neg_mode.weights(&neg_scores);
            neg_loss += sw
                * neg_scores
                    .iter()
                    .zip(&neg_weights)
                    .map(|(s, w)| w * softplus(*s))
                    .sum::<f32>();

            accumulate(pos, -0.5 * sw * sigmoid(-pos_score), &mut tg);
            for ((neg, s), w) in negs.iter().zip(&neg_scores).zip(&neg_weights) {
                accumulate(neg, 0.5 * sw * w * sigmoid(*s), &mut tg);
            }
        }

        let mut regularization = 0.0;
        let coef = self.config.regularization_coef;
        if coef > 0.0 {
            let p = self.config.regularization_norm as i32;
            regularization += regularize(&ent.data, &mut ent_grad, coef, p);
            regularization += regularize(&rel.data, &mut rel_grad, coef, p);
        }

        self.state = WorkerState::Updating;
        self.apply_adagrad(Table::Entity, &ent_ids, &ent_grad)?;
        self.apply_adagrad(Table::Relation, &rel_ids, &rel_grad)?;

        self.step += 1;
        let loss = (pos_loss + neg_loss) / 2.0 + regularization;
        Ok(StepLoss {
            loss,
            pos_loss,
            neg_loss,
            regularization,
        })
    }

    /// `state += mean(g^2)`, `row -= lr * g / (sqrt(state) + eps)`.
    fn apply_adagrad(&self, table: Table, ids: &[u32], grad: &Array2<f32>) -> Result<()> {
        let mut deltas = Array2::<f32>::zeros(grad.dim());
        for (i, &id) in ids.iter().enumerate() {
            let g = grad.row(i);
            let mean_sq = g.iter().map(|x| x * x).sum::<f32>() / g.len() as f32;
            let state = self.store.accumulate_state(table, id, mean_sq)?;
            let denom = state.sqrt() + ADAGRAD_EPS;
            for (d, x) in deltas.row_mut(i).iter_mut().zip(g.iter()) {
                *d = -self.config.lr * x / denom;
            }
        }
        self.store.update(table, ids, &deltas)
    }

    /// Train from the current step up to `max_step`.
    pub fn run(&mut self) -> Result<WorkerReport> {
        let start = Instant::now();
        let init_step = self.step;
        let mut window = StepLoss::default();
        let mut window_steps = 0usize;
        let mut window_start = Instant::now();
        let mut last_loss = None;
        let mut last_valid = None;

        info!(rank = self.rank, init_step, max_step = self.config.max_step, "worker started");

        while self.step < self.config.max_step {
            window += self.step()?;
            window_steps += 1;

            if self.step % self.config.log_interval == 0 {
                let mean = window.scaled(1.0 / window_steps as f32);
                let secs = window_start.elapsed().as_secs_f64();
                info!(
                    rank = self.rank,
                    step = self.step,
                    loss = mean.loss,
                    pos_loss = mean.pos_loss,
                    neg_loss = mean.neg_loss,
                    regularization = mean.regularization,
                    steps_per_sec = window_steps as f64 / secs.max(f64::EPSILON),
                    "training"
                );
                last_loss = Some(mean);
                window = StepLoss::default();
                window_steps = 0;
                window_start = Instant::now();
            }

            if self.validation.is_some() && self.step % self.config.eval_interval == 0 {
                last_valid = Some(self.validate()?);
            }
        }
        if window_steps > 0 {
            last_loss = Some(window.scaled(1.0 / window_steps as f32));
        }

        self.state = WorkerState::Done;
        let elapsed_secs = start.elapsed().as_secs_f64();
        let steps = self.step - init_step;
        info!(rank = self.rank, steps, elapsed_secs, "worker finished");

        Ok(WorkerReport {
            rank: self.rank,
            steps,
            init_step,
            final_step: self.step,
            elapsed_secs,
            last_loss,
            last_valid,
        })
    }

    /// Rank a sample of the validation triples against the current tables.
    pub fn validate(&mut self) -> Result<RankMetrics> {
        let Some(validation) = self.validation.as_mut() else {
            return Ok(RankMetrics::default());
        };
        let resume_state = std::mem::replace(&mut self.state, WorkerState::Evaluating);

        let n = validation.triples.len();
        let take = ((n as f64 * f64::from(self.config.eval_percent)).ceil() as usize).min(n);
        let mut rng = XorShiftRng::seed_from_u64(worker_seed(self.config.seed, self.rank) ^ self.step as u64);
        let sample: Vec<Triple> = validation.triples.choose_multiple(&mut rng, take).copied().collect();

        let shape = self.store.shape();
        let filter: &mut dyn FilterSource = &mut *validation.filter;
        let evaluator = Evaluator::new(
            &self.scorer,
            self.store.snapshot(Table::Entity),
            self.store.snapshot(Table::Relation),
        )
        .with_batch_size(self.config.batch_size_eval);
        let metrics = evaluator.evaluate(
            &sample,
            CandidateSet::from_size(self.config.neg_sample_size_valid, shape.n_entities),
            Some(filter),
            self.config.seed ^ self.step as u64,
        );
        self.state = resume_state;
        let metrics = metrics?;

        info!(
            rank = self.rank,
            step = self.step,
            mrr = metrics.mrr,
            mr = metrics.mr,
            hits_at_1 = metrics.hits_at_1,
            hits_at_3 = metrics.hits_at_3,
            hits_at_10 = metrics.hits_at_10,
            "validation"
        );
        Ok(metrics)
    }
}

/// Rank this worker's test triples against the current store contents.
pub fn run_test<S: ScoreModel>(
    rank: usize,
    store: &SharedEmbeddingStore,
    scorer: &S,
    config: &TrainConfig,
    triples: &[Triple],
    filter: Option<&mut dyn FilterSource>,
) -> Result<RankMetrics> {
    let start = Instant::now();
    let n_entities = store.shape().n_entities;
    let metrics = Evaluator::new(scorer, store.snapshot(Table::Entity), store.snapshot(Table::Relation))
        .with_batch_size(config.batch_size_eval)
        .evaluate(
            triples,
            CandidateSet::from_size(config.neg_sample_size_test, n_entities),
            filter,
            worker_seed(config.seed, rank),
        )?;
    info!(
        rank,
        triples = triples.len(),
        secs = start.elapsed().as_secs_f64(),
        "test: {}",
        metrics.summary()
    );
    Ok(metrics)
}

/// Every `num_proc`-th triple starting at `rank`.
pub fn rank_slice(triples: &[Triple], rank: usize, num_proc: usize) -> Vec<Triple> {
    triples
        .iter()
        .skip(rank)
        .step_by(num_proc.max(1))
        .copied()
        .collect()
}

fn worker_seed(seed: u64, rank: usize) -> u64 {
    seed.wrapping_add((rank as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Row-major copy of a few store rows.
struct Rows {
    data: Vec<f32>,
    dim: usize,
}

impl Rows {
    fn new(matrix: Array2<f32>, dim: usize) -> Self {
        Self {
            data: matrix.iter().copied().collect(),
            dim,
        }
    }

    fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }
}

/// Sorted unique ids plus each id's position in that list.
fn unique_ids(ids: impl Iterator<Item = u32>) -> (Vec<u32>, HashMap<u32, usize>) {
    let mut unique: Vec<u32> = ids.collect();
    unique.sort_unstable();
    unique.dedup();
    let pos = unique.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    (unique, pos)
}

fn add_row(grad: &mut Array2<f32>, row: usize, values: &[f32]) {
    for (g, v) in grad.row_mut(row).iter_mut().zip(values) {
        *g += v;
    }
}

/// `coef * sum |x|^p` over `data`; adds its gradient into `grad`.
fn regularize(data: &[f32], grad: &mut Array2<f32>, coef: f32, p: i32) -> f32 {
    let mut reg = 0.0;
    for (x, g) in data.iter().zip(grad.iter_mut()) {
        reg += x.abs().powi(p);
        *g += coef * p as f32 * x.abs().powi(p - 1) * x.signum();
    }
    debug!(reg, "regularization");
    coef * reg
}

fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `ln(1 + e^x)`, i.e. `-logσ(-x)`.
fn softplus(x: f32) -> f32 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelName;
    use crate::scoring::Scorer;
    use crate::store::StoreShape;
    use dkge_core::EvalGraph;

    fn triples() -> Vec<Triple> {
        vec![
            Triple::new(0, 0, 1),
            Triple::new(1, 0, 2),
            Triple::new(2, 0, 3),
            Triple::new(3, 0, 0),
        ]
    }

    fn setup(dir: &std::path::Path, config: &TrainConfig) -> Arc<SharedEmbeddingStore> {
        let store = SharedEmbeddingStore::create(
            dir.join("store.bin"),
            StoreShape::new(4, 2, config.entity_dim(), config.relation_dim()),
        )
        .unwrap();
        store.init_uniform(config.emb_init(), config.seed);
        Arc::new(store)
    }

    fn config() -> TrainConfig {
        let mut c = TrainConfig::default()
            .with_hidden_dim(8)
            .with_batch_size(4)
            .with_neg_sample_size(2)
            .with_lr(0.1)
            .with_max_step(10);
        c.log_interval = 5;
        c
    }

    #[test]
    fn test_softplus_and_sigmoid() {
        assert!((softplus(0.0) - 2f32.ln()).abs() < 1e-6);
        assert!((softplus(50.0) - 50.0).abs() < 1e-4);
        assert!(softplus(-50.0) < 1e-10);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(-100.0) >= 0.0 && sigmoid(100.0) <= 1.0);
    }

    #[test]
    fn test_run_executes_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.init_step = 4;
        let store = setup(dir.path(), &config);
        let scorer = Scorer::from_config(&config).unwrap();
        let shard = Arc::new(Shard::new(0, triples()));

        let mut worker = TrainingWorker::new(0, shard, store, scorer, config).unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);
        let report = worker.run().unwrap();
        assert_eq!(report.steps, 6);
        assert_eq!(report.final_step, 10);
        assert_eq!(worker.state(), WorkerState::Done);
        assert!(report.last_loss.is_some());
    }

    #[test]
    fn test_untouched_relation_rows_stay_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let store = setup(dir.path(), &config);
        let before = store.read_row(Table::Relation, 1).unwrap();
        let before_0 = store.read_row(Table::Relation, 0).unwrap();

        let scorer = Scorer::from_config(&config).unwrap();
        let shard = Arc::new(Shard::new(0, triples()));
        TrainingWorker::new(0, shard, Arc::clone(&store), scorer, config)
            .unwrap()
            .run()
            .unwrap();

        assert_eq!(store.read_row(Table::Relation, 1).unwrap(), before);
        assert_ne!(store.read_row(Table::Relation, 0).unwrap(), before_0);
        assert!(store.state(Table::Relation, 0).unwrap() > 0.0);
    }

    #[test]
    fn test_loss_decreases() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config().with_model(ModelName::DistMult).with_max_step(400);
        config.regularization_coef = 0.0;
        let store = setup(dir.path(), &config);
        let scorer = Scorer::from_config(&config).unwrap();
        let shard = Arc::new(Shard::new(0, triples()));
        let mut worker = TrainingWorker::new(0, shard, store, scorer, config).unwrap();

        let losses: Vec<f32> = (0..400).map(|_| worker.step().unwrap().loss).collect();
        let first: f32 = losses[..20].iter().sum::<f32>() / 20.0;
        let last: f32 = losses[380..].iter().sum::<f32>() / 20.0;
        assert!(last < first, "loss went from {first} to {last}");
    }

    #[test]
    fn test_adversarial_and_weighted_losses_are_finite() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.neg_adversarial_sampling = true;
        config.non_uni_weight = true;
        let store = setup(dir.path(), &config);
        let scorer = Scorer::from_config(&config).unwrap();
        let shard = Arc::new(Shard::new(0, triples()));
        let mut worker = TrainingWorker::new(0, shard, store, scorer, config).unwrap();
        for _ in 0..5 {
            let l = worker.step().unwrap();
            assert!(l.loss.is_finite() && l.loss > 0.0);
            assert!(l.regularization > 0.0);
        }
    }

    #[test]
    fn test_validation_runs_on_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.valid = true;
        config.eval_interval = 5;
        config.resolve_eval_sizes(4);
        let store = setup(dir.path(), &config);
        let scorer = Scorer::from_config(&config).unwrap();
        let shard = Arc::new(Shard::new(0, triples()));
        let graph = EvalGraph::from_triples(4, triples());

        let mut worker = TrainingWorker::new(0, shard, store, scorer, config)
            .unwrap()
            .with_validation(vec![Triple::new(0, 0, 1), Triple::new(2, 0, 3)], Box::new(graph));
        let report = worker.run().unwrap();
        let valid = report.last_valid.unwrap();
        assert_eq!(valid.num_triples, 4);
        assert!(valid.mr >= 1.0);
    }

    #[test]
    fn test_validation_restores_the_loop_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.valid = true;
        config.resolve_eval_sizes(4);
        let store = setup(dir.path(), &config);
        let scorer = Scorer::from_config(&config).unwrap();
        let shard = Arc::new(Shard::new(0, triples()));
        let graph = EvalGraph::from_triples(4, triples());

        let mut worker = TrainingWorker::new(0, shard, store, scorer, config)
            .unwrap()
            .with_validation(vec![Triple::new(0, 0, 1)], Box::new(graph));
        worker.validate().unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);

        worker.step().unwrap();
        let after_step = worker.state();
        worker.validate().unwrap();
        assert_eq!(worker.state(), after_step);
        assert_ne!(worker.state(), WorkerState::Evaluating);
    }

    #[test]
    fn test_run_test_and_rank_slice() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let store = setup(dir.path(), &config);
        let scorer = Scorer::from_config(&config).unwrap();

        let slice = rank_slice(&triples(), 1, 3);
        assert_eq!(slice, vec![Triple::new(1, 0, 2)]);
        assert_eq!(rank_slice(&triples(), 0, 3).len(), 2);

        let mut graph = EvalGraph::from_triples(4, triples());
        let m = run_test(0, &store, &scorer, &config, &triples(), Some(&mut graph)).unwrap();
        assert_eq!(m.num_triples, 8);
        // filtered ranks over 4 entities cannot exceed 4
        assert!(m.mr <= 4.0);
    }
}
