//! Negative sampling.
//!
//! [`NegativeSamplingIterator`] turns a shard into an endless stream of
//! [`Batch`]es. Calls alternate between corrupting tails and corrupting
//! heads, starting with tails.

use crate::error::{Error, Result};
use dkge_core::{EntityId, Shard, Triple};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which side of the positive triple is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorruptMode {
    /// Negatives replace the head entity.
    Head,
    /// Negatives replace the tail entity.
    Tail,
}

impl CorruptMode {
    fn flip(self) -> Self {
        match self {
            Self::Head => Self::Tail,
            Self::Tail => Self::Head,
        }
    }
}

/// How negatives are weighted in the loss.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum NegMode {
    /// Every negative counts `1 / k`.
    Uniform,
    /// Softmax over `temperature * score`; harder negatives count more.
    Adversarial { temperature: f32 },
}

impl NegMode {
    /// Loss weights for one positive's negative scores. Always sums to 1.
    pub fn weights(&self, neg_scores: &[f32]) -> Vec<f32> {
        let k = neg_scores.len();
        match *self {
            Self::Uniform => vec![1.0 / k as f32; k],
            Self::Adversarial { temperature } => {
                let max = neg_scores
                    .iter()
                    .map(|s| s * temperature)
                    .fold(f32::NEG_INFINITY, f32::max);
                let exp: Vec<f32> = neg_scores.iter().map(|s| (s * temperature - max).exp()).collect();
                let sum: f32 = exp.iter().sum();
                exp.into_iter().map(|e| e / sum).collect()
            }
        }
    }
}

/// One training step's worth of positives and negatives.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Indices into the shard's triples.
    pub indices: Vec<usize>,
    /// The positive triples, one per index.
    pub positives: Vec<Triple>,
    /// Subsampling weight of each positive.
    pub weights: Vec<f32>,
    /// `neg_sample_size` entity ids per positive, row-major.
    pub negatives: Vec<EntityId>,
    pub neg_sample_size: usize,
    pub mode: CorruptMode,
    pub neg_mode: NegMode,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.positives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positives.is_empty()
    }

    /// Negatives drawn for the `i`-th positive.
    pub fn negatives_of(&self, i: usize) -> &[EntityId] {
        &self.negatives[i * self.neg_sample_size..(i + 1) * self.neg_sample_size]
    }

    /// The `i`-th positive with its corrupted side replaced by `entity`.
    pub fn corrupt(&self, i: usize, entity: EntityId) -> Triple {
        match self.mode {
            CorruptMode::Head => self.positives[i].with_head(entity),
            CorruptMode::Tail => self.positives[i].with_tail(entity),
        }
    }
}

/// Endless, seeded batch stream over one shard.
///
/// Positives are visited in a shuffled order that is reshuffled every
/// pass; a batch that runs off the end of a pass continues into the next
/// one, so every batch holds exactly `batch_size` positives.
#[derive(Debug)]
pub struct NegativeSamplingIterator {
    shard: Arc<Shard>,
    n_entities: u32,
    batch_size: usize,
    neg_sample_size: usize,
    neg_mode: NegMode,
    rng: XorShiftRng,
    order: Vec<usize>,
    cursor: usize,
    next_mode: CorruptMode,
    batches: u64,
}

impl NegativeSamplingIterator {
    /// Create an iterator positioned at its first (tail-corrupt) batch.
    ///
    /// # Errors
    ///
    /// Sampling error for an empty shard; configuration error when
    /// `batch_size`, `neg_sample_size` or `n_entities` is zero.
    pub fn new(
        shard: Arc<Shard>,
        n_entities: usize,
        batch_size: usize,
        neg_sample_size: usize,
        neg_mode: NegMode,
        seed: u64,
    ) -> Result<Self> {
        if shard.is_empty() {
            return Err(dkge_core::Error::Sampling(format!(
                "shard {} has no training triples",
                shard.rank
            ))
            .into());
        }
        if batch_size == 0 || neg_sample_size == 0 || n_entities == 0 {
            return Err(Error::Configuration(format!(
                "sampler needs positive sizes (batch_size = {batch_size}, \
                 neg_sample_size = {neg_sample_size}, n_entities = {n_entities})"
            )));
        }
        let n_entities = u32::try_from(n_entities)
            .map_err(|_| Error::Configuration(format!("{n_entities} entities exceed the id space")))?;

        let mut rng = XorShiftRng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..shard.len()).collect();
        order.shuffle(&mut rng);

        Ok(Self {
            shard,
            n_entities,
            batch_size,
            neg_sample_size,
            neg_mode,
            rng,
            order,
            cursor: 0,
            next_mode: CorruptMode::Tail,
            batches: 0,
        })
    }

    /// Mode the next batch will use.
    pub fn next_mode(&self) -> CorruptMode {
        self.next_mode
    }

    /// Batches produced so far.
    pub fn batches_drawn(&self) -> u64 {
        self.batches
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    fn next_index(&mut self) -> usize {
        if self.cursor == self.order.len() {
            self.order.shuffle(&mut self.rng);
            self.cursor = 0;
        }
        let idx = self.order[self.cursor];
        self.cursor += 1;
        idx
    }

    fn draw_negative(&mut self, truth: EntityId) -> EntityId {
        let e = self.rng.gen_range(0..self.n_entities);
        if e == truth && self.n_entities > 1 {
            // one redraw; a second hit is kept
            self.rng.gen_range(0..self.n_entities)
        } else {
            e
        }
    }

    /// Produce the next batch and flip the corruption side.
    pub fn next_batch(&mut self) -> Batch {
        let mode = self.next_mode;
        let indices: Vec<usize> = (0..self.batch_size).map(|_| self.next_index()).collect();
        let positives: Vec<Triple> = indices.iter().map(|&i| self.shard.triples[i]).collect();
        let weights: Vec<f32> = indices.iter().map(|&i| self.shard.weights[i]).collect();

        let mut negatives = Vec::with_capacity(self.batch_size * self.neg_sample_size);
        for t in &positives {
            let truth = match mode {
                CorruptMode::Head => t.head,
                CorruptMode::Tail => t.tail,
            };
            for _ in 0..self.neg_sample_size {
                negatives.push(self.draw_negative(truth));
            }
        }

        self.next_mode = mode.flip();
        self.batches += 1;

        Batch {
            indices,
            positives,
            weights,
            negatives,
            neg_sample_size: self.neg_sample_size,
            mode,
            neg_mode: self.neg_mode,
        }
    }
}

impl Iterator for NegativeSamplingIterator {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        Some(self.next_batch())
    }
}
