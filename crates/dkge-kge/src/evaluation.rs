//! Rank-based evaluation for knowledge graph embeddings.
//!
//! This module implements the standard link prediction protocol:
//!
//! 1. **Tail prediction**: score `(h, r, ?)` for every candidate, rank the true tail
//! 2. **Head prediction**: score `(?, r, t)` for every candidate, rank the true head
//!
//! # Filtered ranking
//!
//! | Setting | Description | Use Case |
//! |---------|-------------|----------|
//! | Raw | All candidates count | Pessimistic estimate |
//! | Filtered | Candidates forming a known triple are skipped | Standard benchmark |
//!
//! Known triples come from a [`FilterSource`]: the in-memory
//! [`EvalGraph`] or a [`ServiceClient`](crate::service::ServiceClient)
//! talking to the evaluation service.
//!
//! # Standard Metrics
//!
//! | Metric | Range | Description |
//! |--------|-------|-------------|
//! | MRR | (0, 1] | Mean Reciprocal Rank: average of 1/rank |
//! | MR | [1, n] | Mean Rank |
//! | Hits@1 | [0, 1] | Fraction with rank = 1 |
//! | Hits@3 | [0, 1] | Fraction with rank <= 3 |
//! | Hits@10 | [0, 1] | Fraction with rank <= 10 |

use std::collections::HashSet;

use dkge_core::{EntityId, EvalGraph, RelationId, Triple};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scoring::ScoreModel;

/// Rank-based evaluation results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankMetrics {
    /// Mean Reciprocal Rank: E\[1/rank\]
    pub mrr: f64,
    /// Mean Rank: E\[rank\]
    pub mr: f64,
    /// Hits@1: P(rank = 1)
    pub hits_at_1: f64,
    /// Hits@3: P(rank <= 3)
    pub hits_at_3: f64,
    /// Hits@10: P(rank <= 10)
    pub hits_at_10: f64,
    /// Number of ranks (two per evaluated triple)
    pub num_triples: usize,
}

impl RankMetrics {
    /// Compute metrics from a list of ranks.
    pub fn from_ranks(ranks: &[usize]) -> Self {
        if ranks.is_empty() {
            return Self::default();
        }

        let n = ranks.len() as f64;
        let mrr: f64 = ranks.iter().map(|&r| 1.0 / r as f64).sum::<f64>() / n;
        let mr: f64 = ranks.iter().map(|&r| r as f64).sum::<f64>() / n;
        let hits_at_1 = ranks.iter().filter(|&&r| r == 1).count() as f64 / n;
        let hits_at_3 = ranks.iter().filter(|&&r| r <= 3).count() as f64 / n;
        let hits_at_10 = ranks.iter().filter(|&&r| r <= 10).count() as f64 / n;

        Self {
            mrr,
            mr,
            hits_at_1,
            hits_at_3,
            hits_at_10,
            num_triples: ranks.len(),
        }
    }

    /// Merge metrics from several workers, weighted by their counts.
    pub fn merge(metrics: &[Self]) -> Self {
        let total_triples: usize = metrics.iter().map(|m| m.num_triples).sum();
        if total_triples == 0 {
            return Self::default();
        }

        let total_f = total_triples as f64;
        let weighted = |f: fn(&Self) -> f64| {
            metrics.iter().map(|m| f(m) * m.num_triples as f64).sum::<f64>() / total_f
        };

        Self {
            mrr: weighted(|m| m.mrr),
            mr: weighted(|m| m.mr),
            hits_at_1: weighted(|m| m.hits_at_1),
            hits_at_3: weighted(|m| m.hits_at_3),
            hits_at_10: weighted(|m| m.hits_at_10),
            num_triples: total_triples,
        }
    }

    /// Format as summary string.
    pub fn summary(&self) -> String {
        format!(
            "MRR: {:.4} | MR: {:.1} | H@1: {:.3} | H@3: {:.3} | H@10: {:.3} (n={})",
            self.mrr, self.mr, self.hits_at_1, self.hits_at_3, self.hits_at_10, self.num_triples
        )
    }
}

/// Compute rank of a target score among candidate scores.
///
/// Ties rank in favour of the target.
pub fn compute_rank(target_score: f32, all_scores: &[f32]) -> usize {
    1 + all_scores.iter().filter(|&&s| s > target_score).count()
}

/// Where known triples for filtering come from.
pub trait FilterSource {
    /// `(relation, tail)` pairs leaving each node.
    fn out_neighbors(&mut self, ids: &[EntityId]) -> Result<Vec<Vec<(RelationId, EntityId)>>>;

    /// `(relation, head)` pairs entering each node.
    fn in_neighbors(&mut self, ids: &[EntityId]) -> Result<Vec<Vec<(RelationId, EntityId)>>>;
}

impl FilterSource for EvalGraph {
    fn out_neighbors(&mut self, ids: &[EntityId]) -> Result<Vec<Vec<(RelationId, EntityId)>>> {
        Ok(ids.iter().map(|&id| EvalGraph::out_neighbors(self, id)).collect())
    }

    fn in_neighbors(&mut self, ids: &[EntityId]) -> Result<Vec<Vec<(RelationId, EntityId)>>> {
        Ok(ids.iter().map(|&id| EvalGraph::in_neighbors(self, id)).collect())
    }
}

/// Which entities a true entity is ranked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSet {
    /// Every entity.
    All,
    /// This many entities drawn uniformly per query batch.
    Sampled(usize),
}

impl CandidateSet {
    /// `neg_sample_size_{valid,test}` after resolution: at least
    /// `n_entities` means exhaustive.
    pub fn from_size(size: i64, n_entities: usize) -> Self {
        match usize::try_from(size) {
            Ok(k) if k < n_entities => Self::Sampled(k),
            _ => Self::All,
        }
    }
}

/// Filtered link prediction over fixed embedding matrices.
pub struct Evaluator<'a, S: ScoreModel> {
    scorer: &'a S,
    entities: Array2<f32>,
    relations: Array2<f32>,
    batch_size: usize,
}

impl<'a, S: ScoreModel> Evaluator<'a, S> {
    /// `entities` and `relations` are full snapshots of the two tables.
    pub fn new(scorer: &'a S, entities: Array2<f32>, relations: Array2<f32>) -> Self {
        Self {
            scorer,
            entities,
            relations,
            batch_size: 8,
        }
    }

    /// Triples sent to the filter source per query.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn n_entities(&self) -> usize {
        self.entities.nrows()
    }

    fn score(&self, h: EntityId, r: RelationId, t: EntityId) -> f32 {
        let row = |m: &Array2<f32>, i: u32| m.row(i as usize).to_vec();
        self.scorer.score(
            &row(&self.entities, h),
            &row(&self.relations, r),
            &row(&self.entities, t),
        )
    }

    /// Rank of the true tail among `candidates`, skipping known tails.
    pub fn rank_tail_filtered(&self, triple: &Triple, candidates: &[EntityId], known: &HashSet<EntityId>) -> usize {
        let true_score = self.score(triple.head, triple.relation, triple.tail);
        let scores: Vec<f32> = candidates
            .iter()
            .filter(|&&c| c != triple.tail && !known.contains(&c))
            .map(|&c| self.score(triple.head, triple.relation, c))
            .collect();
        compute_rank(true_score, &scores)
    }

    /// Rank of the true head among `candidates`, skipping known heads.
    pub fn rank_head_filtered(&self, triple: &Triple, candidates: &[EntityId], known: &HashSet<EntityId>) -> usize {
        let true_score = self.score(triple.head, triple.relation, triple.tail);
        let scores: Vec<f32> = candidates
            .iter()
            .filter(|&&c| c != triple.head && !known.contains(&c))
            .map(|&c| self.score(c, triple.relation, triple.tail))
            .collect();
        compute_rank(true_score, &scores)
    }

    /// Rank every triple on both sides and aggregate.
    ///
    /// With `filter = None` ranks are raw.
    pub fn evaluate(
        &self,
        triples: &[Triple],
        candidates: CandidateSet,
        mut filter: Option<&mut dyn FilterSource>,
        seed: u64,
    ) -> Result<RankMetrics> {
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let all: Vec<EntityId> = (0..self.n_entities() as EntityId).collect();
        let mut ranks = Vec::with_capacity(triples.len() * 2);

        for chunk in triples.chunks(self.batch_size) {
            let (known_tails, known_heads) = match filter.as_deref_mut() {
                Some(source) => known_sets(source, chunk)?,
                None => (vec![HashSet::new(); chunk.len()], vec![HashSet::new(); chunk.len()]),
            };

            let sampled: Vec<EntityId>;
            let pool: &[EntityId] = match candidates {
                CandidateSet::All => &all,
                CandidateSet::Sampled(k) => {
                    sampled = (0..k).map(|_| rng.gen_range(0..self.n_entities() as EntityId)).collect();
                    &sampled
                }
            };

            let chunk_ranks: Vec<(usize, usize)> = chunk
                .par_iter()
                .enumerate()
                .map(|(i, t)| {
                    (
                        self.rank_tail_filtered(t, pool, &known_tails[i]),
                        self.rank_head_filtered(t, pool, &known_heads[i]),
                    )
                })
                .collect();
            for (tail_rank, head_rank) in chunk_ranks {
                ranks.push(tail_rank);
                ranks.push(head_rank);
            }
        }

        Ok(RankMetrics::from_ranks(&ranks))
    }
}

/// Per-triple sets of other known tails and other known heads.
fn known_sets(
    source: &mut dyn FilterSource,
    chunk: &[Triple],
) -> Result<(Vec<HashSet<EntityId>>, Vec<HashSet<EntityId>>)> {
    let heads: Vec<EntityId> = chunk.iter().map(|t| t.head).collect();
    let tails: Vec<EntityId> = chunk.iter().map(|t| t.tail).collect();
    let out = source.out_neighbors(&heads)?;
    let inc = source.in_neighbors(&tails)?;

    let pick = |lists: &[Vec<(RelationId, EntityId)>], t: &Triple, i: usize| -> HashSet<EntityId> {
        lists
            .get(i)
            .map(|l| l.iter().filter(|(r, _)| *r == t.relation).map(|(_, e)| *e).collect())
            .unwrap_or_default()
    };
    let known_tails = chunk.iter().enumerate().map(|(i, t)| pick(&out, t, i)).collect();
    let known_heads = chunk.iter().enumerate().map(|(i, t)| pick(&inc, t, i)).collect();
    Ok((known_tails, known_heads))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{Scorer, ScoringFunction};
    use ndarray::array;

    #[test]
    fn test_rank_metrics_from_ranks() {
        let ranks = vec![1, 2, 3, 10, 100];
        let metrics = RankMetrics::from_ranks(&ranks);

        // MRR = (1/1 + 1/2 + 1/3 + 1/10 + 1/100) / 5
        assert!((metrics.mrr - 0.3886).abs() < 0.001);

        // MR = (1 + 2 + 3 + 10 + 100) / 5 = 23.2
        assert!((metrics.mr - 23.2).abs() < 0.1);

        assert!((metrics.hits_at_1 - 0.2).abs() < 1e-6);
        assert!((metrics.hits_at_3 - 0.6).abs() < 1e-6);
        assert!((metrics.hits_at_10 - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_rank_metrics_empty() {
        let metrics = RankMetrics::from_ranks(&[]);
        assert_eq!(metrics.num_triples, 0);
        assert_eq!(RankMetrics::merge(&[]), RankMetrics::default());
    }

    #[test]
    fn test_compute_rank() {
        let scores = vec![0.9, 0.8, 0.7, 0.5, 0.3];
        assert_eq!(compute_rank(0.95, &scores), 1);
        assert_eq!(compute_rank(0.8, &scores), 2);
        assert_eq!(compute_rank(0.1, &scores), 6);
    }

    #[test]
    fn test_metrics_merge() {
        let m1 = RankMetrics {
            mrr: 0.5,
            mr: 2.0,
            hits_at_1: 0.5,
            hits_at_3: 0.75,
            hits_at_10: 1.0,
            num_triples: 4,
        };
        let m2 = RankMetrics {
            mrr: 1.0,
            mr: 1.0,
            hits_at_1: 1.0,
            hits_at_3: 1.0,
            hits_at_10: 1.0,
            num_triples: 1,
        };

        let merged = RankMetrics::merge(&[m1, m2]);

        // Weighted average: (0.5 * 4 + 1.0 * 1) / 5 = 0.6
        assert!((merged.mrr - 0.6).abs() < 1e-6);
        assert_eq!(merged.num_triples, 5);
    }

    #[test]
    fn test_candidate_set_from_size() {
        assert_eq!(CandidateSet::from_size(-1, 10), CandidateSet::All);
        assert_eq!(CandidateSet::from_size(10, 10), CandidateSet::All);
        assert_eq!(CandidateSet::from_size(3, 10), CandidateSet::Sampled(3));
    }

    // TransE with A=[0,0], B=[1,0], C=[5,5], D=[1,0.1], r=[1,0]:
    // A + r = B exactly, D is close, C is far.
    fn toy() -> (Scorer, Array2<f32>, Array2<f32>) {
        let entities = array![[0.0, 0.0], [1.0, 0.0], [5.0, 5.0], [1.0, 0.1]];
        let relations = array![[1.0, 0.0]];
        (Scorer::new(ScoringFunction::TransE, 0.0, 1.0), entities, relations)
    }

    #[test]
    fn test_perfect_tail_ranks_first() {
        let (scorer, ent, rel) = toy();
        let eval = Evaluator::new(&scorer, ent, rel);
        let rank = eval.rank_tail_filtered(&Triple::new(0, 0, 1), &[0, 1, 2, 3], &HashSet::new());
        assert_eq!(rank, 1, "Perfect match should rank 1");
    }

    #[test]
    fn test_filtering_skips_known_triples() {
        let (scorer, ent, rel) = toy();
        let eval = Evaluator::new(&scorer, ent, rel);

        // true tail D is beaten by B unless (A, r, B) is filtered
        let t = Triple::new(0, 0, 3);
        assert_eq!(eval.rank_tail_filtered(&t, &[0, 1, 2, 3], &HashSet::new()), 2);

        let mut graph = EvalGraph::from_triples(4, [Triple::new(0, 0, 1), t]);
        let raw = eval.evaluate(&[t], CandidateSet::All, None, 0).unwrap();
        let filtered = eval
            .evaluate(&[t], CandidateSet::All, Some(&mut graph), 0)
            .unwrap();
        assert_eq!(raw.num_triples, 2);
        assert!((raw.hits_at_1 - 0.5).abs() < 1e-9);
        assert!((filtered.hits_at_1 - 1.0).abs() < 1e-9);
        assert!(filtered.mrr > raw.mrr);
    }

    #[test]
    fn test_sampled_candidates() {
        let (scorer, ent, rel) = toy();
        let eval = Evaluator::new(&scorer, ent, rel).with_batch_size(1);
        let m = eval
            .evaluate(&[Triple::new(0, 0, 1)], CandidateSet::Sampled(2), None, 5)
            .unwrap();
        assert_eq!(m.num_triples, 2);
        assert!(m.mr <= 3.0);
    }
}
