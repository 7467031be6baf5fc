//! Splitting the training triples across worker processes.
//!
//! Three strategies are supported:
//!
//! | Mode | Shards | Relation rows | Use case |
//! |------|--------|---------------|----------|
//! | [`PartitionMode::Relation`] | disjoint, cover train | one writer each | multi-process, race-free relations |
//! | [`PartitionMode::Edge`] | disjoint, cover train | shared | multi-process, balanced edges |
//! | [`PartitionMode::Full`] | every shard = train | shared | single process / no partitioning |
//!
//! Relation partitioning is the only mechanism that keeps relation
//! embedding rows free of cross-process write races: a relation and every
//! triple that uses it belong to exactly one shard.

use crate::{Dataset, EntityId, Error, RelationId, Result, Triple};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::debug;

/// Initial count used by the subsampling weights (smoothing term).
const SUBSAMPLING_START: u32 = 4;

/// How training triples are assigned to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PartitionMode {
    /// Every worker trains on the full training set.
    #[default]
    Full,
    /// Relations are bucketed; a triple follows its relation.
    Relation,
    /// Triples are shuffled and dealt round-robin.
    Edge,
}

/// The training triples owned by one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shard {
    /// Worker rank this shard belongs to.
    pub rank: usize,
    /// Training triples.
    pub triples: Vec<Triple>,
    /// One subsampling weight per triple.
    pub weights: Vec<f32>,
    /// Relations that occur in this shard, ascending.
    pub relations: Vec<RelationId>,
    /// Degree of every entity within this shard.
    local_degree: HashMap<EntityId, u32>,
}

impl Shard {
    /// Build a shard, computing weights, relation set and local degrees.
    pub fn new(rank: usize, triples: Vec<Triple>) -> Self {
        let weights = subsampling_weights(&triples);
        let relations: BTreeSet<RelationId> = triples.iter().map(|t| t.relation).collect();

        let mut local_degree: HashMap<EntityId, u32> = HashMap::new();
        for t in &triples {
            *local_degree.entry(t.head).or_insert(0) += 1;
            *local_degree.entry(t.tail).or_insert(0) += 1;
        }

        Self {
            rank,
            triples,
            weights,
            relations: relations.into_iter().collect(),
            local_degree,
        }
    }

    /// Number of triples.
    pub fn len(&self) -> usize {
        self.triples.len()
    }

    /// Whether the shard has no triples.
    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// Degree of `entity` counted over this shard's triples only.
    pub fn degree(&self, entity: EntityId) -> u32 {
        self.local_degree.get(&entity).copied().unwrap_or(0)
    }

    /// Whether `relation` occurs in this shard.
    pub fn has_relation(&self, relation: RelationId) -> bool {
        self.relations.binary_search(&relation).is_ok()
    }

    /// Write the shard to a binary file (bincode).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, self)?;
        Ok(())
    }

    /// Read a shard written by [`Shard::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(bincode::deserialize_from(reader)?)
    }
}

/// Splits a dataset's training triples into per-worker shards.
#[derive(Debug, Clone)]
pub struct GraphPartitioner {
    mode: PartitionMode,
    seed: u64,
}

impl GraphPartitioner {
    /// Create a partitioner for the given mode.
    pub fn new(mode: PartitionMode) -> Self {
        Self { mode, seed: 0 }
    }

    /// Seed used by edge partitioning.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// The configured mode.
    pub fn mode(&self) -> PartitionMode {
        self.mode
    }

    /// Partition the training split of `dataset` into `num_proc` shards.
    pub fn partition(&self, dataset: &Dataset, num_proc: usize) -> Result<Vec<Shard>> {
        self.partition_triples(dataset.train(), num_proc)
    }

    /// Partition a slice of training triples into `num_proc` shards.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] when `num_proc` is zero, when relation mode
    /// has fewer distinct relations than workers, or when edge mode has
    /// fewer triples than workers.
    pub fn partition_triples(&self, train: &[Triple], num_proc: usize) -> Result<Vec<Shard>> {
        if num_proc == 0 {
            return Err(Error::Configuration("num_proc must be at least 1".into()));
        }

        let buckets: Vec<Vec<Triple>> = match self.mode {
            PartitionMode::Full => vec![train.to_vec(); num_proc],
            PartitionMode::Relation => {
                let owner = assign_relations(train, num_proc)?;
                let mut buckets = vec![Vec::new(); num_proc];
                for t in train {
                    buckets[owner[&t.relation]].push(*t);
                }
                buckets
            }
            PartitionMode::Edge => {
                if train.len() < num_proc {
                    return Err(Error::Configuration(format!(
                        "edge partitioning needs at least {num_proc} training triples, found {}",
                        train.len()
                    )));
                }
                let mut order: Vec<usize> = (0..train.len()).collect();
                order.shuffle(&mut XorShiftRng::seed_from_u64(self.seed));
                let mut buckets = vec![Vec::with_capacity(train.len() / num_proc + 1); num_proc];
                for (i, idx) in order.into_iter().enumerate() {
                    buckets[i % num_proc].push(train[idx]);
                }
                buckets
            }
        };

        let shards: Vec<Shard> = buckets
            .into_iter()
            .enumerate()
            .map(|(rank, triples)| Shard::new(rank, triples))
            .collect();

        for shard in &shards {
            debug!(
                rank = shard.rank,
                triples = shard.len(),
                relations = shard.relations.len(),
                mode = ?self.mode,
                "built shard"
            );
        }
        Ok(shards)
    }
}

/// Assign every relation present in `train` to one of `num_proc` buckets.
///
/// Relations are visited by descending triple count (ties broken by a
/// stable hash of the id, then the id) and each goes to the least loaded
/// bucket, lowest index first. The result only depends on the triples and
/// `num_proc`, so repeated runs agree.
pub fn assign_relations(train: &[Triple], num_proc: usize) -> Result<HashMap<RelationId, usize>> {
    let mut counts: HashMap<RelationId, usize> = HashMap::new();
    for t in train {
        *counts.entry(t.relation).or_insert(0) += 1;
    }

    if counts.len() < num_proc {
        return Err(Error::Configuration(format!(
            "relation partitioning needs at least as many relations as processes: \
             {} relations, num_proc = {num_proc}",
            counts.len()
        )));
    }

    let mut order: Vec<(RelationId, usize)> = counts.into_iter().collect();
    order.sort_by(|a, b| {
        b.1.cmp(&a.1)
            .then_with(|| stable_hash(a.0).cmp(&stable_hash(b.0)))
            .then_with(|| a.0.cmp(&b.0))
    });

    let mut load = vec![0usize; num_proc];
    let mut owner = HashMap::with_capacity(order.len());
    for (relation, count) in order {
        let bucket = (0..num_proc)
            .min_by_key(|&b| (load[b], b))
            .unwrap_or_else(|| unreachable!("num_proc >= 1 checked by caller"));
        load[bucket] += count;
        owner.insert(relation, bucket);
    }
    Ok(owner)
}

/// SplitMix64 finaliser; stable across platforms and runs.
fn stable_hash(relation: RelationId) -> u64 {
    let mut z = u64::from(relation).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// `sqrt(1 / (count(h, r) + count(t, r⁻¹)))` per triple.
///
/// Frequent (head, relation) and (tail, inverse relation) pairs get
/// smaller weights. Counts start at 4.
pub fn subsampling_weights(triples: &[Triple]) -> Vec<f32> {
    let mut head_rel: HashMap<(EntityId, RelationId), u32> = HashMap::new();
    let mut tail_rel: HashMap<(EntityId, RelationId), u32> = HashMap::new();
    for t in triples {
        *head_rel.entry((t.head, t.relation)).or_insert(SUBSAMPLING_START) += 1;
        *tail_rel.entry((t.tail, t.relation)).or_insert(SUBSAMPLING_START) += 1;
    }

    triples
        .iter()
        .map(|t| {
            let freq = head_rel[&(t.head, t.relation)] + tail_rel[&(t.tail, t.relation)];
            (1.0 / freq as f32).sqrt()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn toy() -> Vec<Triple> {
        vec![
            Triple::new(0, 0, 1),
            Triple::new(1, 0, 2),
            Triple::new(2, 0, 3),
            Triple::new(0, 1, 3),
            Triple::new(3, 1, 1),
            Triple::new(2, 1, 0),
        ]
    }

    #[test]
    fn test_relation_partition_is_disjoint_and_complete() {
        let shards = GraphPartitioner::new(PartitionMode::Relation)
            .partition_triples(&toy(), 2)
            .unwrap();
        assert_eq!(shards.len(), 2);

        let mut seen = HashSet::new();
        for shard in &shards {
            assert!(!shard.is_empty());
            for t in &shard.triples {
                assert!(seen.insert(*t));
            }
        }
        assert_eq!(seen, toy().into_iter().collect());
        assert_eq!(shards[0].relations.len(), 1);
        assert_eq!(shards[1].relations.len(), 1);
        assert_ne!(shards[0].relations, shards[1].relations);
    }

    #[test]
    fn test_relation_partition_rejects_too_many_workers() {
        let err = GraphPartitioner::new(PartitionMode::Relation)
            .partition_triples(&toy(), 3)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_relation_assignment_is_stable() {
        let a = assign_relations(&toy(), 2).unwrap();
        let b = assign_relations(&toy(), 2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_full_mode_replicates() {
        let shards = GraphPartitioner::new(PartitionMode::Full)
            .partition_triples(&toy(), 3)
            .unwrap();
        assert!(shards.iter().all(|s| s.triples == toy()));
    }

    #[test]
    fn test_edge_mode_deals_round_robin() {
        let shards = GraphPartitioner::new(PartitionMode::Edge)
            .with_seed(7)
            .partition_triples(&toy(), 4)
            .unwrap();
        let sizes: Vec<usize> = shards.iter().map(Shard::len).collect();
        assert_eq!(sizes, vec![2, 2, 1, 1]);
        assert_eq!(sizes.iter().sum::<usize>(), toy().len());
    }

    #[test]
    fn test_zero_workers() {
        assert!(GraphPartitioner::new(PartitionMode::Full)
            .partition_triples(&toy(), 0)
            .is_err());
    }

    #[test]
    fn test_local_degree_and_weights() {
        let shard = Shard::new(0, toy());
        assert_eq!(shard.degree(0), 3);
        assert_eq!(shard.degree(9), 0);
        assert!(shard.has_relation(1));
        assert!(!shard.has_relation(5));

        // (0, r0): count 5, (1, r0) as tail: count 5 -> sqrt(1/10)
        assert!((shard.weights[0] - (0.1f32).sqrt()).abs() < 1e-6);
        assert_eq!(shard.weights.len(), shard.len());
    }

    #[test]
    fn test_shard_binary_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard_0.bin");
        let shard = Shard::new(0, toy());
        shard.save(&path).unwrap();

        let loaded = Shard::load(&path).unwrap();
        assert_eq!(loaded.triples, shard.triples);
        assert_eq!(loaded.degree(2), shard.degree(2));
    }
}
