//! Property-based tests for graph partitioning.
//!
//! These tests verify invariants that must hold for any training set:
//! - Relation partitioning covers the training set exactly once
//! - No relation is owned by two shards
//! - Edge partitioning is a disjoint cover
//! - Relation assignment is deterministic

use dkge_core::{partition::assign_relations, GraphPartitioner, PartitionMode, Triple};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

/// Generate a training set over a small vocabulary.
fn arb_train() -> impl Strategy<Value = Vec<Triple>> {
    prop::collection::vec((0u32..20, 0u32..8, 0u32..20), 1..120)
        .prop_map(|v| v.into_iter().map(Triple::from).collect())
}

fn multiset(triples: &[Triple]) -> HashMap<Triple, usize> {
    let mut m = HashMap::new();
    for t in triples {
        *m.entry(*t).or_insert(0) += 1;
    }
    m
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn relation_shards_partition_the_train_set(train in arb_train(), num_proc in 1usize..6) {
        let distinct: HashSet<u32> = train.iter().map(|t| t.relation).collect();
        let result = GraphPartitioner::new(PartitionMode::Relation).partition_triples(&train, num_proc);

        if num_proc > distinct.len() {
            prop_assert!(result.is_err());
            return Ok(());
        }
        let shards = result.unwrap();
        prop_assert_eq!(shards.len(), num_proc);

        let union: Vec<Triple> = shards.iter().flat_map(|s| s.triples.iter().copied()).collect();
        prop_assert_eq!(multiset(&union), multiset(&train));

        let mut owner: HashMap<u32, usize> = HashMap::new();
        for shard in &shards {
            prop_assert!(!shard.is_empty(), "shard {} is empty", shard.rank);
            for t in &shard.triples {
                let prev = owner.insert(t.relation, shard.rank);
                prop_assert!(prev.is_none() || prev == Some(shard.rank),
                    "relation {} in shards {:?} and {}", t.relation, prev, shard.rank);
            }
        }
    }

    #[test]
    fn edge_shards_are_a_disjoint_cover(train in arb_train(), num_proc in 1usize..6, seed in any::<u64>()) {
        prop_assume!(train.len() >= num_proc);
        let shards = GraphPartitioner::new(PartitionMode::Edge)
            .with_seed(seed)
            .partition_triples(&train, num_proc)
            .unwrap();

        let union: Vec<Triple> = shards.iter().flat_map(|s| s.triples.iter().copied()).collect();
        prop_assert_eq!(multiset(&union), multiset(&train));

        let max = shards.iter().map(|s| s.len()).max().unwrap();
        let min = shards.iter().map(|s| s.len()).min().unwrap();
        prop_assert!(max - min <= 1);
    }

    #[test]
    fn relation_assignment_is_deterministic(train in arb_train(), num_proc in 1usize..4) {
        let first = assign_relations(&train, num_proc);
        let second = assign_relations(&train, num_proc);
        match (first, second) {
            (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
            (Err(_), Err(_)) => {}
            _ => prop_assert!(false, "assignment changed between runs"),
        }
    }

    #[test]
    fn weights_are_positive_and_bounded(train in arb_train()) {
        let shard = dkge_core::Shard::new(0, train);
        prop_assert_eq!(shard.weights.len(), shard.len());
        for w in &shard.weights {
            // counts start at 4 + 1 on each side
            prop_assert!(*w > 0.0 && *w <= (0.1f32).sqrt() + 1e-6);
        }
    }
}
