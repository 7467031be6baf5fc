//! Property-based tests for sampling and the shared store.
//!
//! - The sampler alternates tail/head corruption from a fixed start
//! - Rebuilding a sampler replays the same sequence
//! - Every batch has exactly `batch_size` positives and in-range negatives
//! - Store reads after an update equal old + delta

use dkge_core::{Shard, Triple};
use dkge_kge::{CorruptMode, NegMode, NegativeSamplingIterator, SharedEmbeddingStore, StoreShape, Table};
use ndarray::Array2;
use proptest::prelude::*;
use std::sync::Arc;

fn arb_shard() -> impl Strategy<Value = Vec<Triple>> {
    prop::collection::vec((0u32..10, 0u32..3, 0u32..10), 1..40)
        .prop_map(|v| v.into_iter().map(Triple::from).collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn sampler_alternates_and_restarts(
        triples in arb_shard(),
        batch_size in 1usize..16,
        neg in 1usize..6,
        seed in any::<u64>(),
        calls in 1usize..12,
    ) {
        let shard = Arc::new(Shard::new(0, triples));
        let make = || NegativeSamplingIterator::new(Arc::clone(&shard), 10, batch_size, neg, NegMode::Uniform, seed).unwrap();

        let first: Vec<_> = make().take(calls).collect();
        for (i, batch) in first.iter().enumerate() {
            let expected = if i % 2 == 0 { CorruptMode::Tail } else { CorruptMode::Head };
            prop_assert_eq!(batch.mode, expected);
            prop_assert_eq!(batch.len(), batch_size);
            prop_assert_eq!(batch.negatives.len(), batch_size * neg);
            prop_assert!(batch.negatives.iter().all(|&e| e < 10));
        }

        let again: Vec<_> = make().take(calls).collect();
        for (a, b) in first.iter().zip(&again) {
            prop_assert_eq!(&a.indices, &b.indices);
            prop_assert_eq!(&a.negatives, &b.negatives);
        }
    }

    #[test]
    fn store_read_after_update_is_old_plus_delta(
        rows in prop::collection::vec(0u32..6, 1..6),
        values in prop::collection::vec(-10.0f32..10.0, 4),
        seed in any::<u64>(),
    ) {
        let mut ids = rows;
        ids.sort_unstable();
        ids.dedup();

        let dir = tempfile::tempdir().unwrap();
        let store = SharedEmbeddingStore::create(dir.path().join("store.bin"), StoreShape::new(6, 6, 4, 4)).unwrap();
        store.init_uniform(0.5, seed);

        for table in [Table::Entity, Table::Relation] {
            let old = store.read(table, &ids).unwrap();
            let delta = Array2::from_shape_fn((ids.len(), 4), |(_, c)| values[c]);
            store.update(table, &ids, &delta).unwrap();
            let new = store.read(table, &ids).unwrap();
            for ((n, o), d) in new.iter().zip(old.iter()).zip(delta.iter()) {
                prop_assert_eq!(*n, *o + *d);
            }
        }
    }
}
