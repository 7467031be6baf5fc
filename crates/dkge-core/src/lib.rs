// Allow minor clippy style warnings at crate level
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::doc_markdown)]

//! Core data model for multi-process knowledge graph embedding training.
//!
//! - [`Triple`] - an id-encoded `(head, relation, tail)` fact
//! - [`Dataset`] - train/valid/test splits plus entity and relation vocabularies
//! - [`GraphPartitioner`] / [`Shard`] - per-worker subsets of the training triples
//! - [`EvalGraph`] - the complete, read-only graph used for filtered ranking
//!
//! # Why partition by relation?
//!
//! Workers update a shared embedding table without locks. Entity rows
//! can be touched by any worker, so concurrent updates to them race and
//! the training tolerates that (asynchronous SGD). Relation rows are
//! different: if each relation belongs to exactly one worker, its row has
//! a single writer and cannot race at all.
//!
//! ```rust
//! use dkge_core::{Dataset, GraphPartitioner, PartitionMode, Triple};
//!
//! let train = vec![
//!     Triple::new(0, 0, 1),
//!     Triple::new(1, 0, 2),
//!     Triple::new(2, 1, 3),
//!     Triple::new(3, 1, 0),
//! ];
//! let ds = Dataset::from_triples("toy", 4, 2, train, vec![], vec![]).unwrap();
//!
//! let shards = GraphPartitioner::new(PartitionMode::Relation)
//!     .partition(&ds, 2)
//!     .unwrap();
//! assert_eq!(shards.len(), 2);
//! assert_eq!(shards[0].len() + shards[1].len(), 4);
//! ```

mod dataset;
mod error;
pub mod graph;
pub mod partition;
mod triple;

pub use dataset::{Dataset, Split};
pub use error::{Error, Result};
pub use graph::EvalGraph;
pub use partition::{GraphPartitioner, PartitionMode, Shard};
pub use triple::{EntityId, RelationId, Triple};
