// Allow minor clippy style warnings at crate level
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::doc_markdown)]

//! Multi-process knowledge graph embedding training.
//!
//! Workers are separate OS processes. They share one embedding table,
//! a memory-mapped file, and update it without locks (asynchronous SGD).
//! A separate evaluation service holds the full graph so that workers can
//! compute filtered ranking metrics without loading it themselves.
//!
//! ```text
//!                   ┌──────────────┐
//!                   │ Orchestrator │
//!                   └──────┬───────┘
//!        spawn ┌───────────┼─────────────┐ spawn
//!              v           v             v
//!        ┌──────────┐ ┌──────────┐ ┌────────────┐
//!        │ worker 0 │ │ worker 1 │ │ eval-server│
//!        └────┬─────┘ └────┬─────┘ └─────┬──────┘
//!             │  mmap      │ mmap        │ unix socket
//!             v            v             │
//!        ┌──────────────────────┐        │
//!        │    store.bin         │  <─────┘ neighbor queries
//!        └──────────────────────┘
//! ```
//!
//! ## Models
//!
//! | Model | Score | Entity width | Relation width |
//! |-------|-------|--------------|----------------|
//! | TransE | γ - ‖h + r - t‖ | d | d |
//! | DistMult | ⟨h, r, t⟩ | d | d |
//! | ComplEx | Re⟨h, r, conj(t)⟩ | 2d | 2d |
//! | RotatE | γ - Σ ‖h ∘ e^{iθ} - t‖ | 2d | d (phases) |
//! | pRotatE | γ - m Σ \|sin(θh + θr - θt)\| | d | d |
//! | RESCAL | hᵀ M t | d | d² |
//!
//! TransH, TransR and TransD are accepted names without a scoring backend
//! and fail validation.
//!
//! ## Loss
//!
//! Logistic loss with negative sampling: `-logσ(pos)` plus `-logσ(-neg)`
//! averaged over the negatives of each positive, uniformly or with
//! self-adversarial weights. Updates are Adagrad, one accumulator per row.
//!
//! ## Modules
//!
//! - [`config`]: [`TrainConfig`] and [`ModelName`]
//! - [`scoring`]: [`ScoreModel`] and the built-in [`Scorer`]
//! - [`sampler`]: [`NegativeSamplingIterator`]
//! - [`store`]: [`SharedEmbeddingStore`]
//! - [`worker`]: [`TrainingWorker`]
//! - [`evaluation`]: [`RankMetrics`] and filtered ranking
//! - [`service`]: [`EvaluationService`] and its client
//! - [`checkpoint`]: run directories and embedding export
//! - [`orchestrator`]: [`Orchestrator`] and child process entry points

pub mod checkpoint;
pub mod config;
mod error;
pub mod evaluation;
pub mod orchestrator;
pub mod sampler;
pub mod scoring;
pub mod service;
pub mod store;
pub mod worker;

pub use config::{ModelName, TrainConfig};
pub use error::{Error, Result};
pub use evaluation::{CandidateSet, Evaluator, FilterSource, RankMetrics};
pub use orchestrator::{Orchestrator, Phase, RunManifest, RunSummary};
pub use sampler::{Batch, CorruptMode, NegMode, NegativeSamplingIterator};
pub use scoring::{ScoreModel, Scorer, ScoringFunction, TripleGrad};
pub use service::{EvaluationService, Request, Response, ServiceClient};
pub use store::{SharedEmbeddingStore, StoreShape, Table};
pub use worker::{StepLoss, TrainingWorker, WorkerReport, WorkerState};
