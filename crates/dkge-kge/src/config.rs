//! Run configuration.
//!
//! [`TrainConfig`] carries every knob of a run. It is validated once, in
//! the orchestrator process, before anything is spawned, and then travels
//! to worker processes inside the run manifest.

use crate::error::{Error, Result};
use crate::sampler::NegMode;
use dkge_core::PartitionMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Embedding model families accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelName {
    /// h + r ≈ t
    TransE,
    /// Translation on a relation-specific hyperplane.
    TransH,
    /// Translation in a relation-specific space.
    TransR,
    /// Dynamic mapping matrices.
    TransD,
    /// Bilinear with a full relation matrix.
    Rescal,
    /// Bilinear diagonal.
    DistMult,
    /// Complex bilinear diagonal.
    ComplEx,
    /// Rotation in complex space.
    RotatE,
    /// Phase-only RotatE.
    PRotatE,
}

impl ModelName {
    /// Every accepted model, in command-line order.
    pub const ALL: [Self; 9] = [
        Self::TransE,
        Self::TransH,
        Self::TransR,
        Self::TransD,
        Self::Rescal,
        Self::DistMult,
        Self::ComplEx,
        Self::RotatE,
        Self::PRotatE,
    ];

    /// Canonical spelling (`RESCAL`, `pRotatE`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TransE => "TransE",
            Self::TransH => "TransH",
            Self::TransR => "TransR",
            Self::TransD => "TransD",
            Self::Rescal => "RESCAL",
            Self::DistMult => "DistMult",
            Self::ComplEx => "ComplEx",
            Self::RotatE => "RotatE",
            Self::PRotatE => "pRotatE",
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| Error::Configuration(format!("unknown model `{s}`")))
    }
}

/// Training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Model family (default: TransE).
    pub model_name: ModelName,
    /// Dataset name under `data_path` (default: FB15k).
    pub dataset: String,
    /// Root of all datasets (default: `data`).
    pub data_path: PathBuf,
    /// Dataset format (default: `1`).
    pub format: String,
    /// Where run directories are created (default: `ckpts`).
    pub save_path: PathBuf,
    /// Export embeddings here after training.
    pub save_emb: Option<PathBuf>,
    /// Load embeddings from this export directory before training.
    pub resume_from: Option<PathBuf>,
    /// Total number of steps per worker (default: 80000).
    pub max_step: usize,
    /// Step training resumes from; set from the checkpoint.
    pub init_step: usize,
    /// Positive triples per batch (default: 1024).
    pub batch_size: usize,
    /// Triples per evaluation query batch (default: 8).
    pub batch_size_eval: usize,
    /// Negatives per positive (default: 128).
    pub neg_sample_size: usize,
    /// Ranking candidates during validation; negative means all entities (default: 1000).
    pub neg_sample_size_valid: i64,
    /// Ranking candidates during test; negative means all entities (default: -1).
    pub neg_sample_size_test: i64,
    /// Base embedding width (default: 256).
    pub hidden_dim: usize,
    /// Learning rate (default: 0.0001).
    pub lr: f32,
    /// Margin folded into distance scores (default: 12.0).
    pub gamma: f32,
    /// GPU id; only -1 (CPU) is supported.
    pub gpu: i32,
    /// Accepted for compatibility, has no effect.
    pub mix_cpu_gpu: bool,
    /// Double the entity width (complex models).
    pub double_ent: bool,
    /// Double the relation width (complex models).
    pub double_rel: bool,
    /// Random seed (default: 0).
    pub seed: u64,
    /// Log progress every this many steps (default: 1000).
    pub log_interval: usize,
    /// Validate every this many steps (default: 10000).
    pub eval_interval: usize,
    /// Weight negatives by a softmax over their scores.
    pub neg_adversarial_sampling: bool,
    /// Softmax temperature for adversarial weighting (default: 1.0).
    pub adversarial_temperature: f32,
    /// Run validation during training.
    pub valid: bool,
    /// Run the test phase after training.
    pub test: bool,
    /// Regularization coefficient; 0 disables it (default: 2e-6).
    pub regularization_coef: f32,
    /// Norm order of the regularizer (default: 3).
    pub regularization_norm: u32,
    /// Use subsampling weights in the loss.
    pub non_uni_weight: bool,
    /// Number of worker processes (default: 1).
    pub num_proc: usize,
    /// Partition relations across workers.
    pub rel_part: bool,
    /// Partition edges across workers.
    pub edge_part: bool,
    /// Fraction of validation triples ranked at each evaluation (default: 1.0).
    pub eval_percent: f32,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model_name: ModelName::TransE,
            dataset: "FB15k".to_string(),
            data_path: PathBuf::from("data"),
            format: "1".to_string(),
            save_path: PathBuf::from("ckpts"),
            save_emb: None,
            resume_from: None,
            max_step: 80_000,
            init_step: 0,
            batch_size: 1024,
            batch_size_eval: 8,
            neg_sample_size: 128,
            neg_sample_size_valid: 1000,
            neg_sample_size_test: -1,
            hidden_dim: 256,
            lr: 0.0001,
            gamma: 12.0,
            gpu: -1,
            mix_cpu_gpu: false,
            double_ent: false,
            double_rel: false,
            seed: 0,
            log_interval: 1000,
            eval_interval: 10_000,
            neg_adversarial_sampling: false,
            adversarial_temperature: 1.0,
            valid: false,
            test: false,
            regularization_coef: 0.000_002,
            regularization_norm: 3,
            non_uni_weight: false,
            num_proc: 1,
            rel_part: false,
            edge_part: false,
            eval_percent: 1.0,
        }
    }
}

impl TrainConfig {
    pub fn with_model(mut self, model: ModelName) -> Self {
        self.model_name = model;
        self
    }

    pub fn with_dataset(mut self, data_path: impl Into<PathBuf>, dataset: impl Into<String>) -> Self {
        self.data_path = data_path.into();
        self.dataset = dataset.into();
        self
    }

    pub fn with_save_path(mut self, save_path: impl Into<PathBuf>) -> Self {
        self.save_path = save_path.into();
        self
    }

    pub fn with_max_step(mut self, max_step: usize) -> Self {
        self.max_step = max_step;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_neg_sample_size(mut self, n: usize) -> Self {
        self.neg_sample_size = n;
        self
    }

    pub fn with_hidden_dim(mut self, dim: usize) -> Self {
        self.hidden_dim = dim;
        self
    }

    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_num_proc(mut self, num_proc: usize) -> Self {
        self.num_proc = num_proc;
        self
    }

    pub fn with_rel_part(mut self, rel_part: bool) -> Self {
        self.rel_part = rel_part;
        self
    }

    /// Model-specific widths, derived from `hidden_dim` and the doubling flags.
    pub fn entity_dim(&self) -> usize {
        if self.double_ent {
            self.hidden_dim * 2
        } else {
            self.hidden_dim
        }
    }

    /// Relation width; RESCAL stores a full `entity_dim × entity_dim` matrix.
    pub fn relation_dim(&self) -> usize {
        match self.model_name {
            ModelName::Rescal => self.entity_dim() * self.entity_dim(),
            _ if self.double_rel => self.hidden_dim * 2,
            _ => self.hidden_dim,
        }
    }

    /// Half-width of the uniform initialisation range.
    pub fn emb_init(&self) -> f32 {
        (self.gamma + 2.0) / self.hidden_dim as f32
    }

    /// Partitioning strategy implied by the flags.
    pub fn partition_mode(&self) -> PartitionMode {
        if self.rel_part {
            PartitionMode::Relation
        } else if self.edge_part {
            PartitionMode::Edge
        } else {
            PartitionMode::Full
        }
    }

    /// Negative weighting used by the loss.
    pub fn neg_mode(&self) -> NegMode {
        if self.neg_adversarial_sampling {
            NegMode::Adversarial {
                temperature: self.adversarial_temperature,
            }
        } else {
            NegMode::Uniform
        }
    }

    /// Concurrent channels the evaluation service must accept.
    pub fn num_connections(&self) -> usize {
        if self.valid && self.test {
            self.num_proc * 2
        } else {
            self.num_proc
        }
    }

    /// Whether an evaluation service is needed at all.
    pub fn needs_eval_service(&self) -> bool {
        self.valid || self.test
    }

    /// Replace negative evaluation sizes by `n_entities` (exhaustive ranking).
    pub fn resolve_eval_sizes(&mut self, n_entities: usize) {
        if self.neg_sample_size_valid < 0 {
            self.neg_sample_size_valid = n_entities as i64;
        }
        if self.neg_sample_size_test < 0 {
            self.neg_sample_size_test = n_entities as i64;
        }
    }

    /// Check every flag combination that can be checked without the data.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Configuration(msg));

        if self.num_proc == 0 {
            return fail("num_proc must be at least 1".into());
        }
        if self.rel_part && self.edge_part {
            return fail("--rel_part and --edge_part are mutually exclusive".into());
        }
        if self.batch_size == 0 || self.batch_size_eval == 0 {
            return fail("batch sizes must be positive".into());
        }
        if self.neg_sample_size == 0 {
            return fail("neg_sample_size must be positive".into());
        }
        if self.hidden_dim == 0 {
            return fail("hidden_dim must be positive".into());
        }
        if self.init_step > self.max_step {
            return fail(format!(
                "init_step {} is past max_step {}",
                self.init_step, self.max_step
            ));
        }
        if self.log_interval == 0 || self.eval_interval == 0 {
            return fail("log_interval and eval_interval must be positive".into());
        }
        if !(self.lr > 0.0) {
            return fail(format!("learning rate must be positive, got {}", self.lr));
        }
        if !(self.eval_percent > 0.0 && self.eval_percent <= 1.0) {
            return fail(format!("eval_percent must be in (0, 1], got {}", self.eval_percent));
        }
        if !self.gamma.is_finite() || self.gamma + 2.0 <= 0.0 {
            return fail(format!(
                "gamma must be finite and greater than -2, got {}",
                self.gamma
            ));
        }
        if !self.regularization_coef.is_finite() || !self.adversarial_temperature.is_finite() {
            return fail("regularization_coef and adversarial_temperature must be finite".into());
        }
        if self.regularization_coef < 0.0 || self.regularization_norm == 0 {
            return fail("regularization needs coef >= 0 and norm >= 1".into());
        }
        if self.neg_adversarial_sampling && !(self.adversarial_temperature > 0.0) {
            return fail("adversarial_temperature must be positive".into());
        }
        if self.gpu >= 0 {
            return fail(format!(
                "GPU {} requested but only CPU training is available (use --gpu -1)",
                self.gpu
            ));
        }

        match self.model_name {
            ModelName::TransH | ModelName::TransR | ModelName::TransD => fail(format!(
                "{} has no scoring backend; choose one of TransE, RESCAL, DistMult, ComplEx, RotatE, pRotatE",
                self.model_name
            )),
            ModelName::ComplEx if !(self.double_ent && self.double_rel) => {
                fail("ComplEx needs --double_ent and --double_rel".into())
            }
            ModelName::RotatE if !self.double_ent || self.double_rel => {
                fail("RotatE needs --double_ent and a real-valued relation (no --double_rel)".into())
            }
            ModelName::Rescal if self.double_rel => {
                fail("RESCAL relation width is derived from the entity width; drop --double_rel".into())
            }
            ModelName::TransE | ModelName::DistMult | ModelName::PRotatE
                if self.double_ent != self.double_rel =>
            {
                fail(format!(
                    "{} needs entity and relation widths to match",
                    self.model_name
                ))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_cli() {
        let c = TrainConfig::default();
        assert_eq!(c.model_name, ModelName::TransE);
        assert_eq!(c.max_step, 80_000);
        assert_eq!(c.neg_sample_size_test, -1);
        assert!((c.gamma - 12.0).abs() < 1e-6);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_model_names_roundtrip() {
        for m in ModelName::ALL {
            assert_eq!(m.as_str().parse::<ModelName>().unwrap(), m);
        }
        assert!("transe".parse::<ModelName>().is_err());
    }

    #[test]
    fn test_dims() {
        let c = TrainConfig::default().with_hidden_dim(8);
        assert_eq!((c.entity_dim(), c.relation_dim()), (8, 8));

        let mut complex = c.clone().with_model(ModelName::ComplEx);
        complex.double_ent = true;
        complex.double_rel = true;
        assert_eq!((complex.entity_dim(), complex.relation_dim()), (16, 16));

        let rescal = c.with_model(ModelName::Rescal);
        assert_eq!(rescal.relation_dim(), 64);
    }

    #[test]
    fn test_gamma_must_leave_a_positive_init_range() {
        let mut c = TrainConfig::default();
        c.gamma = -5.0;
        assert!(c.validate().unwrap_err().is_configuration());
        c.gamma = -2.0;
        assert!(c.validate().is_err());
        c.gamma = f32::NAN;
        assert!(c.validate().is_err());
        c.gamma = -1.5;
        assert!(c.validate().is_ok());
        assert!(c.emb_init() > 0.0);
    }

    #[test]
    fn test_non_finite_loss_parameters_are_rejected() {
        let mut c = TrainConfig::default();
        c.regularization_coef = f32::INFINITY;
        assert!(c.validate().is_err());

        let mut c = TrainConfig::default();
        c.adversarial_temperature = f32::NAN;
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validation_failures() {
        let base = TrainConfig::default();
        assert!(base.clone().with_num_proc(0).validate().is_err());
        assert!(base.clone().with_model(ModelName::TransR).validate().is_err());
        assert!(base.clone().with_model(ModelName::ComplEx).validate().is_err());

        let mut both = base.clone();
        both.rel_part = true;
        both.edge_part = true;
        assert!(both.validate().is_err());

        let mut gpu = base.clone();
        gpu.gpu = 0;
        assert!(gpu.validate().unwrap_err().is_configuration());

        let mut resume = base;
        resume.init_step = resume.max_step + 1;
        assert!(resume.validate().is_err());
    }

    #[test]
    fn test_resolve_eval_sizes_and_connections() {
        let mut c = TrainConfig::default().with_num_proc(3);
        c.resolve_eval_sizes(42);
        assert_eq!(c.neg_sample_size_valid, 1000);
        assert_eq!(c.neg_sample_size_test, 42);

        c.valid = true;
        assert_eq!(c.num_connections(), 3);
        c.test = true;
        assert_eq!(c.num_connections(), 6);
    }

    #[test]
    fn test_partition_mode() {
        let c = TrainConfig::default();
        assert_eq!(c.partition_mode(), PartitionMode::Full);
        assert_eq!(c.clone().with_rel_part(true).partition_mode(), PartitionMode::Relation);
    }
}
