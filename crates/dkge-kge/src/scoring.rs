//! Scoring functions for knowledge graph embeddings.
//!
//! Complex-valued models store a vector of width `2d` as two halves:
//! the first `d` entries are the real parts, the last `d` the imaginary
//! parts. Distance models fold the margin `gamma` into the score so that
//! higher is always more plausible.

use crate::config::{ModelName, TrainConfig};
use crate::error::{Error, Result};
use std::f32::consts::PI;

/// Norms below this are treated as zero when differentiating.
const EPS: f32 = 1e-12;

/// Gradient of a score with respect to one triple's three rows.
#[derive(Debug, Clone, PartialEq)]
pub struct TripleGrad {
    pub head: Vec<f32>,
    pub relation: Vec<f32>,
    pub tail: Vec<f32>,
}

impl TripleGrad {
    /// Zeroed buffers for the given widths.
    pub fn zeros(entity_dim: usize, relation_dim: usize) -> Self {
        Self {
            head: vec![0.0; entity_dim],
            relation: vec![0.0; relation_dim],
            tail: vec![0.0; entity_dim],
        }
    }

    /// Reset every entry to zero, keeping the allocation.
    pub fn clear(&mut self) {
        self.head.fill(0.0);
        self.relation.fill(0.0);
        self.tail.fill(0.0);
    }
}

/// Anything that can score a triple and differentiate that score.
pub trait ScoreModel: Send + Sync {
    /// Plausibility of `(head, relation, tail)`; higher is more plausible.
    fn score(&self, head: &[f32], relation: &[f32], tail: &[f32]) -> f32;

    /// Add `upstream * d score / d x` into `grad` for each of the three rows.
    fn backward(&self, head: &[f32], relation: &[f32], tail: &[f32], upstream: f32, grad: &mut TripleGrad);
}

/// Built-in scoring functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringFunction {
    /// TransE: gamma - ||h + r - t||_2
    TransE,
    /// RESCAL: h^T M_r t, with M_r stored row-major in the relation row
    Rescal,
    /// DistMult: <h, r, t>
    DistMult,
    /// ComplEx: Re(<h, r, conj(t)>)
    ComplEx,
    /// RotatE: gamma - sum |h ∘ e^{iθ_r} - t|
    RotatE,
    /// pRotatE: gamma - modulus * sum |sin(θ_h + θ_r - θ_t)|
    PRotatE,
}

impl ScoringFunction {
    /// Scoring function for a model family.
    ///
    /// # Errors
    ///
    /// [`Error::Configuration`] for TransH, TransR and TransD, which have
    /// no built-in scoring backend.
    pub fn from_model(model: ModelName) -> Result<Self> {
        match model {
            ModelName::TransE => Ok(Self::TransE),
            ModelName::Rescal => Ok(Self::Rescal),
            ModelName::DistMult => Ok(Self::DistMult),
            ModelName::ComplEx => Ok(Self::ComplEx),
            ModelName::RotatE => Ok(Self::RotatE),
            ModelName::PRotatE => Ok(Self::PRotatE),
            ModelName::TransH | ModelName::TransR | ModelName::TransD => Err(Error::Configuration(
                format!("{model} has no built-in scoring backend"),
            )),
        }
    }
}

/// A scoring function bound to its hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct Scorer {
    function: ScoringFunction,
    gamma: f32,
    emb_init: f32,
}

impl Scorer {
    pub fn new(function: ScoringFunction, gamma: f32, emb_init: f32) -> Self {
        Self {
            function,
            gamma,
            emb_init,
        }
    }

    /// Scorer for a validated configuration.
    pub fn from_config(config: &TrainConfig) -> Result<Self> {
        Ok(Self::new(
            ScoringFunction::from_model(config.model_name)?,
            config.gamma,
            config.emb_init(),
        ))
    }

    pub fn function(&self) -> ScoringFunction {
        self.function
    }

    /// Radians per embedding unit for phase-based models.
    fn phase_scale(&self) -> f32 {
        PI / self.emb_init
    }
}

impl ScoreModel for Scorer {
    fn score(&self, head: &[f32], relation: &[f32], tail: &[f32]) -> f32 {
        match self.function {
            ScoringFunction::TransE => self.gamma - l2_distance(head, relation, tail),
            ScoringFunction::Rescal => score_rescal(head, relation, tail),
            ScoringFunction::DistMult => score_distmult(head, relation, tail),
            ScoringFunction::ComplEx => score_complex(head, relation, tail),
            ScoringFunction::RotatE => self.gamma - rotate_distance(head, relation, tail, self.phase_scale()),
            ScoringFunction::PRotatE => {
                let modulus = 0.5 * self.emb_init;
                let scale = self.phase_scale();
                let sum: f32 = (0..head.len())
                    .map(|i| ((head[i] + relation[i] - tail[i]) * scale).sin().abs())
                    .sum();
                self.gamma - modulus * sum
            }
        }
    }

    fn backward(&self, head: &[f32], relation: &[f32], tail: &[f32], upstream: f32, grad: &mut TripleGrad) {
        match self.function {
            ScoringFunction::TransE => {
                let norm = l2_distance(head, relation, tail);
                if norm < EPS {
                    return;
                }
                for i in 0..head.len() {
                    let g = upstream * (head[i] + relation[i] - tail[i]) / norm;
                    grad.head[i] -= g;
                    grad.relation[i] -= g;
                    grad.tail[i] += g;
                }
            }
            ScoringFunction::Rescal => {
                let d = head.len();
                for i in 0..d {
                    let row = &relation[i * d..(i + 1) * d];
                    let mut mt = 0.0;
                    for j in 0..d {
                        mt += row[j] * tail[j];
                        grad.relation[i * d + j] += upstream * head[i] * tail[j];
                        grad.tail[j] += upstream * head[i] * row[j];
                    }
                    grad.head[i] += upstream * mt;
                }
            }
            ScoringFunction::DistMult => {
                for i in 0..head.len() {
                    grad.head[i] += upstream * relation[i] * tail[i];
                    grad.relation[i] += upstream * head[i] * tail[i];
                    grad.tail[i] += upstream * head[i] * relation[i];
                }
            }
            ScoringFunction::ComplEx => {
                let d = head.len() / 2;
                for i in 0..d {
                    let (h_re, h_im) = (head[i], head[d + i]);
                    let (r_re, r_im) = (relation[i], relation[d + i]);
                    let (t_re, t_im) = (tail[i], tail[d + i]);
                    grad.head[i] += upstream * (r_re * t_re + r_im * t_im);
                    grad.head[d + i] += upstream * (r_re * t_im - r_im * t_re);
                    grad.relation[i] += upstream * (h_re * t_re + h_im * t_im);
                    grad.relation[d + i] += upstream * (h_re * t_im - h_im * t_re);
                    grad.tail[i] += upstream * (h_re * r_re - h_im * r_im);
                    grad.tail[d + i] += upstream * (h_re * r_im + h_im * r_re);
                }
            }
            ScoringFunction::RotatE => {
                let d = head.len() / 2;
                let scale = self.phase_scale();
                for i in 0..d {
                    let (a, b) = (head[i], head[d + i]);
                    let (e, f) = (tail[i], tail[d + i]);
                    let (sin, cos) = (relation[i] * scale).sin_cos();
                    let re = a * cos - b * sin - e;
                    let im = a * sin + b * cos - f;
                    let m = (re * re + im * im).sqrt();
                    if m < EPS {
                        continue;
                    }
                    // d score / d (re, im)
                    let g_re = -upstream * re / m;
                    let g_im = -upstream * im / m;
                    grad.head[i] += g_re * cos + g_im * sin;
                    grad.head[d + i] += -g_re * sin + g_im * cos;
                    grad.tail[i] -= g_re;
                    grad.tail[d + i] -= g_im;
                    let d_theta = g_re * (-a * sin - b * cos) + g_im * (a * cos - b * sin);
                    grad.relation[i] += d_theta * scale;
                }
            }
            ScoringFunction::PRotatE => {
                let modulus = 0.5 * self.emb_init;
                let scale = self.phase_scale();
                for i in 0..head.len() {
                    let x = (head[i] + relation[i] - tail[i]) * scale;
                    let (sin, cos) = x.sin_cos();
                    let g = -upstream * modulus * sin.signum() * cos * scale;
                    grad.head[i] += g;
                    grad.relation[i] += g;
                    grad.tail[i] -= g;
                }
            }
        }
    }
}

/// ||h + r - t||_2
fn l2_distance(head: &[f32], relation: &[f32], tail: &[f32]) -> f32 {
    let mut sum_sq = 0.0;
    for i in 0..head.len() {
        let diff = head[i] + relation[i] - tail[i];
        sum_sq += diff * diff;
    }
    sum_sq.sqrt()
}

/// DistMult scoring: <h, r, t>
fn score_distmult(head: &[f32], relation: &[f32], tail: &[f32]) -> f32 {
    let mut score = 0.0;
    for i in 0..head.len() {
        score += head[i] * relation[i] * tail[i];
    }
    score
}

/// RESCAL scoring: sum_ij h_i M_ij t_j
fn score_rescal(head: &[f32], relation: &[f32], tail: &[f32]) -> f32 {
    let d = head.len();
    let mut score = 0.0;
    for i in 0..d {
        let row = &relation[i * d..(i + 1) * d];
        let mt: f32 = row.iter().zip(tail).map(|(m, t)| m * t).sum();
        score += head[i] * mt;
    }
    score
}

/// ComplEx scoring: Re(<h, r, conj(t)>).
fn score_complex(head: &[f32], relation: &[f32], tail: &[f32]) -> f32 {
    let dim = head.len() / 2;
    let mut score = 0.0;

    for i in 0..dim {
        let (h_re, h_im) = (head[i], head[dim + i]);
        let (r_re, r_im) = (relation[i], relation[dim + i]);
        let (t_re, t_im) = (tail[i], tail[dim + i]);

        // (h * r) = X + Yi, Re((X + Yi)(t_re - t_im i)) = X t_re + Y t_im
        let x = h_re * r_re - h_im * r_im;
        let y = h_re * r_im + h_im * r_re;

        score += x * t_re + y * t_im;
    }
    score
}

/// Sum of per-coordinate moduli of `h ∘ e^{iθ} - t`.
fn rotate_distance(head: &[f32], relation: &[f32], tail: &[f32], scale: f32) -> f32 {
    let dim = head.len() / 2;
    let mut sum = 0.0;
    for i in 0..dim {
        let (sin, cos) = (relation[i] * scale).sin_cos();
        let re = head[i] * cos - head[dim + i] * sin - tail[i];
        let im = head[i] * sin + head[dim + i] * cos - tail[dim + i];
        sum += (re * re + im * im).sqrt();
    }
    sum
}
