// Run configuration.
//
// `TrainConfig` is loaded from a JSON file at startup (default
// `model_config.json`). The first block of fields are the options every run
// file carries; everything after `if_parallel` has a serde default so short
// config files keep working. The trainer reads every constant it uses from
// here rather than hard-coding it.
//
// Validation happens once, in `TrainConfig::validate`, and any failure is
// fatal: a run with inconsistent dimensions would only fail later with an
// opaque tensor shape error.

use crate::error::{Result, TrainError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which disentanglement signal the run trains with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Finite-difference latent sensitivity regularization.
    Glsr,
    /// Adversarial attribute predictors (fader network).
    Fader,
}

/// How the sensitivity estimator measures attributes of perturbed rollouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Decode, reparse, measure. Non-differentiable.
    Exact,
    /// Masked softmax projection of decoder logits.
    Soft,
}

impl Strategy {
    /// Perturbation scale used when the config leaves `epsilon` unset.
    pub fn default_epsilon(self) -> f32 {
        match self {
            Strategy::Exact => 1e-3,
            Strategy::Soft => 1e-2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Run name; checkpoint and log file names derive from it.
    pub name: String,
    pub hidden_dim: usize,
    /// Width of each attribute subspace (and of the free code in the fader variant).
    pub z_dim: usize,
    /// Event sequence length.
    pub time_step: usize,
    pub batch_size: usize,
    pub lr: f64,
    /// KL weight.
    pub beta: f64,
    pub n_epochs: usize,
    /// Enable the 3-way density classifier heads.
    pub is_class: bool,
    /// Enable the residual density regression heads.
    pub is_res: bool,
    /// Multi-device execution request. Accepted but unsupported.
    #[serde(default)]
    pub if_parallel: bool,

    #[serde(default = "default_variant")]
    pub variant: Variant,
    #[serde(default = "default_strategy")]
    pub strategy: Strategy,
    /// Perturbation scale; `None` picks the strategy default.
    #[serde(default)]
    pub epsilon: Option<f32>,
    /// Regularization is off while `step <= warmup_steps`.
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: u64,
    /// Global gradient-norm bound applied before every optimizer step.
    #[serde(default = "default_grad_clip")]
    pub grad_clip: f64,
    /// Weight of the event-stream reconstruction term.
    #[serde(default = "default_event_weight")]
    pub event_weight: f64,
    /// Length of the unconditional rollouts used for sensitivity probing.
    #[serde(default = "default_rollout_steps")]
    pub rollout_steps: usize,
    /// Steps over which the adversarial weight ramps up.
    #[serde(default = "default_anneal_steps")]
    pub anneal_steps: u64,
    /// Adversarial weight ceiling.
    #[serde(default = "default_lambda_max")]
    pub lambda_max: f64,
    /// Length of the rhythm and note streams (16th-note slots).
    #[serde(default = "default_rhythm_steps")]
    pub rhythm_steps: usize,
    /// Width of the conditioning (chroma) vector.
    #[serde(default = "default_cond_dim")]
    pub cond_dim: usize,
    #[serde(default = "default_dataset")]
    pub dataset: PathBuf,
    #[serde(default = "default_params_dir")]
    pub params_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Restore the step counter and RNG from the checkpoint sidecar on resume.
    #[serde(default = "default_resume_counter")]
    pub resume_counter: bool,
}

fn default_variant() -> Variant {
    Variant::Glsr
}
fn default_strategy() -> Strategy {
    Strategy::Soft
}
fn default_warmup_steps() -> u64 {
    20
}
fn default_grad_clip() -> f64 {
    1.0
}
fn default_event_weight() -> f64 {
    5.0
}
fn default_rollout_steps() -> usize {
    100
}
fn default_anneal_steps() -> u64 {
    2000
}
fn default_lambda_max() -> f64 {
    1e-4
}
fn default_rhythm_steps() -> usize {
    16
}
fn default_cond_dim() -> usize {
    24
}
fn default_dataset() -> PathBuf {
    PathBuf::from("data/dataset.jsonl")
}
fn default_params_dir() -> PathBuf {
    PathBuf::from("params")
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("log")
}
fn default_seed() -> u64 {
    0x5eed
}
fn default_resume_counter() -> bool {
    true
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            name: "attr_vae".to_string(),
            hidden_dim: 256,
            z_dim: 64,
            time_step: 100,
            batch_size: 64,
            lr: 1e-3,
            beta: 0.1,
            n_epochs: 50,
            is_class: false,
            is_res: false,
            if_parallel: false,
            variant: default_variant(),
            strategy: default_strategy(),
            epsilon: None,
            warmup_steps: default_warmup_steps(),
            grad_clip: default_grad_clip(),
            event_weight: default_event_weight(),
            rollout_steps: default_rollout_steps(),
            anneal_steps: default_anneal_steps(),
            lambda_max: default_lambda_max(),
            rhythm_steps: default_rhythm_steps(),
            cond_dim: default_cond_dim(),
            dataset: default_dataset(),
            params_dir: default_params_dir(),
            log_dir: default_log_dir(),
            seed: default_seed(),
            resume_counter: default_resume_counter(),
        }
    }
}

impl TrainConfig {
    /// Load and validate a config file. A missing file is fatal.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
        Self::from_json(&data)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: TrainConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("hidden_dim", self.hidden_dim),
            ("z_dim", self.z_dim),
            ("time_step", self.time_step),
            ("batch_size", self.batch_size),
            ("rollout_steps", self.rollout_steps),
            ("rhythm_steps", self.rhythm_steps),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(TrainError::Config(format!("{field} must be positive")));
            }
        }
        if self.name.trim().is_empty() {
            return Err(TrainError::Config("name must not be empty".into()));
        }
        if self.lr.is_nan() || self.lr <= 0.0 {
            return Err(TrainError::Config(format!("lr must be positive, got {}", self.lr)));
        }
        if self.beta < 0.0 || self.grad_clip <= 0.0 || self.event_weight < 0.0 {
            return Err(TrainError::Config(
                "beta and event_weight must be non-negative, grad_clip positive".into(),
            ));
        }
        if let Some(eps) = self.epsilon {
            if !eps.is_finite() || eps <= 0.0 {
                return Err(TrainError::Config(format!("epsilon must be positive, got {eps}")));
            }
        }
        if self.variant == Variant::Fader && self.anneal_steps == 0 {
            return Err(TrainError::Config("anneal_steps must be positive for the fader variant".into()));
        }
        Ok(())
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon.unwrap_or_else(|| self.strategy.default_epsilon())
    }

    /// Primary checkpoint, overwritten every epoch.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.params_dir.join(format!("{}.safetensors", self.name))
    }

    /// Step counter / RNG sidecar next to the primary checkpoint.
    pub fn state_path(&self) -> PathBuf {
        self.params_dir.join(format!("{}.state.json", self.name))
    }

    /// Write-once snapshot taken at the end of a run.
    pub fn snapshot_path(&self, unix_millis: u64) -> PathBuf {
        self.params_dir.join(format!("{}_{unix_millis}.safetensors", self.name))
    }

    /// Per-epoch JSON-lines metrics log.
    pub fn metrics_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.jsonl", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "name": "piano_glsr",
        "hidden_dim": 128,
        "z_dim": 16,
        "time_step": 100,
        "batch_size": 32,
        "lr": 0.001,
        "beta": 0.1,
        "n_epochs": 5,
        "is_class": false,
        "is_res": false
    }"#;

    #[test]
    fn minimal_file_fills_defaults() {
        let config = TrainConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.name, "piano_glsr");
        assert_eq!(config.variant, Variant::Glsr);
        assert_eq!(config.strategy, Strategy::Soft);
        assert_eq!(config.warmup_steps, 20);
        assert_eq!(config.grad_clip, 1.0);
        assert_eq!(config.event_weight, 5.0);
        assert_eq!(config.anneal_steps, 2000);
        assert!(!config.if_parallel);
        assert!(config.resume_counter);
    }

    #[test]
    fn epsilon_follows_strategy_unless_set() {
        let mut config = TrainConfig::default();
        config.strategy = Strategy::Soft;
        assert_eq!(config.epsilon(), 1e-2);
        config.strategy = Strategy::Exact;
        assert_eq!(config.epsilon(), 1e-3);
        config.epsilon = Some(0.05);
        assert_eq!(config.epsilon(), 0.05);
    }

    #[test]
    fn variant_and_strategy_parse_snake_case() {
        let json = MINIMAL.replace(
            "\"is_res\": false",
            "\"is_res\": false, \"variant\": \"fader\", \"strategy\": \"exact\"",
        );
        let config = TrainConfig::from_json(&json).unwrap();
        assert_eq!(config.variant, Variant::Fader);
        assert_eq!(config.strategy, Strategy::Exact);
    }

    #[test]
    fn zero_dimensions_are_rejected() {
        let json = MINIMAL.replace("\"z_dim\": 16", "\"z_dim\": 0");
        assert!(matches!(TrainConfig::from_json(&json), Err(TrainError::Config(_))));
    }

    #[test]
    fn bad_learning_rate_is_rejected() {
        let json = MINIMAL.replace("\"lr\": 0.001", "\"lr\": -1.0");
        assert!(matches!(TrainConfig::from_json(&json), Err(TrainError::Config(_))));
    }

    #[test]
    fn missing_file_is_fatal() {
        let err = TrainConfig::load(Path::new("/nonexistent/model_config.json")).unwrap_err();
        assert!(matches!(err, TrainError::Io { .. }));
    }

    #[test]
    fn derived_paths_use_run_name() {
        let config = TrainConfig::default();
        assert_eq!(config.checkpoint_path(), PathBuf::from("params/attr_vae.safetensors"));
        assert_eq!(config.state_path(), PathBuf::from("params/attr_vae.state.json"));
        assert_eq!(
            config.snapshot_path(1_700_000_000_123),
            PathBuf::from("params/attr_vae_1700000000123.safetensors")
        );
        assert_eq!(config.metrics_path(), PathBuf::from("log/attr_vae.jsonl"));
    }
}
