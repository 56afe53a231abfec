// Training orchestrator.
//
// `Trainer` owns the model, its `VarMap` and the attribute extractor. All
// mutable run state (step counter, epoch, optimizer, RNG) lives in
// `TrainingState`, which `train_step` takes by value and hands back, so there
// is no ambient training state anywhere.
//
// One training step:
//   1. forward with reparameterized sampling
//   2. reconstruction + beta * KL (+ classifier / residual heads if present)
//   3. once past warm-up: a sensitivity regularization term per attribute
//      subspace, and an annealed adversarial term per fader predictor
//   4. a single backward pass over the summed loss
//   5. global gradient-norm clipping, one optimizer step, `step += 1`
//
// Validation runs the same loss without an optimizer step, with the phase and
// anneal decided by `step - 1`, the last completed training step. The
// evaluation phase uses posterior means, always regularizes, and adds token
// accuracies and linear-probe R^2 of each attribute subspace's probe
// coordinate.
//
// See also: `sensitivity.rs` for the estimator, `checkpoint.rs` for what is
// persisted at epoch boundaries.

use crate::attribute::{AttributeExtractor, ExactExtractor, SoftExtractor};
use crate::checkpoint::{
    TrainingCounters, load_counters, load_parameters, save_counters, save_parameters, save_snapshot,
    unix_millis,
};
use crate::config::{Strategy, TrainConfig};
use crate::dataset::{Batch, Dataset, Split};
use crate::error::Result;
use crate::fader::{AdversarialAnneal, adversarial_loss};
use crate::latent::LatentCode;
use crate::loss::{classifier_loss, kl_divergence, reconstruction, residual_loss};
use crate::metrics::{EpochRecord, RunningMeans, accuracy_sum, class_hits, linear_probe_r2};
use crate::model::{AttributeModel, ForwardMode, ModelOutput, build_model};
use crate::regularizer::standard_normal_nll;
use crate::sensitivity::{PROBE_COORDINATE, SensitivityEstimator};
use attrvae_music::attributes::AttributeKind;
use attrvae_prng::TrainRng;
use candle_core::backprop::GradStore;
use candle_core::{D, DType, Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Batch size of the evaluation phase.
const EVAL_BATCH_SIZE: usize = 128;

/// RNG stream for evaluation-phase perturbations.
const EVAL_RNG_SALT: u64 = 0xe7a1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Regularization and adversarial terms are off.
    Warmup,
    Regularized,
}

impl Phase {
    pub fn at(step: u64, warmup_steps: u64) -> Self {
        if step <= warmup_steps { Phase::Warmup } else { Phase::Regularized }
    }
}

pub struct TrainingState {
    pub step: u64,
    /// Last completed epoch.
    pub epoch: usize,
    pub optimizer: AdamW,
    pub rng: TrainRng,
}

impl TrainingState {
    pub fn counters(&self) -> TrainingCounters {
        TrainingCounters {
            step: self.step,
            epoch: self.epoch,
            rng: self.rng.clone(),
        }
    }
}

/// Scalar values of one step's loss terms.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub terms: Vec<(&'static str, f64)>,
    /// Pre-clip global gradient norm; `None` when no optimizer step ran.
    pub grad_norm: Option<f64>,
}

impl StepReport {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.terms.iter().find(|(n, _)| *n == name).map(|&(_, v)| v)
    }

    pub fn record(&self, into: &mut RunningMeans) {
        for &(name, value) in &self.terms {
            into.add(name, value);
        }
        if let Some(norm) = self.grad_norm {
            into.add("grad_norm", norm);
        }
    }
}

/// The summed loss and its named parts.
pub struct LossTerms {
    pub total: Tensor,
    pub report: StepReport,
}

fn reg_name(kind: AttributeKind) -> &'static str {
    match kind {
        AttributeKind::Rhythm => "reg_rhythm",
        AttributeKind::Note => "reg_note",
    }
}

fn adv_name(kind: AttributeKind) -> &'static str {
    match kind {
        AttributeKind::Rhythm => "adv_rhythm",
        AttributeKind::Note => "adv_note",
    }
}

fn scalar(t: &Tensor) -> Result<f64> {
    Ok(t.to_dtype(DType::F64)?.to_scalar::<f64>()?)
}

/// Scale every gradient so the global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(vars: &[Var], grads: &mut GradStore, max_norm: f64) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var) {
            total += scalar(&g.sqr()?.sum_all()?)?;
        }
    }
    let norm = total.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.remove(var) {
                grads.insert(var, g.affine(scale, 0.0)?);
            }
        }
    }
    Ok(norm)
}

/// Per-split results of the evaluation phase.
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub split: Split,
    pub examples: usize,
    pub metrics: BTreeMap<String, f64>,
}

pub struct Trainer {
    config: TrainConfig,
    device: Device,
    varmap: VarMap,
    model: Box<dyn AttributeModel>,
    extractor: Box<dyn AttributeExtractor>,
    anneal: AdversarialAnneal,
}

impl Trainer {
    pub fn new(config: TrainConfig, device: Device) -> Result<Self> {
        config.validate()?;
        if config.if_parallel {
            warn!("if_parallel requested but multi-device training is unsupported; using one device");
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = build_model(&config, vb)?;
        let extractor: Box<dyn AttributeExtractor> = match config.strategy {
            Strategy::Exact => Box::new(ExactExtractor),
            Strategy::Soft => Box::new(SoftExtractor::default()),
        };
        info!(
            name = %config.name,
            variant = ?config.variant,
            strategy = extractor.name(),
            epsilon = config.epsilon(),
            parameters = varmap.all_vars().iter().map(|v| v.elem_count()).sum::<usize>(),
            "model built"
        );
        Ok(Trainer {
            anneal: AdversarialAnneal::from_config(&config),
            config,
            device,
            varmap,
            model,
            extractor,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn model(&self) -> &dyn AttributeModel {
        self.model.as_ref()
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }

    /// Fresh state at step 0 with a new optimizer.
    pub fn initial_state(&self) -> Result<TrainingState> {
        let params = ParamsAdamW {
            lr: self.config.lr,
            weight_decay: 0.0,
            ..Default::default()
        };
        Ok(TrainingState {
            step: 0,
            epoch: 0,
            optimizer: AdamW::new(self.varmap.all_vars(), params)?,
            rng: TrainRng::new(self.config.seed),
        })
    }

    /// Load the primary checkpoint if present and, when configured, restore
    /// the step counter, epoch and RNG from the sidecar. Optimizer moments
    /// always start fresh.
    pub fn resume(&mut self) -> Result<TrainingState> {
        let mut state = self.initial_state()?;
        let path = self.config.checkpoint_path();
        if !path.exists() {
            info!(path = %path.display(), "no checkpoint; starting fresh");
            return Ok(state);
        }
        load_parameters(&mut self.varmap, &path)?;
        info!(path = %path.display(), "loaded parameters");
        if !self.config.resume_counter {
            info!("resume_counter off; step counter restarts at 0");
            return Ok(state);
        }
        match load_counters(&self.config.state_path())? {
            Some(counters) => {
                info!(step = counters.step, epoch = counters.epoch, "restored training counters");
                state.step = counters.step;
                state.epoch = counters.epoch;
                state.rng = counters.rng;
            }
            None => warn!("checkpoint has no counter sidecar; step counter restarts at 0"),
        }
        Ok(state)
    }

    /// Loss for one forward output. `step` drives the adversarial anneal.
    pub fn compose_loss(
        &self,
        output: &ModelOutput,
        batch: &Batch,
        phase: Phase,
        step: u64,
        rng: &mut TrainRng,
    ) -> Result<LossTerms> {
        let mut report = StepReport::default();
        let recon = reconstruction(output, batch, self.config.event_weight)?;
        report.terms.push(("ce_events", scalar(&recon.events)?));
        if let Some(t) = &recon.rhythm {
            report.terms.push(("ce_rhythm", scalar(t)?));
        }
        if let Some(t) = &recon.note {
            report.terms.push(("ce_note", scalar(t)?));
        }

        let kl = kl_divergence(&output.posteriors)?;
        report.terms.push(("kl", scalar(&kl)?));
        let mut total = (recon.total + kl.affine(self.config.beta, 0.0)?)?;

        if let Some(class) = classifier_loss(output, batch)? {
            report.terms.push(("class", scalar(&class)?));
            total = (total + class)?;
        }
        if let Some(res) = residual_loss(output, batch)? {
            report.terms.push(("res", scalar(&res)?));
            total = (total + res)?;
        }

        let attributes = self.model.layout().attributes();
        let regularized = phase == Phase::Regularized;
        if !attributes.is_empty() {
            let estimator = SensitivityEstimator::new(
                self.extractor.as_ref(),
                self.config.epsilon(),
                self.config.rollout_steps,
            )?;
            for kind in attributes {
                let value = if regularized {
                    let sensitivity = estimator.estimate(self.model.as_ref(), &output.latent, kind, rng)?;
                    let term = standard_normal_nll(&sensitivity)?;
                    let value = scalar(&term)?;
                    total = (total + term)?;
                    value
                } else {
                    0.0
                };
                report.terms.push((reg_name(kind), value));
            }
        }

        if let Some(predictors) = &output.predictors {
            let lambda = self.anneal.lambda(step);
            for kind in AttributeKind::ALL {
                let value = if regularized {
                    let term = adversarial_loss(predictors.get(kind), batch.density(kind), lambda)?;
                    let value = scalar(&term)?;
                    total = (total + term)?;
                    value
                } else {
                    0.0
                };
                report.terms.push((adv_name(kind), value));
            }
        }

        report.terms.insert(0, ("loss", scalar(&total)?));
        Ok(LossTerms { total, report })
    }

    /// One optimizer update. Consumes and returns the training state.
    pub fn train_step(&self, mut state: TrainingState, batch: &Batch) -> Result<(TrainingState, StepReport)> {
        let output = self.model.forward(batch, ForwardMode::Sample(&mut state.rng))?;
        let phase = Phase::at(state.step, self.config.warmup_steps);
        let LossTerms { total, mut report } = self.compose_loss(&output, batch, phase, state.step, &mut state.rng)?;

        let mut grads = total.backward()?;
        let norm = clip_grad_norm(&self.varmap.all_vars(), &mut grads, self.config.grad_clip)?;
        state.optimizer.step(&grads)?;
        state.step += 1;

        report.grad_norm = Some(norm);
        debug!(step = state.step, ?phase, loss = report.get("loss"), grad_norm = norm, "train step");
        Ok((state, report))
    }

    /// Loss terms without an update. `step` is the last completed training step.
    pub fn evaluate_step(&self, batch: &Batch, step: u64, rng: &mut TrainRng) -> Result<StepReport> {
        let output = self.model.forward(batch, ForwardMode::Sample(&mut *rng))?;
        let phase = Phase::at(step, self.config.warmup_steps);
        Ok(self.compose_loss(&output, batch, phase, step, rng)?.report)
    }

    /// Epochs `state.epoch + 1 ..= n_epochs`: train, validate, checkpoint.
    /// Writes the write-once snapshot at the end.
    pub fn training_phase(&self, mut state: TrainingState, dataset: &Dataset) -> Result<TrainingState> {
        let batch_size = self.config.batch_size;
        let metrics_path = self.config.metrics_path();
        for epoch in state.epoch + 1..=self.config.n_epochs {
            info!(epoch, n_epochs = self.config.n_epochs, step = state.step, "epoch start");

            let mut train = RunningMeans::new();
            for indices in dataset.batch_indices(Split::Train, batch_size, Some(&mut state.rng)) {
                let batch = dataset.batch(Split::Train, &indices, &self.device)?;
                let (next, report) = self.train_step(state, &batch)?;
                state = next;
                report.record(&mut train);
            }

            let mut val = RunningMeans::new();
            let val_step = state.step.saturating_sub(1);
            for indices in dataset.batch_indices(Split::Validation, batch_size, None) {
                let batch = dataset.batch(Split::Validation, &indices, &self.device)?;
                self.evaluate_step(&batch, val_step, &mut state.rng)?.record(&mut val);
            }

            info!(epoch, "train: {}", train.summary());
            info!(epoch, "val: {}", val.summary());

            state.epoch = epoch;
            save_parameters(&self.varmap, &self.config.checkpoint_path())?;
            save_counters(&state.counters(), &self.config.state_path())?;
            info!(path = %self.config.checkpoint_path().display(), "saved checkpoint");

            for (split, means) in [(Split::Train, &train), (Split::Validation, &val)] {
                EpochRecord {
                    epoch,
                    step: state.step,
                    split: split.name().to_string(),
                    metrics: means.means(),
                }
                .append(&metrics_path)?;
            }
        }

        let snapshot = self.config.snapshot_path(unix_millis());
        save_snapshot(&self.varmap, &snapshot)?;
        info!(path = %snapshot.display(), "saved run snapshot");
        Ok(state)
    }

    /// Evaluate the train and test splits with posterior means.
    pub fn evaluation_phase(&self, dataset: &Dataset) -> Result<Vec<EvaluationReport>> {
        let mut rng = TrainRng::new(self.config.seed).fork(EVAL_RNG_SALT);
        let mut reports = Vec::new();
        for split in [Split::Train, Split::Test] {
            let report = self.evaluate_split(dataset, split, &mut rng)?;
            info!(
                split = split.name(),
                examples = report.examples,
                "{}",
                report.metrics.iter().map(|(k, v)| format!("{k}={v:.4}")).collect::<Vec<_>>().join(" ")
            );
            reports.push(report);
        }
        Ok(reports)
    }

    fn evaluate_split(&self, dataset: &Dataset, split: Split, rng: &mut TrainRng) -> Result<EvaluationReport> {
        let mut means = RunningMeans::new();
        let mut hits: BTreeMap<&'static str, f64> = BTreeMap::new();
        let mut examples = 0usize;
        let attributes = self.model.layout().attributes();

        for indices in dataset.batch_indices(split, EVAL_BATCH_SIZE, None) {
            let batch = dataset.batch(split, &indices, &self.device)?;
            let output = self.model.forward(&batch, ForwardMode::Mean)?;
            self.compose_loss(&output, &batch, Phase::Regularized, u64::MAX, rng)?
                .report
                .record(&mut means);

            examples += batch.size();
            *hits.entry("acc_events").or_default() += accuracy_sum(&output.events, &batch.events, true)?;
            if let Some(lp) = &output.rhythm {
                *hits.entry("acc_rhythm").or_default() += accuracy_sum(lp, &batch.rhythm, false)?;
            }
            if let Some(lp) = &output.note {
                *hits.entry("acc_note").or_default() += accuracy_sum(lp, &batch.note, false)?;
            }
            if let Some(heads) = &output.classifier {
                *hits.entry("class_acc_rhythm").or_default() += class_hits(&heads.rhythm, &batch.rhythm_class)?;
                *hits.entry("class_acc_note").or_default() += class_hits(&heads.note, &batch.note_class)?;
            }
            for &kind in &attributes {
                let r2 = probe_r2(&output.latent, &batch, kind)?;
                means.add(probe_name(kind), r2);
            }
        }

        let mut metrics = means.means();
        for (name, total) in hits {
            metrics.insert(name.to_string(), total / examples.max(1) as f64);
        }
        Ok(EvaluationReport { split, examples, metrics })
    }

    /// Prior rollouts under the given conditioning. Returns argmax token rows.
    pub fn sample(&self, conditioning: Tensor, steps: usize, rng: &mut TrainRng) -> Result<Vec<Vec<u32>>> {
        let code = LatentCode::sample_prior(self.model.layout(), conditioning, rng)?;
        let logits = self.model.global_decoder(&code.concat()?, steps)?;
        Ok(logits.argmax(D::Minus1)?.to_vec2::<u32>()?)
    }
}

fn probe_name(kind: AttributeKind) -> &'static str {
    match kind {
        AttributeKind::Rhythm => "probe_r2_rhythm",
        AttributeKind::Note => "probe_r2_note",
    }
}

fn probe_r2(latent: &LatentCode, batch: &Batch, kind: AttributeKind) -> Result<f64> {
    let Some(sub) = latent.attribute(kind) else {
        return Ok(0.0);
    };
    let x = sub.narrow(1, PROBE_COORDINATE, 1)?.squeeze(1)?.to_vec1::<f32>()?;
    let y = batch.density(kind).to_vec1::<f32>()?;
    linear_probe_r2(&x, &y)
}
