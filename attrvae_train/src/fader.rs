// Fader variant: adversarial attribute predictors instead of sensitivity
// regularization.
//
// A single encoder produces one free code `z`. The global decoder sees
// `[z | rhythm_density | note_density]`, so at sampling time the densities act
// as faders. Two small predictor heads read `z` alone and try to recover each
// density; their annealed MSE is the adversarial term.
//
// The annealed weight ramps linearly from zero so the untrained predictors do
// not destabilize the main model early:
//
//   lambda(step) = min(step / anneal_steps * lambda_max, lambda_max)

use crate::config::TrainConfig;
use crate::dataset::Batch;
use crate::error::Result;
use crate::latent::{LatentCode, LatentLayout};
use crate::layers::{EventEncoder, GlobalDecoder};
use crate::model::{AttributeModel, ForwardMode, ModelOutput, PerAttribute};
use attrvae_music::attributes::AttributeKind;
use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder, linear};

/// Conditioning width: one slot per measured attribute.
pub const FADER_COND_DIMS: usize = AttributeKind::ALL.len();

/// Linear ramp of the adversarial weight, clamped at `lambda_max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdversarialAnneal {
    pub anneal_steps: u64,
    pub lambda_max: f64,
}

impl AdversarialAnneal {
    pub fn from_config(config: &TrainConfig) -> Self {
        AdversarialAnneal {
            anneal_steps: config.anneal_steps,
            lambda_max: config.lambda_max,
        }
    }

    pub fn lambda(&self, step: u64) -> f64 {
        if self.anneal_steps == 0 {
            return self.lambda_max;
        }
        (step as f64 / self.anneal_steps as f64 * self.lambda_max).min(self.lambda_max)
    }
}

/// `lambda * MSE(predicted, target)`; both `(batch,)`.
pub fn adversarial_loss(predicted: &Tensor, target: &Tensor, lambda: f64) -> Result<Tensor> {
    let mse = candle_nn::loss::mse(predicted, target)?;
    Ok(mse.affine(lambda, 0.0)?)
}

struct Predictor {
    hidden: Linear,
    out: Linear,
}

impl Predictor {
    fn new(z_dim: usize, hidden: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Predictor {
            hidden: linear(z_dim, hidden, vb.pp("hidden"))?,
            out: linear(hidden, 1, vb.pp("out"))?,
        })
    }

    fn forward(&self, z: &Tensor) -> candle_core::Result<Tensor> {
        self.out.forward(&self.hidden.forward(z)?.relu()?)?.squeeze(1)
    }
}

pub struct FaderVae {
    layout: LatentLayout,
    encoder: EventEncoder,
    global: GlobalDecoder,
    predictors: PerAttribute<Predictor>,
}

impl FaderVae {
    pub fn new(config: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        let (h, z) = (config.hidden_dim, config.z_dim);
        let layout = LatentLayout::free(z, FADER_COND_DIMS)?;
        if config.is_class || config.is_res {
            tracing::warn!("classifier and residual heads are not part of the fader model; ignoring");
        }
        Ok(FaderVae {
            encoder: EventEncoder::new(h, z, vb.pp("enc"))?,
            global: GlobalDecoder::new(layout.total_dim(), h, vb.pp("global"))?,
            predictors: PerAttribute {
                rhythm: Predictor::new(z, h, vb.pp("adv_rhythm"))?,
                note: Predictor::new(z, h, vb.pp("adv_note"))?,
            },
            layout,
        })
    }
}

impl AttributeModel for FaderVae {
    fn layout(&self) -> &LatentLayout {
        &self.layout
    }

    fn conditioning(&self, batch: &Batch) -> Result<Tensor> {
        Ok(Tensor::stack(&[&batch.rhythm_density, &batch.note_density], 1)?)
    }

    fn forward(&self, batch: &Batch, mut mode: ForwardMode<'_>) -> Result<ModelOutput> {
        let posterior = self.encoder.forward(&batch.events_onehot)?;
        let z = posterior.draw(&mut mode)?;
        let latent = LatentCode::new(self.layout.clone(), vec![z.clone()], self.conditioning(batch)?)?;
        let events = self.global.teacher_forced(&latent.concat()?, &batch.events_onehot)?;
        let predictors = PerAttribute {
            rhythm: self.predictors.rhythm.forward(&z)?,
            note: self.predictors.note.forward(&z)?,
        };
        Ok(ModelOutput {
            events,
            rhythm: None,
            note: None,
            posteriors: vec![posterior],
            latent,
            classifier: None,
            residual: None,
            predictors: Some(predictors),
        })
    }

    fn global_decoder(&self, latent: &Tensor, steps: usize) -> Result<Tensor> {
        Ok(self.global.rollout(latent, steps)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn anneal() -> AdversarialAnneal {
        AdversarialAnneal { anneal_steps: 2000, lambda_max: 1e-4 }
    }

    #[test]
    fn weight_starts_at_zero() {
        assert_eq!(anneal().lambda(0), 0.0);
    }

    #[test]
    fn weight_reaches_max_at_anneal_end() {
        assert!((anneal().lambda(2000) - 1e-4).abs() < 1e-18);
        assert!((anneal().lambda(1000) - 5e-5).abs() < 1e-18);
    }

    #[test]
    fn weight_stays_clamped_after_anneal() {
        for step in [2001, 5000, 1_000_000] {
            assert_eq!(anneal().lambda(step), 1e-4);
        }
    }

    #[test]
    fn adversarial_loss_scales_mse() {
        let pred = Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap();
        let target = Tensor::new(&[0f32, 0.0], &Device::Cpu).unwrap();
        let loss: f32 = adversarial_loss(&pred, &target, 0.5).unwrap().to_scalar().unwrap();
        assert!((loss - 1.25).abs() < 1e-6);
        let zero: f32 = adversarial_loss(&pred, &target, 0.0).unwrap().to_scalar().unwrap();
        assert_eq!(zero, 0.0);
    }
}
