// Model boundary.
//
// The orchestrator and the sensitivity estimator only see the model through
// `AttributeModel`: a forward pass producing a `ModelOutput`, and an
// unconditional `global_decoder` rollout from a concatenated latent vector.
// Optional heads (density classifiers, residual regressors, fader predictors)
// show up as `Option` fields of the output rather than changing its shape.
//
// Two implementations live next to this file:
// - `vae::AttrRegVae`, the latent-sensitivity-regularized model with rhythm
//   and note subspaces conditioned on chroma.
// - `fader::FaderVae`, a single free code conditioned on the measured
//   densities, with attribute predictors reading the code.
//
// All parameters are created through one `VarBuilder` backed by a `VarMap`,
// which the checkpoint module saves and restores as a whole.

use crate::config::{TrainConfig, Variant};
use crate::dataset::Batch;
use crate::error::Result;
use crate::fader::FaderVae;
use crate::latent::{LatentCode, LatentLayout};
use crate::vae::AttrRegVae;
use attrvae_music::attributes::AttributeKind;
use attrvae_prng::TrainRng;
use candle_core::Tensor;
use candle_nn::VarBuilder;

/// How latent codes are drawn during a forward pass.
pub enum ForwardMode<'a> {
    /// Reparameterized sample using the run RNG.
    Sample(&'a mut TrainRng),
    /// Posterior means. Deterministic.
    Mean,
}

/// A diagonal Gaussian posterior `(batch, dim)`.
#[derive(Debug, Clone)]
pub struct Posterior {
    pub mu: Tensor,
    pub logvar: Tensor,
}

impl Posterior {
    /// Mean over elements of KL(q || N(0, I)).
    pub fn kl_to_standard_normal(&self) -> Result<Tensor> {
        let var = self.logvar.exp()?;
        let per_elem = ((var + self.mu.sqr()?)? - &self.logvar)?.affine(0.5, -0.5)?;
        Ok(per_elem.mean_all()?)
    }

    pub fn draw(&self, mode: &mut ForwardMode<'_>) -> Result<Tensor> {
        match mode {
            ForwardMode::Mean => Ok(self.mu.clone()),
            ForwardMode::Sample(rng) => {
                let dims = self.mu.dims().to_vec();
                let noise = Tensor::from_vec(rng.gaussian_vec(self.mu.elem_count()), dims, self.mu.device())?;
                let std = self.logvar.affine(0.5, 0.0)?.exp()?;
                Ok((&self.mu + (std * noise)?)?)
            }
        }
    }
}

/// One value per attribute.
#[derive(Debug, Clone)]
pub struct PerAttribute<T> {
    pub rhythm: T,
    pub note: T,
}

impl<T> PerAttribute<T> {
    pub fn get(&self, kind: AttributeKind) -> &T {
        match kind {
            AttributeKind::Rhythm => &self.rhythm,
            AttributeKind::Note => &self.note,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `(batch, time_step, EVENT_DIMS)` log-probabilities, teacher-forced.
    pub events: Tensor,
    /// `(batch, rhythm_steps, RHYTHM_DIMS)` log-probabilities.
    pub rhythm: Option<Tensor>,
    /// `(batch, rhythm_steps, NOTE_DIMS)` log-probabilities.
    pub note: Option<Tensor>,
    pub posteriors: Vec<Posterior>,
    pub latent: LatentCode,
    /// 3-way density class logits.
    pub classifier: Option<PerAttribute<Tensor>>,
    /// `(batch,)` density regressions from the residual heads.
    pub residual: Option<PerAttribute<Tensor>>,
    /// `(batch,)` fader predictor outputs.
    pub predictors: Option<PerAttribute<Tensor>>,
}

pub trait AttributeModel {
    fn layout(&self) -> &LatentLayout;

    /// Conditioning vector the model pairs with latent codes for `batch`.
    fn conditioning(&self, batch: &Batch) -> Result<Tensor>;

    fn forward(&self, batch: &Batch, mode: ForwardMode<'_>) -> Result<ModelOutput>;

    /// Free-running rollout of `steps` events from a concatenated
    /// `(batch, layout.total_dim())` latent. Returns raw logits
    /// `(batch, steps, EVENT_DIMS)`; each step feeds back its argmax.
    fn global_decoder(&self, latent: &Tensor, steps: usize) -> Result<Tensor>;
}

/// Build the configured model, registering its parameters in `vb`.
pub fn build_model(config: &TrainConfig, vb: VarBuilder) -> Result<Box<dyn AttributeModel>> {
    Ok(match config.variant {
        Variant::Glsr => Box::new(AttrRegVae::new(config, vb)?),
        Variant::Fader => Box::new(FaderVae::new(config, vb)?),
    })
}
