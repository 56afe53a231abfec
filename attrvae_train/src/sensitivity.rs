// Finite-difference latent sensitivity.
//
// For one attribute subspace, every example `i` gets a random offset
//
//   delta[i] = (1 + U(0, 1)) * epsilon        (so delta[i] >= epsilon > 0)
//
// added to and subtracted from the subspace's probe coordinate (the first
// one). Both perturbed codes are concatenated in canonical order with the
// untouched remainder and conditioning, rolled out by the global decoder for
// a fixed number of steps, and scored by the attribute extractor:
//
//   s[i] = (attr(dec(z + delta)) - attr(dec(z - delta))) / (2 * delta[i])
//
// Two full rollouts per subspace make this the most expensive part of a
// training step; the orchestrator only calls it once warm-up is over.

use crate::attribute::AttributeExtractor;
use crate::error::{Result, TrainError};
use crate::latent::{LatentCode, SubspaceKind};
use crate::model::AttributeModel;
use attrvae_music::attributes::AttributeKind;
use attrvae_prng::TrainRng;
use candle_core::Tensor;

/// Coordinate of each attribute subspace that carries the attribute.
pub const PROBE_COORDINATE: usize = 0;

/// Per-example perturbation offsets, each in `[epsilon, 2 * epsilon)`.
pub fn draw_deltas(rng: &mut TrainRng, batch: usize, epsilon: f32) -> Vec<f32> {
    (0..batch).map(|_| (1.0 + rng.next_f32()) * epsilon).collect()
}

pub struct SensitivityEstimator<'a> {
    extractor: &'a dyn AttributeExtractor,
    epsilon: f32,
    rollout_steps: usize,
}

impl<'a> SensitivityEstimator<'a> {
    pub fn new(extractor: &'a dyn AttributeExtractor, epsilon: f32, rollout_steps: usize) -> Result<Self> {
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(TrainError::Config(format!("perturbation epsilon must be positive, got {epsilon}")));
        }
        Ok(SensitivityEstimator {
            extractor,
            epsilon,
            rollout_steps,
        })
    }

    /// `(batch,)` sensitivity of `kind` to its subspace's probe coordinate.
    pub fn estimate(
        &self,
        model: &dyn AttributeModel,
        latent: &LatentCode,
        kind: AttributeKind,
        rng: &mut TrainRng,
    ) -> Result<Tensor> {
        let subspace = SubspaceKind::Attribute(kind);
        let batch = latent.batch_size();
        let deltas = draw_deltas(rng, batch, self.epsilon);
        let negated: Vec<f32> = deltas.iter().map(|d| -d).collect();

        let plus = latent.perturbed(subspace, PROBE_COORDINATE, &deltas)?;
        let minus = latent.perturbed(subspace, PROBE_COORDINATE, &negated)?;
        let out_plus = model.global_decoder(&plus.concat()?, self.rollout_steps)?;
        let out_minus = model.global_decoder(&minus.concat()?, self.rollout_steps)?;
        let attr_plus = self.extractor.extract(&out_plus, kind)?;
        let attr_minus = self.extractor.extract(&out_minus, kind)?;

        let device = attr_plus.device();
        let span = Tensor::from_vec(deltas, batch, device)?
            .to_dtype(attr_plus.dtype())?
            .affine(2.0, 0.0)?;
        Ok(((attr_plus - attr_minus)? / span)?)
    }
}
