// Reconstruction, KL and auxiliary-head losses.
//
// Each stream's reconstruction term is the mean NLL of its target tokens
// under the model's log-probabilities. When the derived rhythm and note
// streams are present the event term is upweighted (`event_weight`) so the
// primary stream dominates; a model with only the event stream uses it
// unweighted.

use crate::dataset::Batch;
use crate::error::Result;
use crate::model::{ModelOutput, Posterior};
use attrvae_music::attributes::AttributeKind;
use candle_core::Tensor;

/// Mean NLL of `targets (b, t)` under `log_probs (b, t, v)`.
pub fn sequence_nll(log_probs: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (b, t, v) = log_probs.dims3()?;
    let flat = log_probs.reshape((b * t, v))?;
    Ok(candle_nn::loss::nll(&flat, &targets.flatten_all()?)?)
}

pub struct Reconstruction {
    /// Weighted sum of all stream terms.
    pub total: Tensor,
    pub events: Tensor,
    pub rhythm: Option<Tensor>,
    pub note: Option<Tensor>,
}

pub fn reconstruction(output: &ModelOutput, batch: &Batch, event_weight: f64) -> Result<Reconstruction> {
    let events = sequence_nll(&output.events, &batch.events)?;
    let rhythm = match &output.rhythm {
        Some(lp) => Some(sequence_nll(lp, &batch.rhythm)?),
        None => None,
    };
    let note = match &output.note {
        Some(lp) => Some(sequence_nll(lp, &batch.note)?),
        None => None,
    };

    let weight = if rhythm.is_some() || note.is_some() { event_weight } else { 1.0 };
    let mut total = events.affine(weight, 0.0)?;
    for term in rhythm.iter().chain(note.iter()) {
        total = (total + term)?;
    }
    Ok(Reconstruction { total, events, rhythm, note })
}

/// Sum over posteriors of the mean KL to a standard normal.
pub fn kl_divergence(posteriors: &[Posterior]) -> Result<Tensor> {
    let mut terms = Vec::with_capacity(posteriors.len());
    for p in posteriors {
        terms.push(p.kl_to_standard_normal()?);
    }
    Ok(Tensor::stack(&terms, 0)?.sum_all()?)
}

/// Cross-entropy of the classifier heads against the density classes, summed over attributes.
pub fn classifier_loss(output: &ModelOutput, batch: &Batch) -> Result<Option<Tensor>> {
    let Some(heads) = &output.classifier else {
        return Ok(None);
    };
    let mut total: Option<Tensor> = None;
    for kind in AttributeKind::ALL {
        let term = candle_nn::loss::cross_entropy(heads.get(kind), batch.class(kind))?;
        total = Some(match total {
            Some(t) => (t + term)?,
            None => term,
        });
    }
    Ok(total)
}

/// MSE of the residual heads against the measured densities, summed over attributes.
pub fn residual_loss(output: &ModelOutput, batch: &Batch) -> Result<Option<Tensor>> {
    let Some(heads) = &output.residual else {
        return Ok(None);
    };
    let mut total: Option<Tensor> = None;
    for kind in AttributeKind::ALL {
        let term = candle_nn::loss::mse(heads.get(kind), batch.density(kind))?;
        total = Some(match total {
            Some(t) => (t + term)?,
            None => term,
        });
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn nll_of_certain_prediction_is_zero() {
        // log-probs: 0 at the target, -inf-ish elsewhere.
        let lp = Tensor::new(&[[[0f32, -50.0], [-50.0, 0.0]]], &Device::Cpu).unwrap();
        let targets = Tensor::new(&[[0u32, 1]], &Device::Cpu).unwrap();
        let v: f32 = sequence_nll(&lp, &targets).unwrap().to_scalar().unwrap();
        assert!(v.abs() < 1e-6);
    }

    #[test]
    fn nll_of_uniform_prediction_is_log_vocab() {
        let lp = Tensor::full((0.25f32).ln(), (2, 3, 4), &Device::Cpu).unwrap();
        let targets = Tensor::zeros((2, 3), DType::U32, &Device::Cpu).unwrap();
        let v: f32 = sequence_nll(&lp, &targets).unwrap().to_scalar().unwrap();
        assert!((v - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn kl_sums_over_posteriors() {
        let p = Posterior {
            mu: Tensor::full(1f32, (2, 2), &Device::Cpu).unwrap(),
            logvar: Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap(),
        };
        let one: f32 = kl_divergence(std::slice::from_ref(&p)).unwrap().to_scalar().unwrap();
        let two: f32 = kl_divergence(&[p.clone(), p]).unwrap().to_scalar().unwrap();
        assert!((one - 0.5).abs() < 1e-6);
        assert!((two - 1.0).abs() < 1e-6);
    }
}
