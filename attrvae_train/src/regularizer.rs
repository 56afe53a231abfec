// Regularization loss on sensitivity estimates.
//
// The estimate is scored as if drawn from a standard normal: the loss is the
// mean negative log-likelihood
//
//   mean(0.5 * s^2 + 0.5 * ln(2 * pi))
//
// which penalizes extreme sensitivities without pulling them toward any
// particular target. The prior is symmetric, so `loss(s) == loss(-s)`.

use crate::error::Result;
use candle_core::Tensor;

const HALF_LN_TWO_PI: f64 = 0.918_938_533_204_672_7;

pub fn standard_normal_nll(sensitivity: &Tensor) -> Result<Tensor> {
    Ok(sensitivity.sqr()?.affine(0.5, HALF_LN_TWO_PI)?.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use attrvae_prng::TrainRng;
    use candle_core::Device;

    fn nll(values: &[f32]) -> f32 {
        let t = Tensor::new(values, &Device::Cpu).unwrap();
        standard_normal_nll(&t).unwrap().to_scalar().unwrap()
    }

    #[test]
    fn zero_sensitivity_scores_the_normalizer() {
        assert!((nll(&[0.0, 0.0, 0.0]) - HALF_LN_TWO_PI as f32).abs() < 1e-6);
        assert!((HALF_LN_TWO_PI - 0.5 * (2.0 * std::f64::consts::PI).ln()).abs() < 1e-15);
    }

    #[test]
    fn loss_is_sign_symmetric() {
        let mut rng = TrainRng::new(21);
        for _ in 0..50 {
            let v: Vec<f32> = rng.gaussian_vec(9).into_iter().map(|x| x * 4.0).collect();
            let neg: Vec<f32> = v.iter().map(|x| -x).collect();
            assert_eq!(nll(&v), nll(&neg));
        }
    }

    #[test]
    fn larger_magnitudes_cost_more() {
        assert!(nll(&[3.0]) > nll(&[1.0]));
        assert!((nll(&[2.0]) - (2.0 + HALF_LN_TWO_PI as f32)).abs() < 1e-6);
    }
}
