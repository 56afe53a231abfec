// Gated recurrent unit built from two candle-nn linear layers.
//
// Gate layout follows the usual convention: the input and hidden projections
// each produce `3 * hidden` features, chunked as (reset, update, candidate).
//
//   r  = sigmoid(W_ir x + W_hr h)
//   u  = sigmoid(W_iu x + W_hu h)
//   n  = tanh(W_in x + r * (W_hn h))
//   h' = n + u * (h - n)
//
// Sequences are unrolled step by step so teacher forcing and free-running
// rollouts share the same cell.

use candle_core::{D, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear};

#[derive(Debug, Clone)]
pub struct GruCell {
    input: Linear,
    recurrent: Linear,
    hidden: usize,
}

impl GruCell {
    pub fn new(input_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(GruCell {
            input: linear(input_dim, 3 * hidden, vb.pp("ih"))?,
            recurrent: linear(hidden, 3 * hidden, vb.pp("hh"))?,
            hidden,
        })
    }

    /// One step: `x` is `(batch, input_dim)`, `h` is `(batch, hidden)`.
    pub fn step(&self, x: &Tensor, h: &Tensor) -> Result<Tensor> {
        let gi = self.input.forward(x)?.chunk(3, D::Minus1)?;
        let gh = self.recurrent.forward(h)?.chunk(3, D::Minus1)?;
        let reset = candle_nn::ops::sigmoid(&(&gi[0] + &gh[0])?)?;
        let update = candle_nn::ops::sigmoid(&(&gi[1] + &gh[1])?)?;
        let candidate = (&gi[2] + (&reset * &gh[2])?)?.tanh()?;
        let keep = (h - &candidate)?;
        &candidate + (&update * &keep)?
    }

    /// Run over `(batch, time, input_dim)`, returning every hidden state
    /// stacked as `(batch, time, hidden)` and the final state.
    pub fn run(&self, xs: &Tensor, h0: &Tensor) -> Result<(Tensor, Tensor)> {
        let (_, steps, _) = xs.dims3()?;
        let mut h = h0.clone();
        let mut states = Vec::with_capacity(steps);
        for t in 0..steps {
            let x = xs.narrow(1, t, 1)?.squeeze(1)?;
            h = self.step(&x, &h)?;
            states.push(h.unsqueeze(1)?);
        }
        let all = Tensor::cat(&states, 1)?;
        Ok((all, h))
    }

    pub fn zero_state(&self, batch: usize, like: &Tensor) -> Result<Tensor> {
        Tensor::zeros((batch, self.hidden), like.dtype(), like.device())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn run_shapes_and_last_state() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cell = GruCell::new(5, 7, vb).unwrap();
        let xs = Tensor::ones((2, 4, 5), DType::F32, &Device::Cpu).unwrap();
        let h0 = cell.zero_state(2, &xs).unwrap();
        let (all, last) = cell.run(&xs, &h0).unwrap();
        assert_eq!(all.dims(), &[2, 4, 7]);
        assert_eq!(last.dims(), &[2, 7]);
        let tail = all.narrow(1, 3, 1).unwrap().squeeze(1).unwrap();
        assert_eq!(tail.to_vec2::<f32>().unwrap(), last.to_vec2::<f32>().unwrap());
    }

    #[test]
    fn hidden_state_stays_bounded() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cell = GruCell::new(3, 4, vb).unwrap();
        let xs = Tensor::full(50f32, (1, 20, 3), &Device::Cpu).unwrap();
        let h0 = cell.zero_state(1, &xs).unwrap();
        let (_, last) = cell.run(&xs, &h0).unwrap();
        for v in last.flatten_all().unwrap().to_vec1::<f32>().unwrap() {
            assert!(v.abs() <= 1.0 + 1e-6);
        }
    }
}
