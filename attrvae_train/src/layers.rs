// Recurrent building blocks shared by both model variants.
//
// - `EventEncoder` reads a one-hot event sequence and produces a Gaussian
//   posterior from its final GRU state.
// - `StreamDecoder` reconstructs a small derived stream (rhythm or note
//   counts) from one latent subspace with teacher forcing.
// - `GlobalDecoder` generates the event stream from the full concatenated
//   latent, either teacher-forced or free-running.
//
// Every decoder step sees the latent vector appended to its input, and the
// initial hidden state is `tanh(W z)`.

use crate::gru::GruCell;
use crate::model::Posterior;
use attrvae_music::vocab::EVENT_DIMS;
use candle_core::{D, Result, Tensor};
use candle_nn::{Linear, Module, VarBuilder, linear};

#[derive(Debug, Clone)]
pub struct EventEncoder {
    gru: GruCell,
    mu: Linear,
    logvar: Linear,
}

impl EventEncoder {
    pub fn new(hidden: usize, z_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(EventEncoder {
            gru: GruCell::new(EVENT_DIMS, hidden, vb.pp("gru"))?,
            mu: linear(hidden, z_dim, vb.pp("mu"))?,
            logvar: linear(hidden, z_dim, vb.pp("logvar"))?,
        })
    }

    pub fn forward(&self, events_onehot: &Tensor) -> Result<Posterior> {
        let batch = events_onehot.dim(0)?;
        let h0 = self.gru.zero_state(batch, events_onehot)?;
        let (_, last) = self.gru.run(events_onehot, &h0)?;
        Ok(Posterior {
            mu: self.mu.forward(&last)?,
            logvar: self.logvar.forward(&last)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StreamDecoder {
    init: Linear,
    gru: GruCell,
    out: Linear,
}

impl StreamDecoder {
    pub fn new(dims: usize, z_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(StreamDecoder {
            init: linear(z_dim, hidden, vb.pp("init"))?,
            gru: GruCell::new(dims + z_dim, hidden, vb.pp("gru"))?,
            out: linear(hidden, dims, vb.pp("out"))?,
        })
    }

    /// Teacher-forced log-probabilities for `target_onehot` `(b, s, dims)`.
    pub fn forward(&self, z: &Tensor, target_onehot: &Tensor) -> Result<Tensor> {
        let inputs = append_to_steps(&shift_right(target_onehot)?, z)?;
        let h0 = self.init.forward(z)?.tanh()?;
        let (states, _) = self.gru.run(&inputs, &h0)?;
        candle_nn::ops::log_softmax(&self.out.forward(&states)?, D::Minus1)
    }
}

#[derive(Debug, Clone)]
pub struct GlobalDecoder {
    init: Linear,
    gru: GruCell,
    out: Linear,
}

impl GlobalDecoder {
    pub fn new(latent_dim: usize, hidden: usize, vb: VarBuilder) -> Result<Self> {
        Ok(GlobalDecoder {
            init: linear(latent_dim, hidden, vb.pp("init"))?,
            gru: GruCell::new(EVENT_DIMS + latent_dim, hidden, vb.pp("gru"))?,
            out: linear(hidden, EVENT_DIMS, vb.pp("out"))?,
        })
    }

    /// Teacher-forced log-probabilities `(b, t, EVENT_DIMS)`.
    pub fn teacher_forced(&self, latent: &Tensor, events_onehot: &Tensor) -> Result<Tensor> {
        let inputs = append_to_steps(&shift_right(events_onehot)?, latent)?;
        let h0 = self.init.forward(latent)?.tanh()?;
        let (states, _) = self.gru.run(&inputs, &h0)?;
        candle_nn::ops::log_softmax(&self.out.forward(&states)?, D::Minus1)
    }

    /// Free-running rollout. Returns raw logits `(b, steps, EVENT_DIMS)`.
    pub fn rollout(&self, latent: &Tensor, steps: usize) -> Result<Tensor> {
        let batch = latent.dim(0)?;
        let mut h = self.init.forward(latent)?.tanh()?;
        let mut prev = Tensor::zeros((batch, EVENT_DIMS), latent.dtype(), latent.device())?;
        let mut logits = Vec::with_capacity(steps);
        for _ in 0..steps {
            let x = Tensor::cat(&[&prev, latent], 1)?;
            h = self.gru.step(&x, &h)?;
            let step_logits = self.out.forward(&h)?;
            prev = argmax_one_hot(&step_logits)?;
            logits.push(step_logits.unsqueeze(1)?);
        }
        Tensor::cat(&logits, 1)
    }
}

/// One-hot of the argmax along the last axis, in the input dtype.
pub fn argmax_one_hot(logits: &Tensor) -> Result<Tensor> {
    let dims = logits.dim(D::Minus1)?;
    let idx = logits.argmax_keepdim(D::Minus1)?;
    let classes = Tensor::arange(0u32, dims as u32, logits.device())?;
    idx.broadcast_eq(&classes.unsqueeze(0)?)?.to_dtype(logits.dtype())
}

/// Shift a teacher-forcing input one step right along time, zero-filling the first step.
pub fn shift_right(onehot: &Tensor) -> Result<Tensor> {
    let (b, t, d) = onehot.dims3()?;
    let start = Tensor::zeros((b, 1, d), onehot.dtype(), onehot.device())?;
    if t <= 1 {
        return Ok(start);
    }
    Tensor::cat(&[&start, &onehot.narrow(1, 0, t - 1)?], 1)
}

/// Append a per-example vector to every time step: `(b, t, d) ++ (b, k)`.
pub fn append_to_steps(steps: &Tensor, extra: &Tensor) -> Result<Tensor> {
    let (b, t, _) = steps.dims3()?;
    let k = extra.dim(1)?;
    let tiled = extra.unsqueeze(1)?.broadcast_as((b, t, k))?.contiguous()?;
    Tensor::cat(&[steps, &tiled], 2)
}
