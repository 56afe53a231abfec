// Evaluation metrics and per-epoch aggregation.
//
// - Token accuracy: argmax against target per example, averaged over the
//   example's length. For the event stream the length is the target with its
//   trailing PAD run trimmed; an all-PAD target scores 0. Computed with a
//   length mask over the whole batch, not element by element.
// - Linear probe: closed-form 1-D least squares of a measured attribute on one
//   latent coordinate, reported as R^2. Constant targets or a constant
//   regressor score 0.
// - `RunningMeans` accumulates named per-batch scalars and reports means.
// - `EpochRecord` is one JSON line of the metrics log.

use crate::error::{Result, TrainError};
use attrvae_music::vocab::PAD;
use candle_core::{D, DType, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Sum over the batch of per-example accuracies.
pub fn accuracy_sum(scores: &Tensor, targets: &Tensor, trim_trailing_pad: bool) -> Result<f64> {
    let (b, t) = targets.dims2()?;
    let predicted = scores.argmax(D::Minus1)?;
    let hits = predicted.eq(&targets.to_dtype(DType::U32)?)?.to_dtype(DType::F32)?;

    let lengths: Vec<usize> = if trim_trailing_pad {
        targets
            .to_dtype(DType::U32)?
            .to_vec2::<u32>()?
            .iter()
            .map(|row| row.iter().rposition(|&tok| tok != PAD).map_or(0, |i| i + 1))
            .collect()
    } else {
        vec![t; b]
    };
    let mut mask = vec![0f32; b * t];
    for (row, &len) in lengths.iter().enumerate() {
        mask[row * t..row * t + len].fill(1.0);
    }
    let mask = Tensor::from_vec(mask, (b, t), targets.device())?;
    let correct = (hits * mask)?.sum(1)?.to_vec1::<f32>()?;

    Ok(correct
        .iter()
        .zip(&lengths)
        .filter(|&(_, &len)| len > 0)
        .map(|(&c, &len)| c as f64 / len as f64)
        .sum())
}

/// Number of rows whose argmax matches the class target.
pub fn class_hits(logits: &Tensor, classes: &Tensor) -> Result<f64> {
    let predicted = logits.argmax(D::Minus1)?;
    let hits = predicted.eq(classes)?.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
    Ok(hits as f64)
}

/// R^2 of the least-squares line `y ~ a * x + b`.
pub fn linear_probe_r2(x: &[f32], y: &[f32]) -> Result<f64> {
    if x.len() != y.len() {
        return Err(TrainError::Shape(format!("probe has {} inputs and {} targets", x.len(), y.len())));
    }
    let n = x.len() as f64;
    if x.is_empty() {
        return Ok(0.0);
    }
    let mean_x = x.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mean_y = y.iter().map(|&v| v as f64).sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for (&xi, &yi) in x.iter().zip(y) {
        let dx = xi as f64 - mean_x;
        let dy = yi as f64 - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    if syy <= f64::EPSILON || sxx <= f64::EPSILON {
        return Ok(0.0);
    }
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let ss_res: f64 = x
        .iter()
        .zip(y)
        .map(|(&xi, &yi)| {
            let r = yi as f64 - (slope * xi as f64 + intercept);
            r * r
        })
        .sum();
    Ok(1.0 - ss_res / syy)
}

/// Means of named per-batch scalars.
#[derive(Debug, Clone, Default)]
pub struct RunningMeans {
    sums: BTreeMap<String, (f64, usize)>,
}

impl RunningMeans {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: f64) {
        let entry = self.sums.entry(name.to_string()).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        self.sums.get(name).map(|&(sum, n)| sum / n.max(1) as f64)
    }

    pub fn means(&self) -> BTreeMap<String, f64> {
        self.sums
            .iter()
            .map(|(k, &(sum, n))| (k.clone(), sum / n.max(1) as f64))
            .collect()
    }

    /// `name=value` pairs in name order, for log lines.
    pub fn summary(&self) -> String {
        self.means()
            .iter()
            .map(|(k, v)| format!("{k}={v:.5}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub step: u64,
    pub split: String,
    pub metrics: BTreeMap<String, f64>,
}

impl EpochRecord {
    /// Append as one JSON line, creating the log directory if needed.
    pub fn append(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TrainError::io(parent, e))?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TrainError::io(path, e))?;
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        file.write_all(&line).map_err(|e| TrainError::io(path, e))
    }
}
