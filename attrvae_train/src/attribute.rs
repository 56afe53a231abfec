// Attribute extraction from decoder rollouts.
//
// Both strategies take raw rollout logits `(batch, steps, EVENT_DIMS)` and
// return one attribute value per example as a `(batch,)` tensor.
//
// - `ExactExtractor` takes the argmax tokens, decodes them to notes, quantizes
//   a piano roll and measures the attribute exactly. It is not differentiable.
//   A rollout that fails to decode or yields an empty roll scores 0; that
//   fallback is applied here, at the call site of `measure_tokens`, and
//   counted in the trace log.
// - `SoftExtractor` projects the per-step softmax onto two vocabulary masks
//   (note-on tokens and time-shift "separator" tokens) and counts softly.
//   Gradients flow through the note-onset mass.
//
// Soft rhythm density walks each example's separator mass on the host to
// find segments (runs of steps below `SEPARATOR_THRESHOLD`). A segment closed
// by a separator step contributes 1 if its onset mass exceeds
// `SATURATION_THRESHOLD`, its raw onset mass if smaller but nonzero, and
// nothing if empty. Trailing steps with no closing separator are ignored. The
// sum is divided by the total separator mass, falls back to 0 when that mass
// is negligible, and is clamped into [0, 1].

use crate::error::{Result, TrainError};
use attrvae_music::attributes::{AttributeKind, measure_tokens};
use attrvae_music::vocab::{EVENT_DIMS, NOTE_ON_RANGE, SEPARATOR_RANGE};
use candle_core::{D, Device, Tensor};
use std::ops::Range;

/// Separator mass at or above which a step closes a segment.
const SEPARATOR_THRESHOLD: f32 = 0.9;

/// Segment onset mass above which the segment counts as one onset slot.
const SATURATION_THRESHOLD: f32 = 1e-2;

/// Separator mass below which soft rhythm density is defined as 0.
const SEPARATOR_FLOOR: f32 = 1e-6;

pub trait AttributeExtractor {
    fn extract(&self, logits: &Tensor, kind: AttributeKind) -> Result<Tensor>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExactExtractor;

impl ExactExtractor {
    /// Host-side measure of token rows with the zero fallback applied.
    pub fn measure_rows(&self, rows: &[Vec<u32>], kind: AttributeKind) -> Vec<f32> {
        let mut failures = 0usize;
        let values = rows
            .iter()
            .map(|tokens| {
                measure_tokens(tokens, kind).unwrap_or_else(|e| {
                    failures += 1;
                    tracing::trace!(attribute = %kind, error = %e, "degenerate rollout scored 0");
                    0.0
                })
            })
            .collect();
        if failures > 0 {
            tracing::debug!(attribute = %kind, failures, total = rows.len(), "exact extraction fallbacks");
        }
        values
    }
}

impl AttributeExtractor for ExactExtractor {
    fn extract(&self, logits: &Tensor, kind: AttributeKind) -> Result<Tensor> {
        let rows = logits.argmax(D::Minus1)?.to_vec2::<u32>()?;
        let values = self.measure_rows(&rows, kind);
        let n = values.len();
        Ok(Tensor::from_vec(values, n, logits.device())?)
    }

    fn name(&self) -> &'static str {
        "exact"
    }
}

#[derive(Debug, Clone)]
pub struct SoftExtractor {
    note_on: Range<usize>,
    separators: Range<usize>,
}

impl Default for SoftExtractor {
    fn default() -> Self {
        SoftExtractor {
            note_on: NOTE_ON_RANGE,
            separators: SEPARATOR_RANGE,
        }
    }
}

impl SoftExtractor {
    /// Custom mask ranges, validated; only exercised by tests today.
    #[cfg(test)]
    pub fn with_masks(note_on: Range<usize>, separators: Range<usize>) -> Result<Self> {
        let fits = |r: &Range<usize>| r.start < r.end && r.end <= EVENT_DIMS;
        let overlap = note_on.start < separators.end && separators.start < note_on.end;
        if !fits(&note_on) || !fits(&separators) || overlap {
            return Err(TrainError::Config(format!(
                "soft masks {note_on:?} and {separators:?} must be disjoint, non-empty ranges below {EVENT_DIMS}"
            )));
        }
        Ok(SoftExtractor { note_on, separators })
    }

    /// Soft per-step indicator `(batch, steps)`: softmax mass inside `range`.
    fn project(&self, logits: &Tensor, range: &Range<usize>) -> Result<Tensor> {
        let (b, t, v) = logits.dims3()?;
        let probs = candle_nn::ops::softmax(logits, D::Minus1)?;
        let mask = range_mask(range, v, logits.device())?.to_dtype(probs.dtype())?;
        let projected = probs.reshape((b * t, v))?.matmul(&mask)?;
        Ok(projected.reshape((b, t))?)
    }

    pub fn played_notes(&self, logits: &Tensor) -> Result<Tensor> {
        self.project(logits, &self.note_on)
    }

    pub fn time_separators(&self, logits: &Tensor) -> Result<Tensor> {
        self.project(logits, &self.separators)
    }

    /// Soft count of note-on events per example, in `[0, steps]`.
    pub fn note_density(&self, logits: &Tensor) -> Result<Tensor> {
        Ok(self.played_notes(logits)?.sum(1)?)
    }

    pub fn rhythm_density(&self, logits: &Tensor) -> Result<Tensor> {
        let played = self.played_notes(logits)?;
        let separators = self.time_separators(logits)?;
        let (b, t) = played.dims2()?;

        let played_host = played.to_vec2::<f32>()?;
        let sep_host = separators.to_vec2::<f32>()?;
        let mut saturated = vec![0f32; b];
        let mut weights = vec![0f32; b * t];
        let mut valid = vec![0f32; b];

        for row in 0..b {
            let mut segment_start = 0usize;
            let mut mass = 0f32;
            for step in 0..t {
                if sep_host[row][step] < SEPARATOR_THRESHOLD {
                    mass += played_host[row][step];
                    continue;
                }
                if mass > SATURATION_THRESHOLD {
                    saturated[row] += 1.0;
                } else if mass > 0.0 {
                    // Small segments keep their raw, differentiable mass.
                    for w in &mut weights[row * t + segment_start..row * t + step] {
                        *w = 1.0;
                    }
                }
                mass = 0.0;
                segment_start = step + 1;
            }
            let total: f32 = sep_host[row].iter().sum();
            valid[row] = if total > SEPARATOR_FLOOR { 1.0 } else { 0.0 };
        }

        let device = logits.device();
        let dtype = played.dtype();
        let saturated = Tensor::from_vec(saturated, b, device)?.to_dtype(dtype)?;
        let weights = Tensor::from_vec(weights, (b, t), device)?.to_dtype(dtype)?;
        let valid = Tensor::from_vec(valid, b, device)?.to_dtype(dtype)?;

        let numerator = (saturated + (weights * &played)?.sum(1)?)?;
        let denominator = separators.sum(1)?;
        // Invalid rows become 0 / 1 rather than dividing by a vanishing mass.
        let numerator = (numerator * &valid)?;
        let denominator = ((denominator * &valid)? + valid.affine(-1.0, 1.0)?)?;
        Ok((numerator / denominator)?.clamp(0f32, 1f32)?)
    }
}

impl AttributeExtractor for SoftExtractor {
    fn extract(&self, logits: &Tensor, kind: AttributeKind) -> Result<Tensor> {
        match kind {
            AttributeKind::Rhythm => self.rhythm_density(logits),
            AttributeKind::Note => self.note_density(logits),
        }
    }

    fn name(&self) -> &'static str {
        "soft"
    }
}

/// `(vocab, 1)` column with ones inside `range`.
fn range_mask(range: &Range<usize>, vocab: usize, device: &Device) -> Result<Tensor> {
    let column: Vec<f32> = (0..vocab).map(|i| if range.contains(&i) { 1.0 } else { 0.0 }).collect();
    Ok(Tensor::from_vec(column, (vocab, 1), device)?)
}
