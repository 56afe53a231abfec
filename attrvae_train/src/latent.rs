// Latent layout and latent codes.
//
// The latent vector fed to the global decoder is the concatenation, in a
// fixed canonical order, of named subspaces followed by a conditioning
// vector:
//
//   [ rhythm subspace | note subspace | free subspace | conditioning ]
//
// Any subspace may be absent (the regularized VAE has no free code, the fader
// variant has only a free code) but the relative order never changes. The
// layout is static for the lifetime of a model and shared by the model, the
// sensitivity estimator and the checkpoint; every tensor handed to a
// `LatentCode` is checked against it.
//
// A perturbation touches exactly one coordinate of one subspace and leaves
// every other coordinate, including the conditioning vector, bit-identical.

use crate::error::{Result, TrainError};
use attrvae_music::attributes::AttributeKind;
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

/// Subspace names in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubspaceKind {
    Attribute(AttributeKind),
    Free,
}

impl SubspaceKind {
    fn rank(self) -> u8 {
        match self {
            SubspaceKind::Attribute(AttributeKind::Rhythm) => 0,
            SubspaceKind::Attribute(AttributeKind::Note) => 1,
            SubspaceKind::Free => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SubspaceKind::Attribute(kind) => kind.name(),
            SubspaceKind::Free => "free",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subspace {
    pub kind: SubspaceKind,
    pub dim: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatentLayout {
    subspaces: Vec<Subspace>,
    conditioning_dim: usize,
}

impl LatentLayout {
    /// Build a layout. Subspaces are sorted into canonical order; duplicate
    /// kinds and zero-width subspaces are rejected.
    pub fn new(mut subspaces: Vec<Subspace>, conditioning_dim: usize) -> Result<Self> {
        subspaces.sort_by_key(|s| s.kind.rank());
        for pair in subspaces.windows(2) {
            if pair[0].kind == pair[1].kind {
                return Err(TrainError::Config(format!(
                    "duplicate latent subspace {}",
                    pair[0].kind.name()
                )));
            }
        }
        if let Some(s) = subspaces.iter().find(|s| s.dim == 0) {
            return Err(TrainError::Config(format!("latent subspace {} has zero width", s.kind.name())));
        }
        if subspaces.is_empty() {
            return Err(TrainError::Config("latent layout has no subspaces".into()));
        }
        Ok(LatentLayout { subspaces, conditioning_dim })
    }

    /// Rhythm and note subspaces of `z_dim` each, plus conditioning.
    pub fn regularized(z_dim: usize, conditioning_dim: usize) -> Result<Self> {
        Self::new(
            vec![
                Subspace { kind: SubspaceKind::Attribute(AttributeKind::Rhythm), dim: z_dim },
                Subspace { kind: SubspaceKind::Attribute(AttributeKind::Note), dim: z_dim },
            ],
            conditioning_dim,
        )
    }

    /// A single free subspace plus conditioning.
    pub fn free(z_dim: usize, conditioning_dim: usize) -> Result<Self> {
        Self::new(vec![Subspace { kind: SubspaceKind::Free, dim: z_dim }], conditioning_dim)
    }

    pub fn subspaces(&self) -> &[Subspace] {
        &self.subspaces
    }

    pub fn conditioning_dim(&self) -> usize {
        self.conditioning_dim
    }

    /// Width of all subspaces, without conditioning.
    pub fn code_dim(&self) -> usize {
        self.subspaces.iter().map(|s| s.dim).sum()
    }

    /// Width of the full decoder input.
    pub fn total_dim(&self) -> usize {
        self.code_dim() + self.conditioning_dim
    }

    pub fn position(&self, kind: SubspaceKind) -> Option<usize> {
        self.subspaces.iter().position(|s| s.kind == kind)
    }

    /// Start offset of a subspace inside the concatenated vector.
    pub fn offset_of(&self, kind: SubspaceKind) -> Option<usize> {
        let idx = self.position(kind)?;
        Some(self.subspaces[..idx].iter().map(|s| s.dim).sum())
    }

    /// Attribute subspaces present in this layout, in canonical order.
    pub fn attributes(&self) -> Vec<AttributeKind> {
        self.subspaces
            .iter()
            .filter_map(|s| match s.kind {
                SubspaceKind::Attribute(kind) => Some(kind),
                SubspaceKind::Free => None,
            })
            .collect()
    }
}

/// A batch of latent codes split by subspace.
#[derive(Debug, Clone)]
pub struct LatentCode {
    layout: LatentLayout,
    /// One `(batch, dim)` tensor per layout subspace, in layout order.
    parts: Vec<Tensor>,
    /// `(batch, conditioning_dim)`.
    conditioning: Tensor,
}

impl LatentCode {
    pub fn new(layout: LatentLayout, parts: Vec<Tensor>, conditioning: Tensor) -> Result<Self> {
        if parts.len() != layout.subspaces.len() {
            return Err(TrainError::Shape(format!(
                "layout has {} subspaces, got {} tensors",
                layout.subspaces.len(),
                parts.len()
            )));
        }
        let (batch, cond_dim) = conditioning.dims2()?;
        if cond_dim != layout.conditioning_dim {
            return Err(TrainError::Shape(format!(
                "conditioning width {cond_dim}, layout expects {}",
                layout.conditioning_dim
            )));
        }
        for (part, sub) in parts.iter().zip(&layout.subspaces) {
            let (b, d) = part.dims2()?;
            if b != batch || d != sub.dim {
                return Err(TrainError::Shape(format!(
                    "{} subspace is ({b}, {d}), expected ({batch}, {})",
                    sub.kind.name(),
                    sub.dim
                )));
            }
        }
        Ok(LatentCode { layout, parts, conditioning })
    }

    /// Split a concatenated `(batch, total_dim)` vector back into parts.
    pub fn from_concatenated(layout: LatentLayout, latent: &Tensor) -> Result<Self> {
        let (_, width) = latent.dims2()?;
        if width != layout.total_dim() {
            return Err(TrainError::Shape(format!(
                "latent width {width}, layout expects {}",
                layout.total_dim()
            )));
        }
        let mut parts = Vec::with_capacity(layout.subspaces.len());
        let mut offset = 0;
        for sub in &layout.subspaces {
            parts.push(latent.narrow(1, offset, sub.dim)?);
            offset += sub.dim;
        }
        let conditioning = latent.narrow(1, offset, layout.conditioning_dim)?;
        Self::new(layout, parts, conditioning)
    }

    pub fn layout(&self) -> &LatentLayout {
        &self.layout
    }

    pub fn batch_size(&self) -> usize {
        self.conditioning.dims()[0]
    }

    pub fn subspace(&self, kind: SubspaceKind) -> Option<&Tensor> {
        self.layout.position(kind).map(|i| &self.parts[i])
    }

    pub fn attribute(&self, kind: AttributeKind) -> Option<&Tensor> {
        self.subspace(SubspaceKind::Attribute(kind))
    }

    pub fn conditioning(&self) -> &Tensor {
        &self.conditioning
    }

    /// Concatenate in canonical order: subspaces then conditioning.
    pub fn concat(&self) -> Result<Tensor> {
        let mut pieces: Vec<&Tensor> = self.parts.iter().collect();
        pieces.push(&self.conditioning);
        Ok(Tensor::cat(&pieces, 1)?)
    }

    /// Copy with `offsets[i]` added to `coordinate` of subspace `kind` for
    /// example `i`. All other coordinates are untouched.
    pub fn perturbed(&self, kind: SubspaceKind, coordinate: usize, offsets: &[f32]) -> Result<Self> {
        let idx = self
            .layout
            .position(kind)
            .ok_or_else(|| TrainError::Shape(format!("layout has no {} subspace", kind.name())))?;
        let part = &self.parts[idx];
        let (batch, dim) = part.dims2()?;
        if coordinate >= dim {
            return Err(TrainError::Shape(format!(
                "coordinate {coordinate} outside {} subspace of width {dim}",
                kind.name()
            )));
        }
        if offsets.len() != batch {
            return Err(TrainError::Shape(format!(
                "{} perturbation offsets for a batch of {batch}",
                offsets.len()
            )));
        }
        let mut shift = vec![0f32; batch * dim];
        for (row, &offset) in offsets.iter().enumerate() {
            shift[row * dim + coordinate] = offset;
        }
        let shift = Tensor::from_vec(shift, (batch, dim), part.device())?.to_dtype(part.dtype())?;
        let mut parts = self.parts.clone();
        parts[idx] = part.add(&shift)?;
        Ok(LatentCode {
            layout: self.layout.clone(),
            parts,
            conditioning: self.conditioning.clone(),
        })
    }

    /// Standard-normal prior draw for every subspace, with the given conditioning.
    pub fn sample_prior(
        layout: &LatentLayout,
        conditioning: Tensor,
        rng: &mut attrvae_prng::TrainRng,
    ) -> Result<Self> {
        let batch = conditioning.dims2()?.0;
        let device = conditioning.device().clone();
        let parts = layout
            .subspaces
            .iter()
            .map(|s| Tensor::from_vec(rng.gaussian_vec(batch * s.dim), (batch, s.dim), &device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Self::new(layout.clone(), parts, conditioning.to_dtype(DType::F32)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn regularized_code(batch: usize) -> LatentCode {
        let layout = LatentLayout::regularized(3, 2).unwrap();
        let dev = Device::Cpu;
        let r = Tensor::arange(0f32, (batch * 3) as f32, &dev).unwrap().reshape((batch, 3)).unwrap();
        let n = Tensor::ones((batch, 3), DType::F32, &dev).unwrap();
        let c = Tensor::full(7f32, (batch, 2), &dev).unwrap();
        LatentCode::new(layout, vec![r, n], c).unwrap()
    }

    #[test]
    fn layout_orders_subspaces_canonically() {
        let layout = LatentLayout::new(
            vec![
                Subspace { kind: SubspaceKind::Free, dim: 4 },
                Subspace { kind: SubspaceKind::Attribute(AttributeKind::Note), dim: 2 },
                Subspace { kind: SubspaceKind::Attribute(AttributeKind::Rhythm), dim: 3 },
            ],
            5,
        )
        .unwrap();
        let kinds: Vec<SubspaceKind> = layout.subspaces().iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SubspaceKind::Attribute(AttributeKind::Rhythm),
                SubspaceKind::Attribute(AttributeKind::Note),
                SubspaceKind::Free,
            ]
        );
        assert_eq!(layout.offset_of(SubspaceKind::Free), Some(5));
        assert_eq!(layout.total_dim(), 14);
        assert_eq!(layout.attributes(), vec![AttributeKind::Rhythm, AttributeKind::Note]);
    }

    #[test]
    fn duplicate_or_empty_subspaces_are_rejected() {
        let dup = LatentLayout::new(
            vec![
                Subspace { kind: SubspaceKind::Free, dim: 4 },
                Subspace { kind: SubspaceKind::Free, dim: 4 },
            ],
            0,
        );
        assert!(dup.is_err());
        let zero = LatentLayout::new(vec![Subspace { kind: SubspaceKind::Free, dim: 0 }], 0);
        assert!(zero.is_err());
    }

    #[test]
    fn wrong_part_count_is_a_shape_error() {
        let layout = LatentLayout::regularized(3, 2).unwrap();
        let dev = Device::Cpu;
        let part = Tensor::zeros((2, 3), DType::F32, &dev).unwrap();
        let cond = Tensor::zeros((2, 2), DType::F32, &dev).unwrap();
        let result = LatentCode::new(layout.clone(), vec![part.clone()], cond.clone());
        assert!(matches!(result, Err(TrainError::Shape(_))));
        let narrow_cond = Tensor::zeros((2, 1), DType::F32, &dev).unwrap();
        let result = LatentCode::new(layout, vec![part.clone(), part], narrow_cond);
        assert!(matches!(result, Err(TrainError::Shape(_))));
    }

    #[test]
    fn concat_then_split_is_identity() {
        let code = regularized_code(2);
        let flat = code.concat().unwrap();
        assert_eq!(flat.dims(), &[2, 8]);
        let split = LatentCode::from_concatenated(code.layout().clone(), &flat).unwrap();
        let a = code.concat().unwrap().to_vec2::<f32>().unwrap();
        let b = split.concat().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn perturbation_touches_one_coordinate() {
        let base = regularized_code(2);
        let plus = base
            .perturbed(SubspaceKind::Attribute(AttributeKind::Rhythm), 0, &[0.5, -0.25])
            .unwrap();
        let before = base.concat().unwrap().to_vec2::<f32>().unwrap();
        let after = plus.concat().unwrap().to_vec2::<f32>().unwrap();
        for (row, offset) in [(0usize, 0.5f32), (1, -0.25)] {
            for col in 0..8 {
                let expected = if col == 0 { before[row][col] + offset } else { before[row][col] };
                assert_eq!(after[row][col], expected, "row {row} col {col}");
            }
        }
    }

    #[test]
    fn perturbation_validates_shapes() {
        let base = regularized_code(2);
        let rhythm = SubspaceKind::Attribute(AttributeKind::Rhythm);
        assert!(base.perturbed(rhythm, 3, &[0.1, 0.1]).is_err());
        assert!(base.perturbed(rhythm, 0, &[0.1]).is_err());
        assert!(base.perturbed(SubspaceKind::Free, 0, &[0.1, 0.1]).is_err());
    }

    #[test]
    fn prior_sample_has_layout_shape() {
        let layout = LatentLayout::regularized(4, 3).unwrap();
        let cond = Tensor::zeros((5, 3), DType::F32, &Device::Cpu).unwrap();
        let mut rng = attrvae_prng::TrainRng::new(1);
        let code = LatentCode::sample_prior(&layout, cond, &mut rng).unwrap();
        assert_eq!(code.concat().unwrap().dims(), &[5, 11]);
    }
}
