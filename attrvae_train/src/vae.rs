// Attribute-regularized VAE.
//
// Two event encoders produce the rhythm and note posteriors. Each sampled
// subspace reconstructs its own derived stream through a `StreamDecoder`, and
// the global decoder reconstructs the event stream from
// `[z_rhythm | z_note | chroma]`. The same global decoder, free-running, is
// what the sensitivity estimator probes.
//
// Optional heads read a single subspace:
// - classifier: 3-way density class logits (`is_class`)
// - residual: scalar density regression (`is_res`)

use crate::config::TrainConfig;
use crate::dataset::{Batch, CLASS_DIMS};
use crate::error::Result;
use crate::latent::{LatentCode, LatentLayout};
use crate::layers::{EventEncoder, GlobalDecoder, StreamDecoder};
use crate::model::{AttributeModel, ForwardMode, ModelOutput, PerAttribute};
use attrvae_music::vocab::{NOTE_DIMS, RHYTHM_DIMS};
use candle_core::Tensor;
use candle_nn::{Linear, Module, VarBuilder, linear};

pub struct AttrRegVae {
    layout: LatentLayout,
    rhythm_encoder: EventEncoder,
    note_encoder: EventEncoder,
    rhythm_decoder: StreamDecoder,
    note_decoder: StreamDecoder,
    global: GlobalDecoder,
    classifiers: Option<PerAttribute<Linear>>,
    residuals: Option<PerAttribute<Linear>>,
}

impl AttrRegVae {
    pub fn new(config: &TrainConfig, vb: VarBuilder) -> Result<Self> {
        let (h, z) = (config.hidden_dim, config.z_dim);
        let layout = LatentLayout::regularized(z, config.cond_dim)?;
        let classifiers = if config.is_class {
            Some(PerAttribute {
                rhythm: linear(z, CLASS_DIMS, vb.pp("cls_rhythm"))?,
                note: linear(z, CLASS_DIMS, vb.pp("cls_note"))?,
            })
        } else {
            None
        };
        let residuals = if config.is_res {
            Some(PerAttribute {
                rhythm: linear(z, 1, vb.pp("res_rhythm"))?,
                note: linear(z, 1, vb.pp("res_note"))?,
            })
        } else {
            None
        };
        Ok(AttrRegVae {
            rhythm_encoder: EventEncoder::new(h, z, vb.pp("enc_rhythm"))?,
            note_encoder: EventEncoder::new(h, z, vb.pp("enc_note"))?,
            rhythm_decoder: StreamDecoder::new(RHYTHM_DIMS, z, h, vb.pp("dec_rhythm"))?,
            note_decoder: StreamDecoder::new(NOTE_DIMS, z, h, vb.pp("dec_note"))?,
            global: GlobalDecoder::new(layout.total_dim(), h, vb.pp("global"))?,
            layout,
            classifiers,
            residuals,
        })
    }
}

impl AttributeModel for AttrRegVae {
    fn layout(&self) -> &LatentLayout {
        &self.layout
    }

    fn conditioning(&self, batch: &Batch) -> Result<Tensor> {
        Ok(batch.chroma.clone())
    }

    fn forward(&self, batch: &Batch, mut mode: ForwardMode<'_>) -> Result<ModelOutput> {
        let post_r = self.rhythm_encoder.forward(&batch.events_onehot)?;
        let post_n = self.note_encoder.forward(&batch.events_onehot)?;
        let z_r = post_r.draw(&mut mode)?;
        let z_n = post_n.draw(&mut mode)?;
        let latent = LatentCode::new(self.layout.clone(), vec![z_r.clone(), z_n.clone()], self.conditioning(batch)?)?;

        let rhythm = self.rhythm_decoder.forward(&z_r, &batch.rhythm_onehot)?;
        let note = self.note_decoder.forward(&z_n, &batch.note_onehot)?;
        let events = self.global.teacher_forced(&latent.concat()?, &batch.events_onehot)?;

        let classifier = match &self.classifiers {
            Some(heads) => Some(PerAttribute {
                rhythm: heads.rhythm.forward(&z_r)?,
                note: heads.note.forward(&z_n)?,
            }),
            None => None,
        };
        let residual = match &self.residuals {
            Some(heads) => Some(PerAttribute {
                rhythm: heads.rhythm.forward(&z_r)?.squeeze(1)?,
                note: heads.note.forward(&z_n)?.squeeze(1)?,
            }),
            None => None,
        };

        Ok(ModelOutput {
            events,
            rhythm: Some(rhythm),
            note: Some(note),
            posteriors: vec![post_r, post_n],
            latent,
            classifier,
            residual,
            predictors: None,
        })
    }

    fn global_decoder(&self, latent: &Tensor, steps: usize) -> Result<Tensor> {
        Ok(self.global.rollout(latent, steps)?)
    }
}
