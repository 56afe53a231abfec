// Training examples, splits and device batches.
//
// A dataset is a JSON-lines file with one `Example` per line, produced by the
// `prepare` command from a directory of MIDI files (see `prepare_examples`).
// Every example carries the event stream the model reconstructs, the two
// derived streams (rhythm and note counts per 16th-note slot), a chroma
// conditioning vector, the measured attribute values and their 3-way classes.
//
// Splits are by index order, 80/10/10. Only the training split is shuffled,
// and only with the run RNG, so a resumed run with a restored RNG visits
// batches in the same order it would have without the interruption.
//
// One-hot encodings are built on the host and uploaded once per batch.

use crate::config::TrainConfig;
use crate::error::{Result, TrainError};
use attrvae_music::attributes::{AttributeKind, measure};
use attrvae_music::performance::{NoteEvent, encode_performance};
use attrvae_music::roll::PianoRoll;
use attrvae_music::vocab::{EVENT_DIMS, NOTE_DIMS, PAD, RHYTHM_DIMS};
use attrvae_prng::TrainRng;
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Number of density classes for the classifier heads.
pub const CLASS_DIMS: usize = 3;

/// Class boundaries (low / mid / high) per attribute.
const RHYTHM_CLASS_EDGES: [f32; 2] = [0.25, 0.5];
const NOTE_CLASS_EDGES: [f32; 2] = [0.5, 1.0];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub events: Vec<u32>,
    pub rhythm: Vec<u32>,
    pub note: Vec<u32>,
    pub chroma: Vec<f32>,
    pub rhythm_class: u32,
    pub note_class: u32,
    pub rhythm_density: f32,
    pub note_density: f32,
}

impl Example {
    pub fn density(&self, kind: AttributeKind) -> f32 {
        match kind {
            AttributeKind::Rhythm => self.rhythm_density,
            AttributeKind::Note => self.note_density,
        }
    }

    fn check(&self, config: &TrainConfig, line: usize) -> Result<()> {
        let bad = |what: &str, got: usize, want: usize| {
            Err(TrainError::Shape(format!("dataset line {line}: {what} has length {got}, expected {want}")))
        };
        if self.events.len() != config.time_step {
            return bad("events", self.events.len(), config.time_step);
        }
        if self.rhythm.len() != config.rhythm_steps {
            return bad("rhythm", self.rhythm.len(), config.rhythm_steps);
        }
        if self.note.len() != config.rhythm_steps {
            return bad("note", self.note.len(), config.rhythm_steps);
        }
        if self.chroma.len() != config.cond_dim {
            return bad("chroma", self.chroma.len(), config.cond_dim);
        }
        let out_of_range = self.events.iter().any(|&t| t as usize >= EVENT_DIMS)
            || self.rhythm.iter().any(|&t| t as usize >= RHYTHM_DIMS)
            || self.note.iter().any(|&t| t as usize >= NOTE_DIMS)
            || self.rhythm_class as usize >= CLASS_DIMS
            || self.note_class as usize >= CLASS_DIMS;
        if out_of_range {
            return Err(TrainError::Shape(format!("dataset line {line}: token outside vocabulary")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "val",
            Split::Test => "test",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    examples: Vec<Example>,
    train_end: usize,
    val_end: usize,
}

impl Dataset {
    pub fn new(examples: Vec<Example>) -> Self {
        let n = examples.len();
        Dataset {
            train_end: (n as f64 * 0.8) as usize,
            val_end: (n as f64 * 0.9) as usize,
            examples,
        }
    }

    /// Load a JSON-lines file, checking every example against the config.
    pub fn load(path: &Path, config: &TrainConfig) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| TrainError::io(path, e))?;
        let mut examples = Vec::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| TrainError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let example: Example = serde_json::from_str(&line)?;
            example.check(config, i + 1)?;
            examples.push(example);
        }
        if examples.is_empty() {
            return Err(TrainError::Config(format!("dataset {} is empty", path.display())));
        }
        Ok(Self::new(examples))
    }

    pub fn save(examples: &[Example], path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TrainError::io(parent, e))?;
        }
        let file = std::fs::File::create(path).map_err(|e| TrainError::io(path, e))?;
        let mut out = BufWriter::new(file);
        for example in examples {
            serde_json::to_writer(&mut out, example)?;
            out.write_all(b"\n").map_err(|e| TrainError::io(path, e))?;
        }
        out.flush().map_err(|e| TrainError::io(path, e))
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn split(&self, split: Split) -> &[Example] {
        match split {
            Split::Train => &self.examples[..self.train_end],
            Split::Validation => &self.examples[self.train_end..self.val_end],
            Split::Test => &self.examples[self.val_end..],
        }
    }

    /// Batches of example indices into `split`. The last batch may be short.
    pub fn batch_indices(
        &self,
        split: Split,
        batch_size: usize,
        shuffle: Option<&mut TrainRng>,
    ) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.split(split).len()).collect();
        if let Some(rng) = shuffle {
            rng.shuffle(&mut order);
        }
        order.chunks(batch_size.max(1)).map(<[usize]>::to_vec).collect()
    }

    pub fn batch(&self, split: Split, indices: &[usize], device: &Device) -> Result<Batch> {
        let examples = self.split(split);
        let picked: Vec<&Example> = indices.iter().map(|&i| &examples[i]).collect();
        Batch::from_examples(&picked, device)
    }
}

/// A batch on the training device.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(batch, time_step)` u32 event targets.
    pub events: Tensor,
    /// `(batch, time_step, EVENT_DIMS)` one-hot inputs.
    pub events_onehot: Tensor,
    pub rhythm: Tensor,
    pub rhythm_onehot: Tensor,
    pub note: Tensor,
    pub note_onehot: Tensor,
    /// `(batch, cond_dim)` chroma.
    pub chroma: Tensor,
    /// `(batch,)` u32 classes.
    pub rhythm_class: Tensor,
    pub note_class: Tensor,
    /// `(batch,)` measured densities.
    pub rhythm_density: Tensor,
    pub note_density: Tensor,
}

impl Batch {
    pub fn from_examples(examples: &[&Example], device: &Device) -> Result<Self> {
        let b = examples.len();
        if b == 0 {
            return Err(TrainError::Shape("empty batch".into()));
        }
        let t = examples[0].events.len();
        let r = examples[0].rhythm.len();
        let c = examples[0].chroma.len();
        let events: Vec<u32> = examples.iter().flat_map(|e| e.events.iter().copied()).collect();
        let rhythm: Vec<u32> = examples.iter().flat_map(|e| e.rhythm.iter().copied()).collect();
        let note: Vec<u32> = examples.iter().flat_map(|e| e.note.iter().copied()).collect();
        let chroma: Vec<f32> = examples.iter().flat_map(|e| e.chroma.iter().copied()).collect();
        if events.len() != b * t || rhythm.len() != b * r || note.len() != b * r || chroma.len() != b * c {
            return Err(TrainError::Shape("examples in a batch differ in length".into()));
        }

        Ok(Batch {
            events_onehot: one_hot(&events, (b, t), EVENT_DIMS, device)?,
            events: Tensor::from_vec(events, (b, t), device)?,
            rhythm_onehot: one_hot(&rhythm, (b, r), RHYTHM_DIMS, device)?,
            rhythm: Tensor::from_vec(rhythm, (b, r), device)?,
            note_onehot: one_hot(&note, (b, r), NOTE_DIMS, device)?,
            note: Tensor::from_vec(note, (b, r), device)?,
            chroma: Tensor::from_vec(chroma, (b, c), device)?,
            rhythm_class: Tensor::from_vec(examples.iter().map(|e| e.rhythm_class).collect::<Vec<_>>(), b, device)?,
            note_class: Tensor::from_vec(examples.iter().map(|e| e.note_class).collect::<Vec<_>>(), b, device)?,
            rhythm_density: Tensor::from_vec(examples.iter().map(|e| e.rhythm_density).collect::<Vec<_>>(), b, device)?,
            note_density: Tensor::from_vec(examples.iter().map(|e| e.note_density).collect::<Vec<_>>(), b, device)?,
        })
    }

    pub fn size(&self) -> usize {
        self.events.dims()[0]
    }

    pub fn density(&self, kind: AttributeKind) -> &Tensor {
        match kind {
            AttributeKind::Rhythm => &self.rhythm_density,
            AttributeKind::Note => &self.note_density,
        }
    }

    pub fn class(&self, kind: AttributeKind) -> &Tensor {
        match kind {
            AttributeKind::Rhythm => &self.rhythm_class,
            AttributeKind::Note => &self.note_class,
        }
    }
}

/// Host-side one-hot: `ids` is row-major `(b, t)`, result `(b, t, dims)` f32.
pub fn one_hot(ids: &[u32], (b, t): (usize, usize), dims: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; b * t * dims];
    for (i, &id) in ids.iter().enumerate() {
        let id = id as usize;
        if id >= dims {
            return Err(TrainError::Shape(format!("token {id} outside one-hot width {dims}")));
        }
        data[i * dims + id] = 1.0;
    }
    Ok(Tensor::from_vec(data, (b, t, dims), device)?)
}

fn density_class(value: f32, edges: [f32; 2]) -> u32 {
    if value < edges[0] {
        0
    } else if value < edges[1] {
        1
    } else {
        2
    }
}

/// 12 onset pitch-class counts then 12 duration-weighted pitch-class
/// totals, each half normalized to sum to one (or left zero).
pub fn chroma(notes: &[NoteEvent]) -> Vec<f32> {
    let mut out = vec![0f32; 24];
    for note in notes {
        let pc = (note.pitch % 12) as usize;
        out[pc] += 1.0;
        out[12 + pc] += note.duration() as f32;
    }
    for half in out.chunks_mut(12) {
        let total: f32 = half.iter().sum();
        if total > 0.0 {
            half.iter_mut().for_each(|v| *v /= total);
        }
    }
    out
}

/// Cut a performance into windows of `rhythm_steps` slots and encode each
/// into a training example. Windows without a complete note are skipped.
pub fn prepare_examples(notes: &[NoteEvent], time_step: usize, rhythm_steps: usize) -> Vec<Example> {
    let full = PianoRoll::from_notes(notes);
    let window_seconds = full.slot_seconds() * rhythm_steps as f64;
    if full.is_empty() || window_seconds <= 0.0 {
        return Vec::new();
    }
    let windows = full.len().div_ceil(rhythm_steps);
    let mut examples = Vec::with_capacity(windows);

    for w in 0..windows {
        let start = w as f64 * window_seconds;
        let end = start + window_seconds;
        let local: Vec<NoteEvent> = notes
            .iter()
            .filter(|n| n.start >= start && n.start < end)
            .map(|n| NoteEvent {
                start: n.start - start,
                end: n.end.min(end) - start,
                ..*n
            })
            .filter(|n| n.end > n.start)
            .collect();
        if local.is_empty() {
            continue;
        }

        let roll = PianoRoll::from_notes(&local).window(0, rhythm_steps);
        let (Ok(rhythm_density), Ok(note_density)) =
            (measure(&roll, AttributeKind::Rhythm), measure(&roll, AttributeKind::Note))
        else {
            continue;
        };

        let mut events = encode_performance(&local);
        events.truncate(time_step);
        events.resize(time_step, PAD);

        examples.push(Example {
            events,
            rhythm: roll.rhythm_tokens(),
            note: roll.note_count_tokens(),
            chroma: chroma(&local),
            rhythm_class: density_class(rhythm_density, RHYTHM_CLASS_EDGES),
            note_class: density_class(note_density, NOTE_CLASS_EDGES),
            rhythm_density,
            note_density,
        });
    }
    examples
}
