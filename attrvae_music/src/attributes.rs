// Exact musical attribute measurement.
//
// Both attributes are pure functions of a piano roll:
// - rhythm density: fraction of slots that contain at least one onset
// - note density: mean number of onsets per slot
//
// `measure_tokens` runs the full exact pipeline on a raw decoder output:
// clean -> decode to notes -> quantize -> measure. Every stage can fail on
// degenerate output, and the failure is returned as an `ExtractionError`
// rather than swallowed here. The fallback policy (substitute 0 so the batch
// keeps its shape) belongs to the caller in the training crate.

use crate::performance::{DecodeError, decode_performance};
use crate::roll::PianoRoll;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The attributes a latent subspace can be tied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeKind {
    Rhythm,
    Note,
}

impl AttributeKind {
    pub const ALL: [AttributeKind; 2] = [AttributeKind::Rhythm, AttributeKind::Note];

    pub fn name(self) -> &'static str {
        match self {
            AttributeKind::Rhythm => "rhythm",
            AttributeKind::Note => "note",
        }
    }
}

impl fmt::Display for AttributeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why an attribute could not be measured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    Decode(DecodeError),
    /// The quantized roll has no slots to average over.
    EmptyRoll,
}

impl fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionError::Decode(e) => write!(f, "decode failed: {e}"),
            ExtractionError::EmptyRoll => write!(f, "piano roll is empty"),
        }
    }
}

impl std::error::Error for ExtractionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExtractionError::Decode(e) => Some(e),
            ExtractionError::EmptyRoll => None,
        }
    }
}

impl From<DecodeError> for ExtractionError {
    fn from(e: DecodeError) -> Self {
        ExtractionError::Decode(e)
    }
}

pub fn rhythm_density(roll: &PianoRoll) -> Result<f32, ExtractionError> {
    if roll.is_empty() {
        return Err(ExtractionError::EmptyRoll);
    }
    let stats = roll.stats();
    Ok(stats.onset_slots as f32 / stats.total_slots as f32)
}

pub fn note_density(roll: &PianoRoll) -> Result<f32, ExtractionError> {
    if roll.is_empty() {
        return Err(ExtractionError::EmptyRoll);
    }
    let stats = roll.stats();
    Ok(stats.total_onsets as f32 / stats.total_slots as f32)
}

pub fn measure(roll: &PianoRoll, kind: AttributeKind) -> Result<f32, ExtractionError> {
    match kind {
        AttributeKind::Rhythm => rhythm_density(roll),
        AttributeKind::Note => note_density(roll),
    }
}

/// Exact attribute of a raw decoder token sequence.
pub fn measure_tokens(tokens: &[u32], kind: AttributeKind) -> Result<f32, ExtractionError> {
    let notes = decode_performance(tokens)?;
    let roll = PianoRoll::from_notes(&notes);
    measure(&roll, kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::{NoteEvent, encode_performance};
    use crate::vocab::PAD;
    use attrvae_prng::TrainRng;

    fn note(pitch: u8, start: f64, end: f64) -> NoteEvent {
        NoteEvent { pitch, velocity: 80, start, end }
    }

    #[test]
    fn densities_of_a_simple_bar() {
        // Two beats: 8 slots. Onsets at slots 0 (chord of 2), 2, 4.
        let notes = vec![
            note(60, 0.0, 0.25),
            note(64, 0.0, 0.25),
            note(62, 0.25, 0.5),
            note(65, 0.5, 1.0),
        ];
        let roll = PianoRoll::from_notes(&notes);
        assert_eq!(roll.len(), 8);
        assert!((rhythm_density(&roll).unwrap() - 3.0 / 8.0).abs() < 1e-6);
        assert!((note_density(&roll).unwrap() - 4.0 / 8.0).abs() < 1e-6);
    }

    #[test]
    fn tokens_pipeline_matches_roll_measure() {
        let notes = vec![note(60, 0.0, 0.125), note(62, 0.25, 0.375), note(64, 0.5, 1.0)];
        let tokens = encode_performance(&notes);
        let roll = PianoRoll::from_notes(&notes);
        for kind in AttributeKind::ALL {
            assert_eq!(measure_tokens(&tokens, kind).unwrap(), measure(&roll, kind).unwrap());
        }
    }

    #[test]
    fn empty_roll_is_an_error_not_a_division() {
        let roll = PianoRoll::new(0, 4, 120.0);
        assert_eq!(rhythm_density(&roll), Err(ExtractionError::EmptyRoll));
        assert_eq!(note_density(&roll), Err(ExtractionError::EmptyRoll));
    }

    #[test]
    fn degenerate_tokens_surface_decode_errors() {
        let err = measure_tokens(&[PAD; 8], AttributeKind::Rhythm).unwrap_err();
        assert_eq!(err, ExtractionError::Decode(DecodeError::NoNotes));
    }

    #[test]
    fn rhythm_density_is_a_fraction_for_random_token_streams() {
        let mut rng = TrainRng::new(31);
        for _ in 0..500 {
            let len = rng.range_usize(1, 120);
            let tokens: Vec<u32> = (0..len).map(|_| rng.range_u64(2, 342) as u32).collect();
            match measure_tokens(&tokens, AttributeKind::Rhythm) {
                Ok(v) => assert!((0.0..=1.0).contains(&v), "rhythm density {v}"),
                Err(ExtractionError::Decode(_)) => {}
                Err(e) => panic!("unexpected error {e}"),
            }
            if let Ok(v) = measure_tokens(&tokens, AttributeKind::Note) {
                assert!(v >= 0.0);
            }
        }
    }
}
