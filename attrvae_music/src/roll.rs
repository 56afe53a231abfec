// Piano roll: a note list quantized onto a 16th-note grid.
//
// Columns are slots of `1 / slots_per_beat` beats at a fixed tempo (4 slots
// per beat at 120 BPM by default, i.e. 0.125 s per slot). Each slot records
// the pitches that start in it and whether anything is sounding, which is all
// the attribute measures and the derived training streams need.
//
// The roll is derived from notes, never the other way around. Its length
// runs from time zero to the end of the last note, so a roll built from a
// non-empty note list always has at least one slot.

use crate::performance::NoteEvent;
use crate::vocab::{NOTE_DIMS, RhythmToken};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SLOTS_PER_BEAT: u32 = 4;
pub const DEFAULT_TEMPO_BPM: f64 = 120.0;

/// One grid column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Pitches whose onset quantizes into this slot, ascending.
    pub onsets: Vec<u8>,
    /// True if any note sounds during this slot (onset or held).
    pub sounding: bool,
}

impl Slot {
    pub fn rhythm(&self) -> RhythmToken {
        if !self.onsets.is_empty() {
            RhythmToken::Onset
        } else if self.sounding {
            RhythmToken::Hold
        } else {
            RhythmToken::Rest
        }
    }
}

/// Quantized roll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PianoRoll {
    pub slots_per_beat: u32,
    pub tempo_bpm: f64,
    pub slots: Vec<Slot>,
}

impl PianoRoll {
    /// Empty roll with `num_slots` rests.
    pub fn new(num_slots: usize, slots_per_beat: u32, tempo_bpm: f64) -> Self {
        PianoRoll {
            slots_per_beat,
            tempo_bpm,
            slots: vec![Slot::default(); num_slots],
        }
    }

    /// Quantize notes with the default grid (16ths at 120 BPM).
    pub fn from_notes(notes: &[NoteEvent]) -> Self {
        Self::from_notes_with(notes, DEFAULT_SLOTS_PER_BEAT, DEFAULT_TEMPO_BPM)
    }

    pub fn from_notes_with(notes: &[NoteEvent], slots_per_beat: u32, tempo_bpm: f64) -> Self {
        let slot_seconds = slot_seconds(slots_per_beat, tempo_bpm);
        let end = notes.iter().map(|n| n.end).fold(0.0f64, f64::max);
        let num_slots = (end / slot_seconds).ceil() as usize;
        let mut roll = PianoRoll::new(num_slots, slots_per_beat, tempo_bpm);

        for note in notes {
            let first = ((note.start / slot_seconds).round() as usize).min(num_slots.saturating_sub(1));
            // A note always occupies at least its onset slot.
            let last = ((note.end / slot_seconds).round() as usize).clamp(first + 1, num_slots.max(first + 1));
            if let Some(slot) = roll.slots.get_mut(first) {
                if !slot.onsets.contains(&note.pitch) {
                    slot.onsets.push(note.pitch);
                    slot.onsets.sort_unstable();
                }
            }
            for slot in roll.slots.iter_mut().take(last).skip(first) {
                slot.sounding = true;
            }
        }
        roll
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot_seconds(&self) -> f64 {
        slot_seconds(self.slots_per_beat, self.tempo_bpm)
    }

    /// The rhythm stream: one token id per slot.
    pub fn rhythm_tokens(&self) -> Vec<u32> {
        self.slots.iter().map(|s| s.rhythm().id()).collect()
    }

    /// The note-count stream: onsets per slot, clamped into the note vocabulary.
    pub fn note_count_tokens(&self) -> Vec<u32> {
        self.slots
            .iter()
            .map(|s| (s.onsets.len() as u32).min(NOTE_DIMS as u32 - 1))
            .collect()
    }

    /// Restrict to `len` slots starting at `start`, padding with rests.
    pub fn window(&self, start: usize, len: usize) -> PianoRoll {
        let mut out = PianoRoll::new(len, self.slots_per_beat, self.tempo_bpm);
        for (dst, src) in out.slots.iter_mut().zip(self.slots.iter().skip(start)) {
            *dst = src.clone();
        }
        out
    }

    pub fn stats(&self) -> RollStats {
        let mut stats = RollStats {
            total_slots: self.slots.len(),
            onset_slots: 0,
            total_onsets: 0,
            rests: 0,
        };
        for slot in &self.slots {
            match slot.rhythm() {
                RhythmToken::Onset => stats.onset_slots += 1,
                RhythmToken::Rest => stats.rests += 1,
                RhythmToken::Hold => {}
            }
            stats.total_onsets += slot.onsets.len();
        }
        stats
    }

    /// Compact one-line-per-roll rendering for logs: `x` onset, `-` hold,
    /// `.` rest, `|` every beat.
    pub fn summary(&self) -> String {
        let mut out = String::with_capacity(self.slots.len() * 2);
        for (i, slot) in self.slots.iter().enumerate() {
            if i > 0 && i % self.slots_per_beat as usize == 0 {
                out.push('|');
            }
            out.push(match slot.rhythm() {
                RhythmToken::Onset => 'x',
                RhythmToken::Hold => '-',
                RhythmToken::Rest => '.',
            });
        }
        out
    }
}

/// Counts over a roll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollStats {
    pub total_slots: usize,
    pub onset_slots: usize,
    pub total_onsets: usize,
    pub rests: usize,
}

fn slot_seconds(slots_per_beat: u32, tempo_bpm: f64) -> f64 {
    60.0 / tempo_bpm / slots_per_beat as f64
}
