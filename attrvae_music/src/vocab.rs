// Performance-event vocabulary.
//
// A piece is a flat stream of 342 event tokens laid out in contiguous ranges:
//
//   0          PAD
//   1          EOS
//   2..90      NOTE_ON   for MIDI pitches 21..=108 (the 88 piano keys)
//   90..178    NOTE_OFF  for the same pitches
//   178..278   TIME_SHIFT of 1..=100 ticks, 10 ms per tick
//   278..342   VELOCITY  in 64 bins, velocity = 2 * bin + 1
//
// The contiguity matters: the soft attribute extractor projects decoder
// distributions onto id ranges with a single mask, so `NOTE_ON_RANGE` and
// `SEPARATOR_RANGE` are exported for it.
//
// The two derived streams the model also reconstructs have their own small
// vocabularies: rhythm (rest/onset/hold per 16th-note slot) and note count
// (onsets per slot, clamped to `NOTE_DIMS - 1`).

use serde::{Deserialize, Serialize};
use std::ops::Range;

pub const EVENT_DIMS: usize = 342;
pub const RHYTHM_DIMS: usize = 3;
pub const NOTE_DIMS: usize = 16;

pub const PAD: u32 = 0;
pub const EOS: u32 = 1;

pub const LOWEST_PITCH: u8 = 21;
pub const HIGHEST_PITCH: u8 = 108;

pub const NOTE_ON_RANGE: Range<usize> = 2..90;
pub const NOTE_OFF_RANGE: Range<usize> = 90..178;
pub const TIME_SHIFT_RANGE: Range<usize> = 178..278;
pub const VELOCITY_RANGE: Range<usize> = 278..342;

/// Time shifts of 30 ms and longer count as step separators for the soft
/// rhythm estimate; shorter shifts are treated as chord jitter.
pub const SEPARATOR_RANGE: Range<usize> = 180..278;

/// Seconds per TIME_SHIFT tick.
pub const TICK_SECONDS: f64 = 0.01;
pub const MAX_SHIFT_TICKS: u32 = 100;
pub const VELOCITY_BINS: u32 = 64;

/// One decoded vocabulary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventToken {
    Pad,
    Eos,
    NoteOn(u8),
    NoteOff(u8),
    /// Number of 10 ms ticks, 1..=100.
    TimeShift(u32),
    /// Velocity bin, 0..64.
    Velocity(u32),
}

impl EventToken {
    /// Classify a token id. Returns `None` for ids outside the vocabulary.
    pub fn from_id(id: u32) -> Option<Self> {
        let idx = id as usize;
        match idx {
            0 => Some(EventToken::Pad),
            1 => Some(EventToken::Eos),
            _ if NOTE_ON_RANGE.contains(&idx) => Some(EventToken::NoteOn(
                LOWEST_PITCH + (idx - NOTE_ON_RANGE.start) as u8,
            )),
            _ if NOTE_OFF_RANGE.contains(&idx) => Some(EventToken::NoteOff(
                LOWEST_PITCH + (idx - NOTE_OFF_RANGE.start) as u8,
            )),
            _ if TIME_SHIFT_RANGE.contains(&idx) => Some(EventToken::TimeShift(
                (idx - TIME_SHIFT_RANGE.start) as u32 + 1,
            )),
            _ if VELOCITY_RANGE.contains(&idx) => Some(EventToken::Velocity(
                (idx - VELOCITY_RANGE.start) as u32,
            )),
            _ => None,
        }
    }

    /// The token id. Pitches outside the piano range are clamped onto it,
    /// shifts onto 1..=100 ticks and velocity bins onto 0..64.
    pub fn id(self) -> u32 {
        match self {
            EventToken::Pad => PAD,
            EventToken::Eos => EOS,
            EventToken::NoteOn(p) => NOTE_ON_RANGE.start as u32 + pitch_offset(p),
            EventToken::NoteOff(p) => NOTE_OFF_RANGE.start as u32 + pitch_offset(p),
            EventToken::TimeShift(ticks) => {
                TIME_SHIFT_RANGE.start as u32 + ticks.clamp(1, MAX_SHIFT_TICKS) - 1
            }
            EventToken::Velocity(bin) => VELOCITY_RANGE.start as u32 + bin.min(VELOCITY_BINS - 1),
        }
    }

    /// True for PAD and EOS, the tokens that end a decoded sequence.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventToken::Pad | EventToken::Eos)
    }
}

fn pitch_offset(pitch: u8) -> u32 {
    (pitch.clamp(LOWEST_PITCH, HIGHEST_PITCH) - LOWEST_PITCH) as u32
}

/// MIDI velocity (0..=127) to a vocabulary bin.
pub fn velocity_to_bin(velocity: u8) -> u32 {
    (velocity.min(127) as u32 / 2).min(VELOCITY_BINS - 1)
}

/// Vocabulary bin to the MIDI velocity it stands for.
pub fn bin_to_velocity(bin: u32) -> u8 {
    (bin.min(VELOCITY_BINS - 1) * 2 + 1) as u8
}

/// Per-slot rhythm stream token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RhythmToken {
    Rest = 0,
    Onset = 1,
    Hold = 2,
}

impl RhythmToken {
    pub fn id(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_tile_the_vocabulary() {
        assert_eq!(NOTE_ON_RANGE.start, 2);
        assert_eq!(NOTE_ON_RANGE.end, NOTE_OFF_RANGE.start);
        assert_eq!(NOTE_OFF_RANGE.end, TIME_SHIFT_RANGE.start);
        assert_eq!(TIME_SHIFT_RANGE.end, VELOCITY_RANGE.start);
        assert_eq!(VELOCITY_RANGE.end, EVENT_DIMS);
        assert_eq!(NOTE_ON_RANGE.len(), 88);
        assert_eq!(TIME_SHIFT_RANGE.len(), MAX_SHIFT_TICKS as usize);
        assert_eq!(VELOCITY_RANGE.len(), VELOCITY_BINS as usize);
    }

    #[test]
    fn separator_range_is_inside_time_shifts() {
        assert!(SEPARATOR_RANGE.start >= TIME_SHIFT_RANGE.start);
        assert_eq!(SEPARATOR_RANGE.end, TIME_SHIFT_RANGE.end);
        // First separator is a 30 ms shift.
        assert_eq!(
            EventToken::from_id(SEPARATOR_RANGE.start as u32),
            Some(EventToken::TimeShift(3))
        );
    }

    #[test]
    fn every_id_classifies_and_maps_back() {
        for id in 0..EVENT_DIMS as u32 {
            let token = EventToken::from_id(id).unwrap();
            assert_eq!(token.id(), id, "{token:?}");
        }
        assert_eq!(EventToken::from_id(EVENT_DIMS as u32), None);
    }

    #[test]
    fn note_tokens_cover_piano_keys() {
        assert_eq!(EventToken::from_id(2), Some(EventToken::NoteOn(21)));
        assert_eq!(EventToken::from_id(89), Some(EventToken::NoteOn(108)));
        assert_eq!(EventToken::from_id(90), Some(EventToken::NoteOff(21)));
        assert_eq!(EventToken::NoteOn(10).id(), 2); // clamped to A0
    }

    #[test]
    fn velocity_bins() {
        assert_eq!(velocity_to_bin(0), 0);
        assert_eq!(velocity_to_bin(127), 63);
        assert_eq!(bin_to_velocity(velocity_to_bin(81)), 81);
    }
}
