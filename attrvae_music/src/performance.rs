// Note list <-> performance-event token encoding.
//
// Encoding walks the note-on/note-off boundaries of a note list in time
// order, emitting TIME_SHIFT tokens for the gaps (split into chunks of at
// most one second), a VELOCITY token whenever the velocity changes, and the
// NOTE_ON/NOTE_OFF tokens themselves. Offs sort before ons at equal times so
// a repeated key re-attacks cleanly.
//
// Decoding is the inverse walk. It is deliberately strict: the exact
// attribute path treats any `DecodeError` as "this rollout produced nothing
// measurable" and the caller substitutes its fallback value.

use crate::vocab::{
    EOS, EventToken, MAX_SHIFT_TICKS, TICK_SECONDS, bin_to_velocity, velocity_to_bin,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A sounding note, times in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteEvent {
    pub pitch: u8,
    pub velocity: u8,
    pub start: f64,
    pub end: f64,
}

impl NoteEvent {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Why a token sequence could not be turned into notes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A token id outside the 342-entry vocabulary.
    UnknownToken(u32),
    /// NOTE_OFF for a pitch that was not sounding.
    UnmatchedNoteOff(u8),
    /// The cleaned sequence decoded to zero notes.
    NoNotes,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownToken(id) => write!(f, "token id {id} is outside the vocabulary"),
            DecodeError::UnmatchedNoteOff(p) => write!(f, "note-off for silent pitch {p}"),
            DecodeError::NoNotes => write!(f, "sequence contains no complete notes"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Cut a raw decoder output at its first PAD or EOS token.
pub fn clean_tokens(tokens: &[u32]) -> &[u32] {
    let end = tokens
        .iter()
        .position(|&t| EventToken::from_id(t).is_some_and(EventToken::is_terminal))
        .unwrap_or(tokens.len());
    &tokens[..end]
}

/// Encode a note list as event tokens, terminated with EOS.
pub fn encode_performance(notes: &[NoteEvent]) -> Vec<u32> {
    // (tick, is_on, pitch, velocity); offs (false) sort before ons (true).
    let mut boundaries: Vec<(u64, bool, u8, u8)> = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        let on = seconds_to_ticks(note.start);
        let off = seconds_to_ticks(note.end).max(on + 1);
        boundaries.push((on, true, note.pitch, note.velocity));
        boundaries.push((off, false, note.pitch, note.velocity));
    }
    boundaries.sort_by_key(|&(tick, is_on, pitch, _)| (tick, is_on, pitch));

    let mut tokens = Vec::new();
    let mut clock = 0u64;
    let mut current_bin: Option<u32> = None;
    for (tick, is_on, pitch, velocity) in boundaries {
        let mut gap = tick - clock;
        while gap > 0 {
            let step = gap.min(MAX_SHIFT_TICKS as u64) as u32;
            tokens.push(EventToken::TimeShift(step).id());
            gap -= step as u64;
        }
        clock = tick;

        if is_on {
            let bin = velocity_to_bin(velocity);
            if current_bin != Some(bin) {
                tokens.push(EventToken::Velocity(bin).id());
                current_bin = Some(bin);
            }
            tokens.push(EventToken::NoteOn(pitch).id());
        } else {
            tokens.push(EventToken::NoteOff(pitch).id());
        }
    }
    tokens.push(EOS);
    tokens
}

/// Decode event tokens (already cleaned or not) into a note list sorted by
/// start time. Notes left sounding at the end close at the final clock.
pub fn decode_performance(tokens: &[u32]) -> Result<Vec<NoteEvent>, DecodeError> {
    let mut clock_ticks = 0u64;
    let mut velocity = bin_to_velocity(velocity_to_bin(64));
    let mut open: BTreeMap<u8, (u64, u8)> = BTreeMap::new();
    let mut notes = Vec::new();

    for &id in clean_tokens(tokens) {
        let token = EventToken::from_id(id).ok_or(DecodeError::UnknownToken(id))?;
        match token {
            EventToken::Pad | EventToken::Eos => break,
            EventToken::TimeShift(ticks) => clock_ticks += ticks as u64,
            EventToken::Velocity(bin) => velocity = bin_to_velocity(bin),
            EventToken::NoteOn(pitch) => {
                // Re-attacking a sounding key closes the previous note.
                if let Some((start, vel)) = open.insert(pitch, (clock_ticks, velocity)) {
                    push_note(&mut notes, pitch, vel, start, clock_ticks);
                }
            }
            EventToken::NoteOff(pitch) => {
                let (start, vel) = open.remove(&pitch).ok_or(DecodeError::UnmatchedNoteOff(pitch))?;
                push_note(&mut notes, pitch, vel, start, clock_ticks);
            }
        }
    }
    for (pitch, (start, vel)) in open {
        push_note(&mut notes, pitch, vel, start, clock_ticks);
    }

    if notes.is_empty() {
        return Err(DecodeError::NoNotes);
    }
    notes.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.pitch.cmp(&b.pitch)));
    Ok(notes)
}

fn push_note(notes: &mut Vec<NoteEvent>, pitch: u8, velocity: u8, start: u64, end: u64) {
    // Zero-length notes carry no rhythm information.
    if end > start {
        notes.push(NoteEvent {
            pitch,
            velocity,
            start: start as f64 * TICK_SECONDS,
            end: end as f64 * TICK_SECONDS,
        });
    }
}

fn seconds_to_ticks(seconds: f64) -> u64 {
    (seconds.max(0.0) / TICK_SECONDS).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::PAD;

    fn note(pitch: u8, start: f64, end: f64) -> NoteEvent {
        NoteEvent { pitch, velocity: 81, start, end }
    }

    #[test]
    fn encode_then_decode_recovers_notes() {
        let notes = vec![note(60, 0.0, 0.5), note(64, 0.0, 0.5), note(67, 0.5, 2.25)];
        let tokens = encode_performance(&notes);
        assert_eq!(*tokens.last().unwrap(), EOS);
        let decoded = decode_performance(&tokens).unwrap();
        assert_eq!(decoded.len(), 3);
        for (a, b) in notes.iter().zip(&decoded) {
            assert_eq!(a.pitch, b.pitch);
            assert_eq!(a.velocity, b.velocity);
            assert!((a.start - b.start).abs() < 1e-9);
            assert!((a.end - b.end).abs() < 1e-9);
        }
    }

    #[test]
    fn long_gaps_split_into_one_second_shifts() {
        let tokens = encode_performance(&[note(60, 2.5, 2.6)]);
        let shifts: Vec<EventToken> = tokens
            .iter()
            .filter_map(|&t| EventToken::from_id(t))
            .filter(|t| matches!(t, EventToken::TimeShift(_)))
            .collect();
        assert_eq!(
            shifts,
            vec![
                EventToken::TimeShift(100),
                EventToken::TimeShift(100),
                EventToken::TimeShift(50),
                EventToken::TimeShift(10),
            ]
        );
    }

    #[test]
    fn clean_cuts_at_first_terminal() {
        let raw = [2, 180, 90, EOS, 2, 180, PAD];
        assert_eq!(clean_tokens(&raw), &[2, 180, 90]);
        assert_eq!(clean_tokens(&[PAD, 2]), &[] as &[u32]);
    }

    #[test]
    fn empty_and_degenerate_outputs_fail() {
        assert_eq!(decode_performance(&[]), Err(DecodeError::NoNotes));
        assert_eq!(decode_performance(&[PAD; 10]), Err(DecodeError::NoNotes));
        // Only time shifts.
        assert_eq!(decode_performance(&[200, 200, 200]), Err(DecodeError::NoNotes));
        // Note on and off with no time between them.
        assert_eq!(decode_performance(&[2, 90]), Err(DecodeError::NoNotes));
    }

    #[test]
    fn unmatched_note_off_is_an_error() {
        assert_eq!(
            decode_performance(&[180, 95]),
            Err(DecodeError::UnmatchedNoteOff(26))
        );
    }

    #[test]
    fn unknown_token_is_an_error() {
        assert_eq!(decode_performance(&[2, 999]), Err(DecodeError::UnknownToken(999)));
    }

    #[test]
    fn dangling_notes_close_at_final_clock() {
        // NOTE_ON(60), shift 50 ticks, no note-off.
        let tokens = [EventToken::NoteOn(60).id(), EventToken::TimeShift(50).id()];
        let notes = decode_performance(&tokens).unwrap();
        assert_eq!(notes.len(), 1);
        assert!((notes[0].end - 0.5).abs() < 1e-9);
    }
}
