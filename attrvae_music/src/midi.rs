// Standard MIDI File input and output for note lists.
//
// Reading flattens every track of an SMF (format 0 or 1) into one note list
// in seconds, honoring the tempo map. The drum channel is skipped: the event
// vocabulary covers pitched piano keys only. Writing produces a single-track
// SMF at a fixed tempo, which is what the `sample` command emits for decoded
// rollouts.
//
// Uses the `midly` crate for parsing and serialization.

use crate::performance::NoteEvent;
use midly::{
    Format, Header, MetaMessage, MidiMessage, Smf, Timing, Track, TrackEvent, TrackEventKind,
    num::{u4, u7, u15, u24, u28},
};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Ticks per quarter note in written files.
const TICKS_PER_QUARTER: u16 = 480;

/// Tempo of written files (microseconds per quarter note, 120 BPM).
const WRITE_TEMPO_US: u32 = 500_000;

/// Default tempo when a file carries no tempo event.
const DEFAULT_TEMPO_US: u32 = 500_000;

const DRUM_CHANNEL: u8 = 9;

#[derive(Debug)]
pub enum MidiError {
    Io(std::io::Error),
    Parse(midly::Error),
    /// SMPTE timecode files are not supported.
    UnsupportedTiming,
}

impl fmt::Display for MidiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MidiError::Io(e) => write!(f, "midi i/o: {e}"),
            MidiError::Parse(e) => write!(f, "midi parse: {e}"),
            MidiError::UnsupportedTiming => write!(f, "timecode-based midi timing is unsupported"),
        }
    }
}

impl std::error::Error for MidiError {}

impl From<std::io::Error> for MidiError {
    fn from(e: std::io::Error) -> Self {
        MidiError::Io(e)
    }
}

impl From<midly::Error> for MidiError {
    fn from(e: midly::Error) -> Self {
        MidiError::Parse(e)
    }
}

/// Read a MIDI file into a note list sorted by onset.
pub fn read_midi(path: &Path) -> Result<Vec<NoteEvent>, MidiError> {
    let bytes = std::fs::read(path)?;
    parse_midi(&bytes)
}

/// Parse in-memory SMF bytes into a note list sorted by onset.
pub fn parse_midi(bytes: &[u8]) -> Result<Vec<NoteEvent>, MidiError> {
    let smf = Smf::parse(bytes)?;
    let ticks_per_quarter = match smf.header.timing {
        Timing::Metrical(tpq) => tpq.as_int() as f64,
        Timing::Timecode(..) => return Err(MidiError::UnsupportedTiming),
    };

    // Tempo map: absolute tick -> microseconds per quarter, gathered from all tracks.
    let mut tempo_map: BTreeMap<u64, u32> = BTreeMap::new();
    for track in &smf.tracks {
        let mut tick = 0u64;
        for event in track {
            tick += event.delta.as_int() as u64;
            if let TrackEventKind::Meta(MetaMessage::Tempo(t)) = event.kind {
                tempo_map.insert(tick, t.as_int());
            }
        }
    }
    let clock = TempoClock::new(&tempo_map, ticks_per_quarter);

    let mut notes = Vec::new();
    for track in &smf.tracks {
        let mut tick = 0u64;
        // (channel, key) -> (onset tick, velocity)
        let mut open: BTreeMap<(u8, u8), (u64, u8)> = BTreeMap::new();
        for event in track {
            tick += event.delta.as_int() as u64;
            let TrackEventKind::Midi { channel, message } = event.kind else {
                continue;
            };
            let channel = channel.as_int();
            if channel == DRUM_CHANNEL {
                continue;
            }
            match message {
                MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                    let key = key.as_int();
                    if let Some((start, v)) = open.insert((channel, key), (tick, vel.as_int())) {
                        push_note(&mut notes, &clock, key, v, start, tick);
                    }
                }
                MidiMessage::NoteOn { key, .. } | MidiMessage::NoteOff { key, .. } => {
                    let key = key.as_int();
                    if let Some((start, v)) = open.remove(&(channel, key)) {
                        push_note(&mut notes, &clock, key, v, start, tick);
                    }
                }
                _ => {}
            }
        }
        for ((_, key), (start, v)) in open {
            push_note(&mut notes, &clock, key, v, start, tick);
        }
    }

    notes.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.pitch.cmp(&b.pitch)));
    Ok(notes)
}

fn push_note(notes: &mut Vec<NoteEvent>, clock: &TempoClock, pitch: u8, velocity: u8, start: u64, end: u64) {
    if end > start {
        notes.push(NoteEvent {
            pitch,
            velocity,
            start: clock.seconds(start),
            end: clock.seconds(end),
        });
    }
}

/// Piecewise-constant tempo map converting absolute ticks to seconds.
struct TempoClock {
    /// (segment start tick, seconds at segment start, seconds per tick)
    segments: Vec<(u64, f64, f64)>,
}

impl TempoClock {
    fn new(tempo_map: &BTreeMap<u64, u32>, ticks_per_quarter: f64) -> Self {
        let per_tick = |us: u32| us as f64 / 1_000_000.0 / ticks_per_quarter;
        let mut segments = vec![(0u64, 0.0f64, per_tick(DEFAULT_TEMPO_US))];
        for (&tick, &us) in tempo_map {
            let &(last_tick, last_secs, last_rate) = segments.last().unwrap_or(&(0, 0.0, 0.0));
            let secs = last_secs + (tick - last_tick) as f64 * last_rate;
            if tick == last_tick {
                segments.pop();
            }
            segments.push((tick, secs, per_tick(us)));
        }
        TempoClock { segments }
    }

    fn seconds(&self, tick: u64) -> f64 {
        let idx = self.segments.partition_point(|&(start, _, _)| start <= tick);
        let (start, secs, rate) = self.segments[idx.saturating_sub(1)];
        secs + (tick - start) as f64 * rate
    }
}

/// Write a note list as a single-track SMF at 120 BPM.
pub fn write_midi(notes: &[NoteEvent], path: &Path) -> Result<(), MidiError> {
    notes_to_smf(notes).save(path)?;
    Ok(())
}

fn notes_to_smf(notes: &[NoteEvent]) -> Smf<'static> {
    let mut smf = Smf::new(Header::new(
        Format::SingleTrack,
        Timing::Metrical(u15::new(TICKS_PER_QUARTER)),
    ));
    let ticks_per_second = TICKS_PER_QUARTER as f64 * 1_000_000.0 / WRITE_TEMPO_US as f64;
    let to_tick = |secs: f64| (secs.max(0.0) * ticks_per_second).round() as u32;

    // (tick, is_on, key, velocity); offs first at equal ticks.
    let mut boundaries: Vec<(u32, bool, u8, u8)> = Vec::with_capacity(notes.len() * 2);
    for note in notes {
        let on = to_tick(note.start);
        let off = to_tick(note.end).max(on + 1);
        boundaries.push((on, true, note.pitch.min(127), note.velocity.clamp(1, 127)));
        boundaries.push((off, false, note.pitch.min(127), 0));
    }
    boundaries.sort_by_key(|&(tick, is_on, key, _)| (tick, is_on, key));

    let channel = u4::new(0);
    let mut track: Track<'static> = vec![
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::TrackName(b"Piano")),
        },
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::new(WRITE_TEMPO_US))),
        },
        TrackEvent {
            delta: u28::new(0),
            kind: TrackEventKind::Midi {
                channel,
                message: MidiMessage::ProgramChange { program: u7::new(0) },
            },
        },
    ];

    let mut last_tick = 0u32;
    for (tick, is_on, key, vel) in boundaries {
        let message = if is_on {
            MidiMessage::NoteOn { key: u7::new(key), vel: u7::new(vel) }
        } else {
            MidiMessage::NoteOff { key: u7::new(key), vel: u7::new(0) }
        };
        track.push(TrackEvent {
            delta: u28::new(tick - last_tick),
            kind: TrackEventKind::Midi { channel, message },
        });
        last_tick = tick;
    }

    track.push(TrackEvent {
        delta: u28::new(0),
        kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
    });
    smf.tracks.push(track);
    smf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(pitch: u8, start: f64, end: f64) -> NoteEvent {
        NoteEvent { pitch, velocity: 90, start, end }
    }

    #[test]
    fn written_smf_parses_back_to_the_same_notes() {
        let notes = vec![note(60, 0.0, 0.5), note(64, 0.25, 0.75), note(67, 1.0, 2.0)];
        let smf = notes_to_smf(&notes);
        assert_eq!(smf.tracks.len(), 1);
        let mut bytes = Vec::new();
        smf.write_std(&mut bytes).unwrap();
        let parsed = parse_midi(&bytes).unwrap();
        assert_eq!(parsed.len(), 3);
        for (a, b) in notes.iter().zip(&parsed) {
            assert_eq!(a.pitch, b.pitch);
            assert_eq!(a.velocity, b.velocity);
            assert!((a.start - b.start).abs() < 1e-3);
            assert!((a.end - b.end).abs() < 1e-3);
        }
    }

    #[test]
    fn tempo_changes_stretch_time() {
        let mut map = BTreeMap::new();
        // 120 BPM for the first quarter, then 60 BPM.
        map.insert(0, 500_000);
        map.insert(480, 1_000_000);
        let clock = TempoClock::new(&map, 480.0);
        assert!((clock.seconds(480) - 0.5).abs() < 1e-9);
        assert!((clock.seconds(960) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn garbage_bytes_are_a_parse_error() {
        assert!(matches!(parse_midi(b"not a midi file"), Err(MidiError::Parse(_))));
    }
}
