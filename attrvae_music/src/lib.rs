// Symbolic-music side of the attribute-regularized VAE.
//
// Everything here operates on host data (token ids, note lists, piano rolls)
// and knows nothing about tensors. The training crate calls into it for the
// exact attribute strategy and for dataset preparation.
//
// Architecture:
// - vocab.rs: the 342-token performance-event vocabulary and its id ranges
// - performance.rs: note list <-> event token encoding, output cleaning
// - roll.rs: 16th-note piano-roll quantization of a note list
// - attributes.rs: rhythm/note density measured from a roll or straight from
//   decoded tokens, with an explicit `ExtractionError`
// - midi.rs: Standard MIDI File read/write via `midly`

pub mod attributes;
pub mod midi;
pub mod performance;
pub mod roll;
pub mod vocab;
