// Error type for the training crate.
//
// Everything that can abort a run funnels into `TrainError`: tensor backend
// failures, checkpoint/config I/O, JSON (de)serialization, invalid
// configuration and shape mismatches between the latent layout and the
// tensors handed to it. None of these are retried; a research run is
// restarted by hand.
//
// Recoverable attribute-measurement failures never reach this type. They
// stay `ExtractionError`s inside the exact extractor, where the documented
// fallback is applied.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum TrainError {
    Tensor(candle_core::Error),
    Io { path: PathBuf, source: std::io::Error },
    Json(serde_json::Error),
    Config(String),
    Shape(String),
    Midi(attrvae_music::midi::MidiError),
}

pub type Result<T> = std::result::Result<T, TrainError>;

impl TrainError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io { path: path.into(), source }
    }
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainError::Tensor(e) => write!(f, "tensor error: {e}"),
            TrainError::Io { path, source } => write!(f, "{}: {source}", path.display()),
            TrainError::Json(e) => write!(f, "json error: {e}"),
            TrainError::Config(msg) => write!(f, "invalid configuration: {msg}"),
            TrainError::Shape(msg) => write!(f, "shape mismatch: {msg}"),
            TrainError::Midi(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TrainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainError::Tensor(e) => Some(e),
            TrainError::Io { source, .. } => Some(source),
            TrainError::Json(e) => Some(e),
            TrainError::Midi(e) => Some(e),
            TrainError::Config(_) | TrainError::Shape(_) => None,
        }
    }
}

impl From<candle_core::Error> for TrainError {
    fn from(e: candle_core::Error) -> Self {
        TrainError::Tensor(e)
    }
}

impl From<serde_json::Error> for TrainError {
    fn from(e: serde_json::Error) -> Self {
        TrainError::Json(e)
    }
}

impl From<attrvae_music::midi::MidiError> for TrainError {
    fn from(e: attrvae_music::midi::MidiError) -> Self {
        TrainError::Midi(e)
    }
}
