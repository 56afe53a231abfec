// Parameter checkpoints and the training-counter sidecar.
//
// Parameters are the whole `VarMap`, stored as safetensors:
// - `params/<name>.safetensors`, overwritten at every epoch boundary
// - `params/<name>_<unix-millis>.safetensors`, written once per run and
//   never overwritten (a clash is an error)
//
// The sidecar `params/<name>.state.json` stores the step counter, the epoch
// and the run RNG. With `resume_counter` set, a resumed run restores them so
// warm-up and adversarial annealing continue where they stopped instead of
// restarting on warm parameters.
//
// Save failures are fatal to the run.

use crate::error::{Result, TrainError};
use attrvae_prng::TrainRng;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingCounters {
    pub step: u64,
    pub epoch: usize,
    pub rng: TrainRng,
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| TrainError::io(parent, e))?;
        }
    }
    Ok(())
}

pub fn save_parameters(varmap: &VarMap, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    varmap.save(path)?;
    Ok(())
}

/// Write-once snapshot; refuses to overwrite an existing file.
pub fn save_snapshot(varmap: &VarMap, path: &Path) -> Result<()> {
    if path.exists() {
        return Err(TrainError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "snapshot already exists"),
        ));
    }
    save_parameters(varmap, path)
}

/// Overwrite every variable in `varmap` with the stored tensors.
pub fn load_parameters(varmap: &mut VarMap, path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(TrainError::io(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "checkpoint not found"),
        ));
    }
    varmap.load(path)?;
    Ok(())
}

pub fn save_counters(counters: &TrainingCounters, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let json = serde_json::to_string_pretty(counters)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| TrainError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| TrainError::io(path, e))
}

/// `None` when no sidecar exists (a fresh run or a pre-sidecar checkpoint).
pub fn load_counters(path: &Path) -> Result<Option<TrainingCounters>> {
    match std::fs::read_to_string(path) {
        Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TrainError::io(path, e)),
    }
}

/// Wall-clock stamp for snapshot names. Millisecond resolution so two runs of
/// the same name finishing in the same second do not collide.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
