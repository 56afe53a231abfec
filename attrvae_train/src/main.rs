// CLI entry point for the attribute-VAE trainer.
//
// Usage:
//   attrvae [--config model_config.json] <COMMAND>
//     train       Resume from the checkpoint if present, train, then evaluate
//     evaluate    Load the checkpoint, report train/test metrics
//     sample      Decode prior samples to MIDI files
//     prepare     Turn a directory of MIDI files into the JSONL dataset
//
// Log verbosity follows RUST_LOG (default `info`).

use anyhow::{Context, bail};
use attrvae_music::midi::{read_midi, write_midi};
use attrvae_music::performance::{clean_tokens, decode_performance};
use attrvae_prng::TrainRng;
use attrvae_train::checkpoint::load_parameters;
use attrvae_train::config::{TrainConfig, Variant};
use attrvae_train::dataset::{Dataset, Example, Split, prepare_examples};
use attrvae_train::trainer::{EvaluationReport, Trainer};
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "attrvae", about = "Attribute-regularized music VAE")]
struct Cli {
    /// Run configuration (JSON).
    #[arg(long, default_value = "model_config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train, resuming from the primary checkpoint when it exists.
    Train,
    /// Evaluate the primary checkpoint on the train and test splits.
    Evaluate,
    /// Decode prior samples conditioned on test-split examples.
    Sample {
        #[arg(long, default_value_t = 4)]
        count: usize,
        #[arg(long, default_value = "samples")]
        out_dir: PathBuf,
        /// Override the fader conditioning (rhythm density).
        #[arg(long, requires = "note_density")]
        rhythm_density: Option<f32>,
        /// Override the fader conditioning (note density).
        #[arg(long, requires = "rhythm_density")]
        note_density: Option<f32>,
    },
    /// Build the dataset file from a directory of MIDI files.
    Prepare {
        midi_dir: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = TrainConfig::load(&cli.config)
        .with_context(|| format!("loading config {}", cli.config.display()))?;

    match cli.command {
        Command::Train => train(config),
        Command::Evaluate => evaluate(config),
        Command::Sample {
            count,
            out_dir,
            rhythm_density,
            note_density,
        } => sample(config, count, &out_dir, rhythm_density.zip(note_density)),
        Command::Prepare { midi_dir } => prepare(&config, &midi_dir),
    }
}

fn train(config: TrainConfig) -> anyhow::Result<()> {
    let dataset = Dataset::load(&config.dataset, &config)?;
    info!(
        train = dataset.split(Split::Train).len(),
        validation = dataset.split(Split::Validation).len(),
        test = dataset.split(Split::Test).len(),
        "dataset loaded"
    );
    let mut trainer = Trainer::new(config, Device::cuda_if_available(0)?)?;
    let state = trainer.resume()?;
    let state = trainer.training_phase(state, &dataset)?;
    info!(step = state.step, epoch = state.epoch, "training finished");
    print_reports(&trainer.evaluation_phase(&dataset)?);
    Ok(())
}

fn print_reports(reports: &[EvaluationReport]) {
    for report in reports {
        println!("[{}] examples={}", report.split.name(), report.examples);
        for (name, value) in &report.metrics {
            println!("  {name:<18} {value:.5}");
        }
    }
}

fn evaluate(config: TrainConfig) -> anyhow::Result<()> {
    let dataset = Dataset::load(&config.dataset, &config)?;
    let checkpoint = config.checkpoint_path();
    let mut trainer = Trainer::new(config, Device::cuda_if_available(0)?)?;
    if checkpoint.exists() {
        load_parameters(trainer.varmap_mut(), &checkpoint)?;
    } else {
        warn!(path = %checkpoint.display(), "no checkpoint; evaluating freshly initialized parameters");
    }
    print_reports(&trainer.evaluation_phase(&dataset)?);
    Ok(())
}

fn sample(
    config: TrainConfig,
    count: usize,
    out_dir: &std::path::Path,
    densities: Option<(f32, f32)>,
) -> anyhow::Result<()> {
    let dataset = Dataset::load(&config.dataset, &config)?;
    let test = dataset.split(Split::Test);
    if test.is_empty() {
        bail!("test split is empty; nothing to condition samples on");
    }
    let count = count.min(test.len());
    let indices: Vec<usize> = (0..count).collect();
    let steps = config.time_step;
    let seed = config.seed;
    let is_fader = config.variant == Variant::Fader;
    let checkpoint = config.checkpoint_path();

    let mut trainer = Trainer::new(config, Device::cuda_if_available(0)?)?;
    load_parameters(trainer.varmap_mut(), &checkpoint)?;
    let device = trainer.device().clone();
    let batch = dataset.batch(Split::Test, &indices, &device)?;

    let conditioning = match densities {
        Some((rhythm, note)) if is_fader => {
            Tensor::from_vec([rhythm, note].repeat(count), (count, 2), &device)?
        }
        Some(_) => {
            warn!("density overrides only apply to the fader variant; using example conditioning");
            trainer.model().conditioning(&batch)?
        }
        None => trainer.model().conditioning(&batch)?,
    };

    let mut rng = TrainRng::new(seed).fork(0x5a3b);
    let rows = trainer.sample(conditioning, steps, &mut rng)?;
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    for (i, tokens) in rows.iter().enumerate() {
        let path = out_dir.join(format!("sample_{i:03}.mid"));
        match decode_performance(clean_tokens(tokens)) {
            Ok(notes) => {
                write_midi(&notes, &path)?;
                info!(path = %path.display(), notes = notes.len(), "wrote sample");
            }
            Err(e) => warn!(sample = i, "sample not decodable: {e}"),
        }
    }
    Ok(())
}

fn prepare(config: &TrainConfig, midi_dir: &std::path::Path) -> anyhow::Result<()> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(midi_dir)
        .with_context(|| format!("reading {}", midi_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("mid") || e.eq_ignore_ascii_case("midi"))
        })
        .collect();
    paths.sort();

    let mut examples: Vec<Example> = Vec::new();
    for path in &paths {
        match read_midi(path) {
            Ok(notes) => {
                let before = examples.len();
                examples.extend(prepare_examples(&notes, config.time_step, config.rhythm_steps));
                info!(path = %path.display(), examples = examples.len() - before, "prepared");
            }
            Err(e) => warn!(path = %path.display(), "skipping unreadable midi: {e}"),
        }
    }
    if examples.is_empty() {
        bail!("no usable examples in {}", midi_dir.display());
    }
    Dataset::save(&examples, &config.dataset)?;
    info!(path = %config.dataset.display(), count = examples.len(), "dataset written");
    Ok(())
}
