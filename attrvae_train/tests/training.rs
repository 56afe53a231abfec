// End-to-end tests for the training pipeline.
//
// Every test builds a tiny model (8 hidden units, 4-dim subspaces, 12-event
// sequences) over synthetic examples drawn from a seeded `TrainRng`, and
// drives it through the same `Trainer` entry points the CLI uses. Output
// files go to a per-test directory under the system temp dir.

use attrvae_music::vocab::{EVENT_DIMS, NOTE_DIMS, PAD, RHYTHM_DIMS};
use attrvae_prng::TrainRng;
use attrvae_train::checkpoint::{load_counters, load_parameters, save_parameters};
use attrvae_train::config::{Strategy, TrainConfig, Variant};
use attrvae_train::dataset::{Batch, CLASS_DIMS, Dataset, Example, Split};
use attrvae_train::metrics::EpochRecord;
use attrvae_train::model::ForwardMode;
use attrvae_train::trainer::{Phase, Trainer};
use candle_core::Device;
use std::path::PathBuf;

const TIME_STEP: usize = 12;
const RHYTHM_STEPS: usize = 4;
const COND_DIM: usize = 24;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("attrvae_it_{}_{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn tiny_config(dir: &std::path::Path, variant: Variant, strategy: Strategy) -> TrainConfig {
    TrainConfig {
        name: "tiny".into(),
        hidden_dim: 8,
        z_dim: 4,
        time_step: TIME_STEP,
        batch_size: 4,
        n_epochs: 1,
        variant,
        strategy,
        warmup_steps: 1,
        rollout_steps: 6,
        anneal_steps: 10,
        rhythm_steps: RHYTHM_STEPS,
        cond_dim: COND_DIM,
        dataset: dir.join("dataset.jsonl"),
        params_dir: dir.join("params"),
        log_dir: dir.join("log"),
        ..Default::default()
    }
}

fn synthetic_examples(n: usize, seed: u64) -> Vec<Example> {
    let mut rng = TrainRng::new(seed);
    (0..n)
        .map(|_| {
            let len = rng.range_usize(3, TIME_STEP + 1);
            let mut events: Vec<u32> =
                (0..len).map(|_| rng.range_u64(2, EVENT_DIMS as u64) as u32).collect();
            events.resize(TIME_STEP, PAD);
            let rhythm_density = rng.next_f32();
            let note_density = rng.range_f32(0.0, 3.0);
            Example {
                events,
                rhythm: (0..RHYTHM_STEPS).map(|_| rng.range_u64(0, RHYTHM_DIMS as u64) as u32).collect(),
                note: (0..RHYTHM_STEPS).map(|_| rng.range_u64(0, NOTE_DIMS as u64) as u32).collect(),
                chroma: (0..COND_DIM).map(|_| rng.next_f32()).collect(),
                rhythm_class: rng.range_u64(0, CLASS_DIMS as u64) as u32,
                note_class: rng.range_u64(0, CLASS_DIMS as u64) as u32,
                rhythm_density,
                note_density,
            }
        })
        .collect()
}

fn batch_of(examples: &[Example]) -> Batch {
    let refs: Vec<&Example> = examples.iter().collect();
    Batch::from_examples(&refs, &Device::Cpu).unwrap()
}

// ---------------------------------------------------------------------------
// Phase gating
// ---------------------------------------------------------------------------

#[test]
fn regularization_is_off_during_warmup_and_on_after() {
    let dir = scratch_dir("warmup");
    let trainer = Trainer::new(tiny_config(&dir, Variant::Glsr, Strategy::Soft), Device::Cpu).unwrap();
    let batch = batch_of(&synthetic_examples(4, 1));
    let mut state = trainer.initial_state().unwrap();

    // warmup_steps = 1: steps 0 and 1 are warm-up, step 2 is regularized.
    for expected in [Phase::Warmup, Phase::Warmup, Phase::Regularized] {
        assert_eq!(Phase::at(state.step, 1), expected);
        let (next, report) = trainer.train_step(state, &batch).unwrap();
        state = next;
        let reg = report.get("reg_rhythm").unwrap() + report.get("reg_note").unwrap();
        match expected {
            Phase::Warmup => assert_eq!(reg, 0.0),
            // NLL of a standard normal is at least 0.5 * ln(2 pi) per attribute.
            Phase::Regularized => assert!(reg >= 2.0 * 0.918, "reg = {reg}"),
        }
        assert!(report.get("loss").unwrap().is_finite());
        assert!(report.grad_norm.unwrap().is_finite());
    }
    assert_eq!(state.step, 3);
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn exact_strategy_trains_without_gradient_through_rollout() {
    let dir = scratch_dir("exact");
    let mut config = tiny_config(&dir, Variant::Glsr, Strategy::Exact);
    config.warmup_steps = 0;
    let trainer = Trainer::new(config, Device::Cpu).unwrap();
    let batch = batch_of(&synthetic_examples(4, 2));
    let state = trainer.initial_state().unwrap();
    // Step 0 is still warm-up (step <= warmup_steps).
    let (state, first) = trainer.train_step(state, &batch).unwrap();
    assert_eq!(first.get("reg_rhythm"), Some(0.0));
    assert_eq!(first.get("reg_note"), Some(0.0));
    let (state, second) = trainer.train_step(state, &batch).unwrap();
    assert_eq!(state.step, 2);
    assert!(second.get("loss").unwrap().is_finite());
    assert!(second.get("reg_rhythm").unwrap() >= 0.918);
    assert!(second.get("reg_note").unwrap() >= 0.918);
    std::fs::remove_dir_all(&dir).unwrap();
}

// ---------------------------------------------------------------------------
// Fader variant
// ---------------------------------------------------------------------------

#[test]
fn fader_reports_adversarial_terms_after_warmup() {
    let dir = scratch_dir("fader");
    let mut config = tiny_config(&dir, Variant::Fader, Strategy::Soft);
    config.warmup_steps = 0;
    let trainer = Trainer::new(config, Device::Cpu).unwrap();
    assert!(trainer.model().layout().attributes().is_empty());

    let batch = batch_of(&synthetic_examples(4, 3));
    let state = trainer.initial_state().unwrap();
    // Step 0 is still warm-up (step <= warmup_steps).
    let (state, first) = trainer.train_step(state, &batch).unwrap();
    assert_eq!(first.get("adv_rhythm"), Some(0.0));
    let (_, second) = trainer.train_step(state, &batch).unwrap();
    assert!(second.get("adv_rhythm").unwrap() >= 0.0);
    assert!(second.get("adv_note").unwrap() >= 0.0);
    assert_eq!(second.get("reg_rhythm"), None);
    std::fs::remove_dir_all(&dir).unwrap();
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

#[test]
fn checkpoint_round_trip_reproduces_mean_outputs() {
    let dir = scratch_dir("roundtrip");
    let config = tiny_config(&dir, Variant::Glsr, Strategy::Soft);
    let batch = batch_of(&synthetic_examples(4, 4));

    let trainer = Trainer::new(config.clone(), Device::Cpu).unwrap();
    let mut state = trainer.initial_state().unwrap();
    for _ in 0..2 {
        state = trainer.train_step(state, &batch).unwrap().0;
    }
    let path = config.checkpoint_path();
    save_parameters(trainer.varmap(), &path).unwrap();
    let expected = trainer.model().forward(&batch, ForwardMode::Mean).unwrap();

    let mut restored = Trainer::new(config, Device::Cpu).unwrap();
    load_parameters(restored.varmap_mut(), &path).unwrap();
    let actual = restored.model().forward(&batch, ForwardMode::Mean).unwrap();

    assert_eq!(
        expected.events.to_vec3::<f32>().unwrap(),
        actual.events.to_vec3::<f32>().unwrap()
    );
    assert_eq!(
        expected.latent.concat().unwrap().to_vec2::<f32>().unwrap(),
        actual.latent.concat().unwrap().to_vec2::<f32>().unwrap()
    );
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn training_phase_checkpoints_and_resumes_counters() {
    let dir = scratch_dir("phase");
    let config = tiny_config(&dir, Variant::Glsr, Strategy::Soft);
    Dataset::save(&synthetic_examples(20, 5), &config.dataset).unwrap();
    let dataset = Dataset::load(&config.dataset, &config).unwrap();

    let mut trainer = Trainer::new(config.clone(), Device::Cpu).unwrap();
    let state = trainer.resume().unwrap();
    assert_eq!(state.step, 0);
    let state = trainer.training_phase(state, &dataset).unwrap();
    // 16 training examples in batches of 4.
    assert_eq!(state.step, 4);
    assert_eq!(state.epoch, 1);

    assert!(config.checkpoint_path().exists());
    let counters = load_counters(&config.state_path()).unwrap().unwrap();
    assert_eq!(counters.step, 4);
    assert_eq!(counters.epoch, 1);

    let log = std::fs::read_to_string(config.metrics_path()).unwrap();
    let records: Vec<EpochRecord> = log.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].split, "train");
    assert_eq!(records[1].split, "val");
    assert!(records[0].metrics.contains_key("loss"));

    let snapshots = std::fs::read_dir(&config.params_dir)
        .unwrap()
        .filter(|e| {
            let name = e.as_ref().unwrap().file_name().to_string_lossy().into_owned();
            name.starts_with("tiny_") && name.ends_with(".safetensors")
        })
        .count();
    assert_eq!(snapshots, 1);

    let mut again = Trainer::new(config.clone(), Device::Cpu).unwrap();
    let resumed = again.resume().unwrap();
    assert_eq!(resumed.step, 4);
    assert_eq!(resumed.epoch, 1);
    assert_eq!(resumed.rng, counters.rng);

    let mut fresh_counter = config;
    fresh_counter.resume_counter = false;
    let mut third = Trainer::new(fresh_counter, Device::Cpu).unwrap();
    assert_eq!(third.resume().unwrap().step, 0);
    std::fs::remove_dir_all(&dir).unwrap();
}

// ---------------------------------------------------------------------------
// Evaluation and sampling
// ---------------------------------------------------------------------------

#[test]
fn evaluation_reports_accuracies_and_probes() {
    let dir = scratch_dir("eval");
    let mut config = tiny_config(&dir, Variant::Glsr, Strategy::Soft);
    config.is_class = true;
    config.is_res = true;
    let dataset = Dataset::new(synthetic_examples(20, 6));
    let trainer = Trainer::new(config, Device::Cpu).unwrap();

    let reports = trainer.evaluation_phase(&dataset).unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].split, Split::Train);
    assert_eq!(reports[0].examples, 16);
    assert_eq!(reports[1].split, Split::Test);
    assert_eq!(reports[1].examples, 2);
    for report in &reports {
        for key in ["acc_events", "acc_rhythm", "acc_note", "class_acc_rhythm", "class_acc_note"] {
            let v = report.metrics[key];
            assert!((0.0..=1.0).contains(&v), "{key} = {v}");
        }
        assert!(report.metrics.contains_key("probe_r2_rhythm"));
        assert!(report.metrics["reg_note"] >= 0.918);
        assert!(report.metrics.contains_key("class"));
        assert!(report.metrics.contains_key("res"));
    }
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn prior_samples_have_requested_length() {
    let dir = scratch_dir("sample");
    let config = tiny_config(&dir, Variant::Glsr, Strategy::Soft);
    let trainer = Trainer::new(config, Device::Cpu).unwrap();
    let batch = batch_of(&synthetic_examples(3, 7));
    let conditioning = trainer.model().conditioning(&batch).unwrap();

    let mut rng = TrainRng::new(11);
    let rows = trainer.sample(conditioning.clone(), 9, &mut rng).unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.len() == 9 && r.iter().all(|&t| (t as usize) < EVENT_DIMS)));

    let mut rng = TrainRng::new(11);
    assert_eq!(trainer.sample(conditioning, 9, &mut rng).unwrap(), rows);
    std::fs::remove_dir_all(&dir).unwrap();
}
