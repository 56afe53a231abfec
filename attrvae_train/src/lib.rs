// Attribute-regularized music VAE trainer.
//
// Trains a sequence VAE over performance-event tokens whose latent space has
// one subspace per musical attribute (rhythm density, note density) plus a
// conditioning vector. Past a warm-up, the decoder's sensitivity to a small
// perturbation of each attribute subspace is estimated by central finite
// differences and scored under a standard-normal prior. A fader variant
// replaces the attribute subspaces with adversarial density predictors.
//
// Architecture:
// - config.rs: JSON run configuration, defaults, validation, output paths
// - error.rs: `TrainError` and the crate `Result`
// - dataset.rs: JSONL examples, deterministic splits, batching to tensors,
//   and MIDI-to-example preparation
// - latent.rs: subspace layout and `LatentCode` (per-subspace parts plus
//   conditioning, perturbation along one coordinate, prior sampling)
// - gru.rs / layers.rs: GRU cell, encoders, stream decoders, global decoder
// - model.rs: the `AttributeModel` trait, forward outputs, model selection
// - vae.rs / fader.rs: the two model variants
// - attribute.rs: exact (argmax + host measurement) and soft
//   (differentiable) attribute extractors behind one trait
// - sensitivity.rs: finite-difference sensitivity estimator
// - regularizer.rs: standard-normal NLL on sensitivity estimates
// - loss.rs: reconstruction, KL and auxiliary-head losses
// - metrics.rs: accuracies, linear probe R^2, JSONL epoch log
// - checkpoint.rs: safetensors checkpoints and the counter sidecar
// - trainer.rs: training step, clipping, training and evaluation phases
//
// Given its starting parameters, a run is deterministic in the config seed:
// every random draw after initialization comes from one `TrainRng` stream
// that is checkpointed alongside the step counter.

pub mod attribute;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod fader;
pub mod gru;
pub mod latent;
pub mod layers;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod regularizer;
pub mod sensitivity;
pub mod trainer;
pub mod vae;
