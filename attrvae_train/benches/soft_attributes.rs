// Soft vs exact attribute extraction over decoder-sized logits.
//
// The soft extractor runs once per attribute per regularized step on both
// perturbed rollouts, so its cost scales with batch * rollout length * vocab.

use attrvae_music::attributes::AttributeKind;
use attrvae_music::vocab::EVENT_DIMS;
use attrvae_prng::TrainRng;
use attrvae_train::attribute::{AttributeExtractor, ExactExtractor, SoftExtractor};
use candle_core::{Device, Tensor};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

fn random_logits(batch: usize, steps: usize, seed: u64) -> Tensor {
    let mut rng = TrainRng::new(seed);
    let data = rng.gaussian_vec(batch * steps * EVENT_DIMS);
    match Tensor::from_vec(data, (batch, steps, EVENT_DIMS), &Device::Cpu) {
        Ok(t) => t,
        Err(e) => panic!("logits: {e}"),
    }
}

fn bench_extractors(c: &mut Criterion) {
    let soft = SoftExtractor::default();
    let exact = ExactExtractor;
    let mut group = c.benchmark_group("attribute_extraction");
    for &(batch, steps) in &[(16usize, 100usize), (64, 100)] {
        let logits = random_logits(batch, steps, batch as u64);
        for kind in AttributeKind::ALL {
            let label = format!("{}_{batch}x{steps}", kind.name());
            group.bench_with_input(BenchmarkId::new("soft", &label), &logits, |b, logits| {
                b.iter(|| black_box(soft.extract(logits, kind)))
            });
            group.bench_with_input(BenchmarkId::new("exact", &label), &logits, |b, logits| {
                b.iter(|| black_box(exact.extract(logits, kind)))
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_extractors);
criterion_main!(benches);
