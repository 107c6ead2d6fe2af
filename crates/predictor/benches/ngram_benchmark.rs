use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use lmshim_predictor::sampling::banned_ngram_tokens;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Token history over a small vocabulary so n-grams actually repeat
fn history(len: usize) -> Vec<u32> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..len).map(|_| rng.gen_range(0..64)).collect()
}

fn bench_banned_ngrams(c: &mut Criterion) {
    let mut group = c.benchmark_group("banned_ngram_tokens");

    for len in [256, 1024, 4096] {
        let tokens = history(len);
        for ngram_size in [2, 5] {
            group.bench_with_input(
                BenchmarkId::new(format!("n{}", ngram_size), len),
                &tokens,
                |b, tokens| b.iter(|| banned_ngram_tokens(black_box(tokens), ngram_size)),
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_banned_ngrams);
criterion_main!(benches);
