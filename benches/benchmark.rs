use criterion::{criterion_group, criterion_main, Criterion};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use rectune::data::{Interaction, InteractionMatrix};
use rectune::evaluation::{Evaluator, EvaluatorConfig};
use rectune::split::rowwise_split;
use rectune::ScoreMatrix;

const NUM_USERS: usize = 2_000;
const NUM_ITEMS: usize = 1_000;

fn synthetic(num_interactions: usize) -> InteractionMatrix {
    let mut rng = XorShiftRng::seed_from_u64(42);
    let interactions = (0..num_interactions).map(|_| {
        // Skew towards low item ids so popularity is uneven.
        let item = (rng.gen::<f64>().powi(2) * NUM_ITEMS as f64) as usize;
        Interaction::new(rng.gen_range(0..NUM_USERS), item.min(NUM_ITEMS - 1), 1.0)
    });

    InteractionMatrix::from_triplets(NUM_USERS, NUM_ITEMS, interactions).unwrap()
}

fn bench_split(c: &mut Criterion) {
    let data = synthetic(100_000);

    c.bench_function("rowwise_split", |b| {
        b.iter(|| rowwise_split(&data, 0.2, 7).unwrap())
    });
}

fn bench_evaluate(c: &mut Criterion) {
    let (_, test) = rowwise_split(&synthetic(100_000), 0.2, 7).unwrap();
    let mut rng = XorShiftRng::seed_from_u64(1);
    let scores = ScoreMatrix::from_shape_fn((NUM_USERS, NUM_ITEMS), |_| rng.gen());

    for n_threads in [1, 4] {
        let evaluator = Evaluator::new(
            test.clone(),
            0,
            EvaluatorConfig {
                n_threads,
                ..EvaluatorConfig::default()
            },
        )
        .unwrap();

        c.bench_function(&format!("evaluate_scores_{}_threads", n_threads), |b| {
            b.iter(|| {
                evaluator
                    .evaluate_scores(scores.view(), evaluator.cutoffs())
                    .unwrap()
            })
        });
    }
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10);
    targets = bench_split, bench_evaluate
}
criterion_main!(benches);
