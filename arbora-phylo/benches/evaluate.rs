use arbora_phylo::config::{EngineConfig, IntervalConfig};
use arbora_phylo::model::{ModelLikelihood, TreeChange};
use arbora_phylo::providers::PoissonMutationProvider;
use arbora_phylo::{ArgCounter, IncrementalEvaluator, IntervalBuilder, TimeTree};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn random_counts(n: usize, seed: u64) -> Vec<u64> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            state >> 59
        })
        .collect()
}

fn poisson_evaluator(tree: &TimeTree) -> IncrementalEvaluator<PoissonMutationProvider> {
    let provider =
        PoissonMutationProvider::new(random_counts(tree.node_count(), 42), 1_000.0).unwrap();
    IncrementalEvaluator::new(Box::new(provider), EngineConfig::default()).unwrap()
}

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("evaluate");

    // 1024 tips, 2047 nodes
    let tree = TimeTree::balanced(10, 1.0);

    group.bench_function("full_2047_nodes", |b| {
        let mut evaluator = poisson_evaluator(&tree);
        b.iter(|| {
            evaluator.make_dirty();
            evaluator.evaluate(black_box(&tree)).unwrap()
        })
    });

    group.bench_function("single_leaf_proposal", |b| {
        let mut tree = tree.clone();
        let leaf = tree.leaves()[0];
        let mut evaluator = poisson_evaluator(&tree);
        evaluator.evaluate(&tree).unwrap();
        b.iter(|| {
            evaluator.store_state().unwrap();
            tree.set_height(leaf, 0.5).unwrap();
            evaluator.handle_tree_change(&tree, &TreeChange::NodeChanged(leaf));
            let proposed = evaluator.evaluate(black_box(&tree)).unwrap();
            tree.set_height(leaf, 0.0).unwrap();
            evaluator.restore_state().unwrap();
            proposed
        })
    });

    group.finish();
}

fn bench_intervals(c: &mut Criterion) {
    let mut group = c.benchmark_group("intervals");

    let tree = TimeTree::caterpillar(1_000, 0.1).unwrap();
    let mut builder = IntervalBuilder::new(IntervalConfig::default()).unwrap();

    group.bench_function("caterpillar_1k_tips", |b| {
        b.iter(|| builder.build(black_box(&tree)).unwrap())
    });

    group.finish();
}

fn bench_arg_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("arg_count");

    group.bench_function("precompute_100_taxa_20_recombinations", |b| {
        b.iter(|| {
            let mut counter = ArgCounter::new();
            counter.precompute(black_box(100), black_box(20)).unwrap();
            counter
        })
    });

    group.finish();
}

criterion_group!(benches, bench_evaluate, bench_intervals, bench_arg_count);
criterion_main!(benches);
