use criterion::{Criterion, criterion_group, criterion_main};
use revlm::config::{BlockKind, Config, OptimizerConfig};
use revlm::context::{Context, Mode};
use revlm::model::{self, TokenBatch};
use revlm::optim::{Optimizer, RootConfig, inverse_pth_root};
use revlm::tensor::Tensor;
use std::hint::black_box;

/// Symmetric positive definite `n x n` matrix with a spread spectrum.
fn statistic(n: usize) -> Tensor<f64> {
    let g = Tensor::<f64>::from_fn(&[n, n], |i| ((i * 7919) % 113) as f64 / 113.0 - 0.5);
    let gram = g.matmul(&g.transpose().unwrap()).unwrap();
    (&gram + &Tensor::<f64>::eye(n).scale(0.1)).unwrap()
}

fn benchmark_inverse_root(c: &mut Criterion) {
    let mut group = c.benchmark_group("inverse_pth_root");
    let iterative = RootConfig::from_optimizer(&OptimizerConfig::default());
    let eigh = RootConfig {
        iterations: 0,
        ..iterative
    };

    for &n in &[32, 64, 128] {
        let matrix = statistic(n);
        group.bench_function(format!("newton_{n}"), |b| {
            b.iter(|| inverse_pth_root(black_box(&matrix), 4, &iterative).unwrap())
        });
        group.bench_function(format!("eigh_{n}"), |b| {
            b.iter(|| inverse_pth_root(black_box(&matrix), 4, &eigh).unwrap())
        });
    }
    group.finish();
}

fn benchmark_update(c: &mut Criterion) {
    let mut config = Config::default();
    config.data.vocab_size = 16;
    config.dims.batch = 2;
    config.dims.sequence = 8;
    config.dims.heads = 4;
    config.dims.features_per_head = 8;
    config.dims.intermediate = 32;
    config.model.depth = 2;
    config.model.blocks = vec![BlockKind::Attention, BlockKind::FeedForward];
    config.optimizer.statistics_compute_steps = 1;

    let windows: Vec<usize> = (0..2 * 9).map(|i| i % 16).collect();
    let batch = TokenBatch::from_windows(&windows, 2, 8).unwrap();
    let optimizer = Optimizer::new(config.optimizer.clone());
    let mut init = Context::new(config, Mode::Init);
    model::init_params(&mut init, &batch).unwrap();
    optimizer.init_state(&init).unwrap();

    let mut ctx = Context::with_store(init.config_rc(), init.store_rc(), Mode::Compute);
    let grads = model::compute(&mut ctx, &batch).unwrap().grads;

    let mut group = c.benchmark_group("optimizer");
    group.sample_size(10);
    group.bench_function("update_2_layers", |b| {
        let mut step = 1;
        b.iter(|| {
            optimizer.update(black_box(&ctx), black_box(&grads), step).unwrap();
            step += 1;
        })
    });
    group.finish();
}

criterion_group!(benches, benchmark_inverse_root, benchmark_update);
criterion_main!(benches);
