use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rtorch_optim::optim::{AdaFactor, AdaFactorConfig, Lars, LarsConfig, Nero, NeroConfig, Optimizer};
use rtorch_optim::tensor::{rand_uniform, Tensor};

const SHAPE: [usize; 2] = [256, 512];

fn param_with_grad() -> Tensor {
    let p = rand_uniform(&SHAPE, -0.1, 0.1, true);
    p.set_dense_grad(rand_uniform(&SHAPE, -1.0, 1.0, false).data_clone()).unwrap();
    p
}

fn step_benchmark(c: &mut Criterion) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut group = c.benchmark_group("step_256x512");

    group.bench_function("adafactor", |b| {
        let p = param_with_grad();
        let mut opt = AdaFactor::new(vec![p], AdaFactorConfig::default()).unwrap();
        b.iter(|| black_box(opt.step(None).unwrap()));
    });

    group.bench_function("adafactor_ams_bound", |b| {
        let p = param_with_grad();
        let mut opt = AdaFactor::new(vec![p], AdaFactorConfig::default().ams_bound(true)).unwrap();
        b.iter(|| black_box(opt.step(None).unwrap()));
    });

    group.bench_function("lars", |b| {
        let p = param_with_grad();
        let mut opt = Lars::new(vec![p], LarsConfig::default().weight_decay(1e-4)).unwrap();
        b.iter(|| black_box(opt.step(None).unwrap()));
    });

    group.bench_function("nero", |b| {
        let p = param_with_grad();
        let mut opt = Nero::new(vec![p], NeroConfig::default()).unwrap();
        b.iter(|| black_box(opt.step(None).unwrap()));
    });

    group.finish();
}

criterion_group!(benches, step_benchmark);
criterion_main!(benches);
