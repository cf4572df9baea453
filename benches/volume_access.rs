use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use rand::{thread_rng, Rng};
use voxbox::Volume;

fn criterion_benchmark(c: &mut Criterion) {
    env_logger::init();

    let mut group = c.benchmark_group("volume_access");
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(1));

    group.bench_function("random writes into a shared volume", |bencher| {
        let mut volume = Volume::<u16>::new(256, 16, 64).unwrap();
        let mut rng = thread_rng();
        bencher.iter(|| {
            let x = rng.gen_range(0..256);
            let y = rng.gen_range(0..256);
            let z = rng.gen_range(0..256);
            volume.set_voxel(x, y, z, 1).unwrap();
        });
    });

    group.bench_function("reads of a homogeneous volume", |bencher| {
        let mut volume = Volume::<u16>::new(256, 16, 64).unwrap();
        bencher.iter(|| {
            for z in (0..256).step_by(32) {
                for y in (0..256).step_by(32) {
                    for x in (0..256).step_by(32) {
                        let _ = volume.get_voxel(x, y, z).unwrap();
                    }
                }
            }
        });
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
