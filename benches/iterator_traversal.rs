use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use voxbox::{Point3, Region, Volume};

fn criterion_benchmark(c: &mut Criterion) {
    env_logger::init();

    let mut group = c.benchmark_group("iterator_traversal");
    group.sample_size(20);
    group.warm_up_time(Duration::from_secs(1));

    group.bench_function("full-volume row-major traversal with self-peek", |bencher| {
        let mut volume = Volume::<u16>::new(128, 16, 64).unwrap();
        let region = Region::new(Point3::new(0, 0, 0), Point3::new(127, 127, 127));
        bencher.iter(|| {
            let mut iter = volume.iter_region(region).unwrap();
            let mut acc = 0u64;
            loop {
                acc = acc.wrapping_add(iter.peek(0, 0, 0) as u64);
                iter.move_forward_in_region();
                if !iter.is_valid_for_region() {
                    break;
                }
            }
            acc
        });
    });

    group.bench_function("26-neighbour peek at every position", |bencher| {
        let mut volume = Volume::<u16>::new(64, 16, 64).unwrap();
        let region = Region::new(Point3::new(1, 1, 1), Point3::new(62, 62, 62));
        bencher.iter(|| {
            let mut iter = volume.iter_region(region).unwrap();
            let mut acc = 0u64;
            loop {
                for dz in -1i32..=1 {
                    for dy in -1i32..=1 {
                        for dx in -1i32..=1 {
                            acc = acc.wrapping_add(iter.peek(dx, dy, dz) as u64);
                        }
                    }
                }
                iter.move_forward_in_region();
                if !iter.is_valid_for_region() {
                    break;
                }
            }
            acc
        });
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
