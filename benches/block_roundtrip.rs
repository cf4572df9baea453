use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use voxbox::Block;

fn criterion_benchmark(c: &mut Criterion) {
    env_logger::init(); // run with RUST_LOG=trace for compress/uncompress tracing

    let mut group = c.benchmark_group("block_roundtrip");
    group.sample_size(30);
    group.warm_up_time(Duration::from_secs(1));

    for &bs in &[16u32, 32, 64] {
        let mut block = Block::<u16>::new(bs).unwrap();
        block.uncompress();
        for i in 0..block.voxel_count() {
            let x = (i as u32) % bs;
            let y = ((i as u32) / bs) % bs;
            let z = (i as u32) / (bs * bs);
            block.set_voxel(x, y, z, (i % 7) as u16);
        }

        group.bench_function(format!("compress bs={bs}"), |bencher| {
            bencher.iter(|| {
                block.uncompress();
                block.set_voxel(0, 0, 0, 1);
                block.compress();
            });
        });

        block.uncompress();
        group.bench_function(format!("uncompress bs={bs}"), |bencher| {
            bencher.iter(|| {
                block.compress();
                block.uncompress();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
