use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use wispmap::WispMap;

const ITER: u64 = 4 * 1024;

fn fan_out(threads: usize, work: impl Fn(u64) + Sync) {
    let chunk = (ITER + threads as u64 - 1) / threads as u64;
    thread::scope(|scope| {
        for t in 0..threads as u64 {
            let work = &work;
            scope.spawn(move || {
                let start = t * chunk;
                for i in start..(start + chunk).min(ITER) {
                    work(i);
                }
            });
        }
    });
}

fn task_insert_u64_u64(threads: usize) -> WispMap<u64, u64> {
    let map = WispMap::with_capacity(ITER as usize);
    fan_out(threads, |i| {
        map.insert(i, i + 7);
    });
    map
}

fn insert_wispmap_u64_u64(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_wispmap_u64_u64");
    group.throughput(Throughput::Elements(ITER));
    let max = num_cpus::get();

    for threads in 1..=max {
        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| task_insert_u64_u64(threads));
            },
        );
    }

    group.finish();
}

fn task_get_u64_u64(map: &WispMap<u64, u64>, threads: usize) {
    fan_out(threads, |i| {
        assert_eq!(*map.get(&i).unwrap(), i + 7);
    });
}

fn get_wispmap_u64_u64(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_wispmap_u64_u64");
    group.throughput(Throughput::Elements(ITER));
    let max = num_cpus::get();

    for threads in 1..=max {
        let map = task_insert_u64_u64(threads);

        group.bench_with_input(
            BenchmarkId::from_parameter(threads),
            &threads,
            |b, &threads| {
                b.iter(|| task_get_u64_u64(&map, threads));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, insert_wispmap_u64_u64, get_wispmap_u64_u64);
criterion_main!(benches);
