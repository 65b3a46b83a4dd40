//! Benchmarks for archive-bundler
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::HashSet;

use archive_bundler::builder::{relativize, unique_entry_name};
use archive_bundler::job::ArchiveType;
use archive_bundler::partition::{
    normalize_entry_path, ArchiveNaming, ArchivePartitioner, PartitionConfig, ValidatedFile,
};

fn files(count: usize) -> Vec<ValidatedFile> {
    (0..count)
        .map(|i| {
            // Mix of small files and the occasional large one
            let size = if i % 97 == 0 { 200 << 20 } else { (i as u64 % 4096 + 1) * 1024 };
            ValidatedFile::new(format!("/data/projects/p{}/dir{}/file{}.dat", i % 13, i % 101, i), size)
        })
        .collect()
}

fn benchmark_partition(c: &mut Criterion) {
    let partitioner = ArchivePartitioner::new(PartitionConfig {
        path_exclusions: vec!["/data/projects".to_string()],
        naming: ArchiveNaming::new("/archives"),
        ..Default::default()
    });

    let mut group = c.benchmark_group("partition");
    for count in [1_000usize, 10_000, 100_000] {
        let input = files(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &input, |b, input| {
            b.iter(|| {
                let job = partitioner.partition(black_box(input), 100, ArchiveType::Zip);
                black_box(job.num_archives)
            })
        });
    }
    group.finish();
}

fn benchmark_entry_paths(c: &mut Criterion) {
    let exclusions = vec!["/data/projects".to_string(), "/scratch".to_string()];
    let source = std::path::Path::new("/data/projects/p1/dir2/file3.dat");

    c.bench_function("normalize_entry_path", |b| {
        b.iter(|| {
            normalize_entry_path(
                black_box("/data/projects/p1/dir2/file3.dat"),
                &exclusions,
                source,
            )
        })
    });

    c.bench_function("relativize", |b| {
        let base = std::path::Path::new("/data/projects");
        b.iter(|| relativize(black_box(source), base))
    });

    c.bench_function("unique_entry_name_repeats", |b| {
        b.iter(|| {
            let mut seen = HashSet::new();
            for _ in 0..64 {
                black_box(unique_entry_name("dir/report.csv", &mut seen));
            }
        })
    });
}

criterion_group!(benches, benchmark_partition, benchmark_entry_paths);
criterion_main!(benches);
