use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ftpsync_lib::config::{Protocol, ServerId};
use ftpsync_lib::storage::FileInfo;
use ftpsync_lib::vfs::VfsTree;

fn server() -> ServerId {
    ServerId {
        protocol: Protocol::Ftp,
        user: "bench".to_string(),
        host: "localhost".to_string(),
        port: 21,
    }
}

fn listing(n: usize, size: u64) -> Vec<FileInfo> {
    (0..n)
        .map(|i| FileInfo::file(format!("file_{i:05}.html"), size, 1_700_000_000_000 + i as i64))
        .collect()
}

fn bench_refresh(c: &mut Criterion) {
    let mut group = c.benchmark_group("vfs_refresh");

    for size in [10, 100, 1000] {
        let first = listing(size, 100);
        let changed = listing(size, 200);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("unchanged", size), &size, |b, _| {
            let mut tree = VfsTree::new(server());
            let root = tree.root();
            tree.refresh(root, &first);
            b.iter(|| tree.refresh(black_box(root), black_box(&first)));
        });

        group.bench_with_input(BenchmarkId::new("size_changed", size), &size, |b, _| {
            b.iter(|| {
                let mut tree = VfsTree::new(server());
                let root = tree.root();
                tree.refresh(root, &first);
                tree.refresh(root, black_box(&changed));
                black_box(tree.len())
            });
        });
    }
    group.finish();
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("vfs_serialize");

    for dirs in [10, 50] {
        let mut tree = VfsTree::new(server());
        for d in 0..dirs {
            if let Some(dir) = tree.get_directory(&format!("/site/dir_{d:03}"), true) {
                tree.refresh(dir, &listing(50, 1024));
            }
        }
        let value = tree.serialize();

        group.bench_with_input(BenchmarkId::new("serialize", dirs), &dirs, |b, _| {
            b.iter(|| black_box(tree.serialize()));
        });
        group.bench_with_input(BenchmarkId::new("deserialize", dirs), &dirs, |b, _| {
            b.iter(|| VfsTree::deserialize(server(), black_box(&value), 1000).map(|t| t.len()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_refresh, bench_serialize);
criterion_main!(benches);
