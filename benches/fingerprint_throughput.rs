//! Fingerprint throughput benchmark
//!
//! Fingerprinting runs on every dataset an analysis touches, and again on
//! every verification, so it has to keep up with realistic data-frame sizes.
//!
//! # Run Instructions
//!
//! ```bash
//! cargo bench --bench fingerprint_throughput
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use reprobundle::dataset::{Column, Dataset, Layout, Matrix};
use reprobundle::fingerprint::fingerprint;

fn table(rows: usize) -> Dataset {
    Dataset::table(vec![
        Column::float("score", (0..rows).map(|i| i as f64 * 0.25).collect()),
        Column::int("age", (0..rows).map(|i| (i % 90) as i64).collect()),
        Column::text(
            "arm",
            (0..rows)
                .map(|i| if i % 2 == 0 { "control" } else { "treatment" })
                .collect(),
        ),
    ])
    .unwrap()
}

fn bench_table(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint_table");
    for rows in [1_000usize, 10_000, 100_000] {
        let data = table(rows);
        group.throughput(Throughput::Elements(data.cell_count() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &data, |b, data| {
            b.iter(|| fingerprint(black_box(data)).unwrap())
        });
    }
    group.finish();
}

fn bench_matrix_layouts(c: &mut Criterion) {
    let shape = vec![300, 300];
    let values: Vec<f64> = (0..90_000).map(|i| (i as f64).sin()).collect();
    let mut group = c.benchmark_group("fingerprint_matrix");
    for layout in [Layout::RowMajor, Layout::ColumnMajor] {
        let data = Dataset::Matrix(Matrix::new(shape.clone(), values.clone(), layout).unwrap());
        group.throughput(Throughput::Elements(90_000));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", layout)),
            &data,
            |b, data| b.iter(|| fingerprint(black_box(data)).unwrap()),
        );
    }
    group.finish();
}

criterion_group!(benches, bench_table, bench_matrix_layouts);
criterion_main!(benches);
