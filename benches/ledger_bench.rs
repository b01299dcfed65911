use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fastq_handler::ledger::Ledger;

const DIRS: usize = 24;
const FILES_PER_DIR: usize = 400;

fn build_ledger() -> Ledger {
    let mut ledger = Ledger::new();
    for d in 0..DIRS {
        let dir = format!("/data/fastq_pass/barcode{:02}", d);
        for f in 0..FILES_PER_DIR {
            let merged = format!("/out/barcode{:02}/merged_files/barcode{:02}_00-{:04}.fastq.gz", d, d, f);
            ledger
                .record(&format!("FAR_pass_{}.fastq.gz", f), &dir, f as f64, &merged)
                .unwrap();
        }
    }
    ledger
}

fn bench_exists(c: &mut Criterion) {
    let ledger = build_ledger();
    c.bench_function("ledger_exists_hit", |b| {
        b.iter(|| ledger.exists(black_box("FAR_pass_399.fastq.gz"), black_box("/data/fastq_pass/barcode23")))
    });
    c.bench_function("ledger_exists_miss", |b| {
        b.iter(|| ledger.exists(black_box("FAR_pass_400.fastq.gz"), black_box("/data/fastq_pass/barcode23")))
    });
}

fn bench_naming_queries(c: &mut Criterion) {
    let ledger = build_ledger();
    c.bench_function("ledger_last_merged", |b| {
        b.iter(|| ledger.last_merged(black_box("/data/fastq_pass/barcode00")))
    });
    c.bench_function("ledger_next_barcode", |b| {
        b.iter(|| ledger.next_barcode(black_box("/data/fastq_pass/barcode12")))
    });
}

fn bench_flush_and_load(c: &mut Criterion) {
    let ledger = build_ledger();
    let temp_dir = tempfile::tempdir().unwrap();
    c.bench_function("ledger_flush", |b| b.iter(|| ledger.flush(temp_dir.path()).unwrap()));
    c.bench_function("ledger_load", |b| b.iter(|| Ledger::load(temp_dir.path()).unwrap()));
}

criterion_group!(benches, bench_exists, bench_naming_queries, bench_flush_and_load);
criterion_main!(benches);
