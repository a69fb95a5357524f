use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::fs;
use std::ops::ControlFlow;
use std::path::Path;
use treedelta::archive::{ArchiveError, ArchiveHeader, ArchiveReader, ArchiveWriter, CompressionMode};
use treedelta::bsdiff;
use treedelta::command::{Command, CommandFlags, PathTable, Payload};
use treedelta::tree::{self, MajorVersion, TreeHash};

fn gen_data(size: usize, seed: u64) -> Vec<u8> {
    let mut s = seed;
    let mut out = Vec::with_capacity(size);
    for _ in 0..size {
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
        out.push((s >> 33) as u8);
    }
    out
}

fn mutate(base: &[u8], stride: usize) -> Vec<u8> {
    let mut out = base.to_vec();
    for i in (0..out.len()).step_by(stride.max(1)) {
        out[i] = out[i].wrapping_add(1);
    }
    out
}

fn write_payload_snapshot() {
    let old = gen_data(1024 * 1024, 123);
    let mut csv = String::from("stride,payload_bytes,new_bytes,ratio\n");
    for stride in [64usize, 256, 1024, 4096, 16384] {
        let new = mutate(&old, stride);
        let record = bsdiff::diff(&old, &new);
        let ratio = record.payload_size() as f64 / new.len() as f64;
        csv.push_str(&format!(
            "{stride},{},{},{}\n",
            record.payload_size(),
            new.len(),
            ratio
        ));
    }
    let out_dir = Path::new("target/criterion/custom_reports");
    let _ = fs::create_dir_all(out_dir);
    let _ = fs::write(out_dir.join("payload_snapshot.csv"), csv);
}

fn bench_diff_speed(c: &mut Criterion) {
    let mut g = c.benchmark_group("diff_speed_mb_s");
    g.sample_size(10);
    for size in [64 * 1024usize, 1024 * 1024, 4 * 1024 * 1024] {
        let old = gen_data(size, 1);
        let new = mutate(&old, 1024);
        g.throughput(Throughput::Bytes(size as u64));
        g.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let record = bsdiff::diff(black_box(&old), black_box(&new));
                black_box(record);
            });
        });
    }
    g.finish();
}

fn bench_patch_speed(c: &mut Criterion) {
    let mut g = c.benchmark_group("patch_speed_mb_s");
    for size in [64 * 1024usize, 1024 * 1024, 4 * 1024 * 1024] {
        let old = gen_data(size, 2);
        let new = mutate(&old, 2048);
        let record = bsdiff::diff(&old, &new);
        g.throughput(Throughput::Bytes(size as u64));
        g.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let out = record.apply(black_box(&old)).unwrap();
                black_box(out);
            });
        });
    }
    g.finish();
}

fn bench_payload_vs_stride(c: &mut Criterion) {
    write_payload_snapshot();
    let mut g = c.benchmark_group("payload_vs_stride");
    g.sample_size(10);
    let old = gen_data(512 * 1024, 3);
    for stride in [64usize, 1024, 16384] {
        let new = mutate(&old, stride);
        g.bench_with_input(BenchmarkId::from_parameter(stride), &stride, |b, _| {
            b.iter(|| {
                let record = bsdiff::diff(&old, &new);
                black_box(record.payload_size());
            });
        });
    }
    g.finish();
}

fn bench_archive_codec(c: &mut Criterion) {
    let mut g = c.benchmark_group("archive_codec");
    let blob = mutate(&gen_data(256 * 1024, 4).repeat(4), 512);
    let commands: Vec<Command> = (0..64)
        .map(|i| {
            Command::new(format!("data/file{i:03}.bin"), CommandFlags::EXTRACT)
                .with_mode(0o100644)
                .with_payload(Payload::Inline(blob[i * 8192..(i + 1) * 8192].to_vec()))
        })
        .collect();
    let table = PathTable::for_commands(&commands).unwrap();
    let total: u64 = commands
        .iter()
        .map(|c| match &c.payload {
            Payload::Inline(d) => d.len() as u64,
            _ => 0,
        })
        .sum();

    for mode in CompressionMode::ALL.into_iter().filter(|m| m.is_available()) {
        let mut header = ArchiveHeader::new(MajorVersion::V3, TreeHash::default(), TreeHash::default());
        header.compression = mode;
        header.level = mode.default_level().min(6);

        let encode = || {
            let mut w = ArchiveWriter::new(Vec::new(), &header, &table).unwrap();
            for cmd in &commands {
                w.write_command(cmd).unwrap();
            }
            w.finish().unwrap()
        };
        let encoded = encode();

        g.throughput(Throughput::Bytes(total));
        g.bench_function(BenchmarkId::new("encode", mode.name()), |b| {
            b.iter(|| black_box(encode()));
        });
        g.bench_function(BenchmarkId::new("decode", mode.name()), |b| {
            b.iter(|| {
                let mut sink = Vec::with_capacity(total as usize);
                ArchiveReader::new(black_box(&encoded[..]))
                    .unwrap()
                    .for_each_command(|item| -> Result<_, ArchiveError> {
                        item.copy_to(&mut sink)?;
                        Ok(ControlFlow::Continue(()))
                    })
                    .unwrap();
                black_box(sink.len());
            });
        });
    }
    g.finish();
}

fn bench_tree_hash(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..200 {
        let sub = dir.path().join(format!("d{}", i % 10));
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join(format!("f{i}.bin")), gen_data(16 * 1024, i)).unwrap();
    }
    let mut g = c.benchmark_group("tree_hash");
    g.throughput(Throughput::Bytes(200 * 16 * 1024));
    for version in [MajorVersion::V2, MajorVersion::V3] {
        g.bench_with_input(BenchmarkId::from_parameter(version), &version, |b, v| {
            b.iter(|| black_box(tree::hash_tree(dir.path(), *v).unwrap()));
        });
    }
    g.finish();
}

criterion_group!(
    benches,
    bench_diff_speed,
    bench_patch_speed,
    bench_payload_vs_stride,
    bench_archive_codec,
    bench_tree_hash
);
criterion_main!(benches);
