use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use pourover::Relocation;
use pourover::elf::parse_dynamic;
use pourover::rewrite::replace_in_binary;
use std::path::Path;

const PREFIX: &str = "/home/linuxbrew/.linuxbrew";

fn placeholder_relocation() -> Relocation {
    let mut relocation = Relocation::new();
    relocation.add_replacement_pair("prefix", PREFIX, "@@HOMEBREW_PREFIX@@", true);
    relocation.add_replacement_pair(
        "cellar",
        &format!("{PREFIX}/Cellar"),
        "@@HOMEBREW_CELLAR@@",
        true,
    );
    relocation.add_replacement_pair(
        "library",
        &format!("{PREFIX}/Library"),
        "@@HOMEBREW_LIBRARY@@",
        true,
    );
    relocation
}

/// A pkg-config/libtool-like file: mostly prose with a path every few lines.
fn sample_text(lines: usize) -> String {
    (0..lines)
        .map(|i| match i % 4 {
            0 => format!("libdir={PREFIX}/Cellar/tool/1.0/lib\n"),
            1 => format!("Cflags: -I{PREFIX}/include -I{PREFIX}/opt/zlib/include\n"),
            2 => format!("# {PREFIX}-extra is a different directory\n"),
            _ => "Description: nothing to relocate on this line\n".to_string(),
        })
        .collect()
}

fn bench_replace_text(c: &mut Criterion) {
    let relocation = placeholder_relocation();
    let mut group = c.benchmark_group("replace_text");

    for lines in [16, 256, 4096] {
        let text = sample_text(lines);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &text, |b, text| {
            b.iter(|| relocation.replace_text(black_box(text)))
        });
    }

    group.finish();
}

fn bench_replace_in_binary(c: &mut Criterion) {
    let mut data = vec![0u8; 64 * 1024];
    for chunk in data.chunks_mut(4096) {
        let path = format!("{PREFIX}/lib/libz.so.1");
        chunk[1..1 + path.len()].copy_from_slice(path.as_bytes());
    }

    c.bench_function("replace_in_binary 64K", |b| {
        b.iter(|| {
            replace_in_binary(
                Path::new("bench.so"),
                black_box(&data),
                PREFIX,
                "/opt/pour",
            )
        })
    });
}

fn bench_parse_dynamic_rejects_garbage(c: &mut Criterion) {
    let data = vec![0xABu8; 4096];
    c.bench_function("parse_dynamic garbage", |b| {
        b.iter(|| parse_dynamic(black_box(&data)).is_err())
    });
}

criterion_group!(
    benches,
    bench_replace_text,
    bench_replace_in_binary,
    bench_parse_dynamic_rejects_garbage
);
criterion_main!(benches);
