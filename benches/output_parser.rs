use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use warmc::output::{parse_compiler_output, split_daemon_log};

/// Benchmark parsing of the compiler channel at typical build sizes

fn compiler_output(messages: usize) -> String {
    let mut text = String::new();
    for i in 0..messages {
        match i % 4 {
            0 => text.push_str(&format!("ERROR: src/module{}/File.kt:{}:{}: unresolved reference: foo\n", i, i + 1, 5)),
            1 => text.push_str(&format!("WARNING: src/Util.kt:{}:1: parameter 'x' is never used\n", i)),
            2 => text.push_str("EXCEPTION: no location: java.lang.IllegalStateException\n\tat a.b.C.d(C.kt:10)\n\tat a.b.C.e(C.kt:20)\n"),
            _ => text.push_str(&format!("OUTPUT: no location: out/C{}.class <- src/C{}.kt, src/D.kt\n", i, i)),
        }
    }
    text
}

fn bench_parse_compiler_output(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_compiler_output");

    for messages in [10, 100, 1000] {
        let text = compiler_output(messages);
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(messages), &text, |b, text| {
            b.iter(|| black_box(parse_compiler_output(black_box(text))));
        });
    }

    group.finish();
}

fn bench_split_daemon_log(c: &mut Criterion) {
    let log: String = (0..500)
        .map(|i| format!("session {}: finished with exit code 0 in {} ms\n", i, i * 3))
        .collect();

    c.bench_function("split_daemon_log", |b| {
        b.iter(|| black_box(split_daemon_log(black_box(log.as_bytes()))));
    });
}

criterion_group!(benches, bench_parse_compiler_output, bench_split_daemon_log);
criterion_main!(benches);
