use criterion::{black_box, criterion_group, criterion_main, Criterion};
use self_iterate::config::Config;
use self_iterate::diff::DiffGenerator;
use self_iterate::session::{Pipeline, ProposeRequest};
use self_iterate::verify::SyntaxVerifier;

fn synthetic_module(functions: usize, variant: usize) -> String {
    let mut out = String::from("import json\n\n");
    for i in 0..functions {
        let body = if i % 17 == variant % 17 {
            format!("    return json.dumps({{'v': {}}})\n", i * 2)
        } else {
            format!("    return {}\n", i)
        };
        out.push_str(&format!("def handler_{:04}(payload):\n{}\n\n", i, body));
    }
    out
}

fn bench_diff(c: &mut Criterion) {
    let original = synthetic_module(2_000, 0);
    let modified = synthetic_module(2_000, 5);
    let differ = DiffGenerator::default();

    c.bench_function("diff_unified_8k_lines", |b| {
        b.iter(|| {
            let diff = differ.diff(
                black_box(&original),
                black_box(&modified),
                "a/src/handlers.py",
                "b/src/handlers.py",
            );
            black_box(diff.len());
        });
    });

    c.bench_function("diff_stats_8k_lines", |b| {
        b.iter(|| black_box(differ.stats(black_box(&original), black_box(&modified))));
    });
}

fn bench_verify(c: &mut Criterion) {
    let source = synthetic_module(2_000, 3);
    let verifier = SyntaxVerifier::new();

    c.bench_function("verify_python_8k_lines", |b| {
        b.iter(|| {
            let report = verifier.verify(black_box(&source), "src/handlers.py");
            black_box(report.passed);
        });
    });
}

fn bench_propose_reject(c: &mut Criterion) {
    let temp = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(temp.path().join("src")).expect("create src");
    std::fs::write(temp.path().join("src/handlers.py"), synthetic_module(500, 0))
        .expect("write synthetic source");
    let content = synthetic_module(500, 7);
    let mut pipeline = Pipeline::open(temp.path(), Config::default()).expect("open pipeline");

    c.bench_function("propose_then_reject_2k_lines", |b| {
        b.iter(|| {
            let outcome = pipeline
                .propose(ProposeRequest {
                    iteration: None,
                    requester: "bench".to_string(),
                    description: "bench".to_string(),
                    target: "src/handlers.py".to_string(),
                    content: content.clone(),
                })
                .expect("propose should succeed");
            black_box(outcome.stats.total_changes());
            pipeline.reject("bench").expect("reject should succeed");
        });
    });
}

criterion_group!(perf_core, bench_diff, bench_verify, bench_propose_reject);
criterion_main!(perf_core);
