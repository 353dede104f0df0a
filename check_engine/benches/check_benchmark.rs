//! Criterion benchmarks for the compliance Check evaluation kernel.
//!
//! Benchmarks measure field-path extraction, sandbox predicate execution,
//! and end-to-end `Check::evaluate` over synthetic resource collections of
//! varying sizes (10, 100, 1000 resources).

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use compliance_check_engine::check::{Check, CheckMetadata, CheckOperation, FixDetails, OutputStatements};
use compliance_check_engine::config::SandboxConfig;
use compliance_check_engine::field_path;
use compliance_check_engine::resource::Resource;
use compliance_check_engine::sandbox;
use compliance_check_engine::types::ComparisonOperator;

fn synthetic_resources(n: usize) -> Vec<Resource> {
    (0..n)
        .map(|i| {
            Resource::new(
                format!("bucket-{i}"),
                "con_mon_v2.mappings.aws.S3Bucket",
                "aws",
                json!({
                    "encrypted": i % 3 != 0,
                    "tags": [{"key": "env", "value": if i % 2 == 0 { "prod" } else { "dev" }}],
                    "acl": {"public": i % 7 == 0},
                }),
            )
        })
        .collect()
}

fn encrypted_check() -> Check {
    Check::new(
        "bench-check".to_owned(),
        "S3 buckets must be encrypted".to_owned(),
        None,
        None,
        None,
        None,
        None,
        None,
        false,
        OutputStatements::default(),
        FixDetails::default(),
        CheckMetadata {
            resource_type: "con_mon_v2.mappings.aws.S3Bucket".to_owned(),
            field_path: "encrypted".to_owned(),
            operation: CheckOperation { name: ComparisonOperator::Equal, logic: None },
            expected_value: Some(json!(true)),
            tags: vec![],
            severity: Some("high".to_owned()),
            category: Some("data_protection".to_owned()),
        },
    )
}

fn bench_field_path_evaluation(c: &mut Criterion) {
    let data = json!({
        "tags": (0..50).map(|i| json!({"key": format!("k{i}"), "value": "v"})).collect::<Vec<_>>(),
    });

    c.bench_function("field_path_any_wildcard", |b| {
        b.iter(|| field_path::evaluate(&data, "any(tags[*].value)").unwrap());
    });
}

fn bench_sandbox_execution(c: &mut Criterion) {
    let fetched = json!({"encrypted": true, "algorithm": "AES256"});
    let expected = json!(true);
    let config = SandboxConfig::default();

    c.bench_function("sandbox_custom_predicate", |b| {
        b.iter(|| sandbox::execute("result = fetched_value.encrypted and fetched_value.algorithm == 'AES256'", &fetched, &expected, &config).unwrap());
    });
}

fn bench_check_evaluate(c: &mut Criterion) {
    let check = encrypted_check();
    let config = SandboxConfig::default();
    let mut group = c.benchmark_group("check_evaluate");

    for size in [10usize, 100, 1000] {
        let resources = synthetic_resources(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| check.evaluate(&resources, &config));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_field_path_evaluation, bench_sandbox_execution, bench_check_evaluate);
criterion_main!(benches);
