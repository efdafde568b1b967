use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use openlabs_core::{BlueprintId, UserId};
use openlabs_ranges::{
    BlueprintHost, BlueprintRange, BlueprintSubnet, BlueprintVpc, Provider, RangeLayout,
    derive_logical_ids,
};

fn colliding_names(n: usize) -> Vec<String> {
    // Every third name collides with its neighbour after normalization.
    (0..n)
        .map(|i| match i % 3 {
            0 => format!("Host {}", i / 3),
            1 => format!("host-{}", i / 3),
            _ => format!("db_{i}"),
        })
        .collect()
}

fn wide_blueprint(vpcs: usize, subnets: usize, hosts: usize) -> BlueprintRange {
    BlueprintRange {
        id: BlueprintId::new(),
        owner: UserId::new(),
        name: "bench range".to_string(),
        description: String::new(),
        provider: Provider::Aws,
        vnc: false,
        vpn: false,
        vpcs: (0..vpcs)
            .map(|v| BlueprintVpc {
                name: format!("vpc {v}"),
                cidr: format!("10.{v}.0.0/16"),
                subnets: (0..subnets)
                    .map(|s| BlueprintSubnet {
                        name: format!("subnet {s}"),
                        cidr: format!("10.{v}.{s}.0/24"),
                        hosts: (0..hosts)
                            .map(|h| BlueprintHost {
                                hostname: format!("host-{h}"),
                                os: "debian_11".to_string(),
                                spec: "tiny".to_string(),
                                size_gb: 8,
                                tags: vec![],
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn bench_derive_logical_ids(c: &mut Criterion) {
    let mut group = c.benchmark_group("derive_logical_ids");
    for n in [10usize, 100, 1_000] {
        let names = colliding_names(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &names, |b, names| {
            b.iter(|| derive_logical_ids(black_box(names.iter().map(String::as_str))).unwrap())
        });
    }
    group.finish();
}

fn bench_layout_plan(c: &mut Criterion) {
    let blueprint = wide_blueprint(4, 8, 16);
    c.bench_function("range_layout_plan_4x8x16", |b| {
        b.iter(|| RangeLayout::plan(black_box(&blueprint), "bench-range-abc123").unwrap())
    });
}

criterion_group!(benches, bench_derive_logical_ids, bench_layout_plan);
criterion_main!(benches);
