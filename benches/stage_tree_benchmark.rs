use criterion::{Criterion, black_box, criterion_group, criterion_main};
use stage_report::{
    FailureCause, JsonSerializer, MemoryStorage, ReportSerializer, StageKind, StageTree,
};

/// A test with `steps` steps, each holding a nested step
fn build_tree(steps: usize) -> StageTree {
    let storage = MemoryStorage::new();
    let mut tree = StageTree::new("benchmark", None);
    for i in 0..steps {
        let step = tree.open(StageKind::Step, format!("step {}", i), None).unwrap();
        let inner = tree.open(StageKind::Step, "inner", None).unwrap();
        tree.node_mut(inner).pass(&storage).unwrap();
        tree.close(inner).unwrap();
        tree.node_mut(step).pass(&storage).unwrap();
        tree.close(step).unwrap();
    }
    tree
}

fn benchmark_stage_tree(c: &mut Criterion) {
    c.bench_function("build_tree_100_steps", |b| {
        b.iter(|| build_tree(black_box(100)))
    });

    c.bench_function("propagate_failure_depth_50", |b| {
        let cause = FailureCause::new("boom");
        b.iter(|| {
            let mut tree = StageTree::new("deep", None);
            for _ in 0..50 {
                tree.open(StageKind::Step, "nested", None).unwrap();
            }
            tree.propagate_failure(black_box(&cause), |_| {}).unwrap();
            tree
        })
    });

    let tree = build_tree(100);
    let serializer = JsonSerializer::compact();
    c.bench_function("serialize_json_100_steps", |b| {
        b.iter(|| {
            let bytes = serializer.serialize(black_box(&tree));
            assert!(bytes.is_ok());
        })
    });
}

criterion_group!(benches, benchmark_stage_tree);
criterion_main!(benches);
