use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rulegraph_core::graph::NodeKind;
use rulegraph_core::{DependencyGraph, DependencyOptions, PropertyId, RuleEngine, ScalarProperty};

/// Build `source -> p1 -> ... -> pN`, each step adding one.
fn build_chain(len: usize) -> (RuleEngine, ScalarProperty<u64>, ScalarProperty<u64>) {
    let engine = RuleEngine::new();
    let source = engine.scalar::<u64>("p0").initial(0).build().unwrap();
    let mut tail = source.clone();
    for i in 1..=len {
        let input = tail.clone();
        tail = engine
            .scalar::<u64>(format!("p{i}"))
            .depends_on([format!("p{}", i - 1)])
            .derive(move || Ok(input.get_value().map(|v| v + 1)))
            .build()
            .unwrap();
    }
    (engine, source, tail)
}

fn bench_sync_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_chain");
    for len in [10, 100] {
        let (_engine, source, tail) = build_chain(len);
        let mut next = 0u64;
        group.bench_function(format!("set_and_read_{len}"), |b| {
            b.iter(|| {
                next += 1;
                source.set_value(next).unwrap();
                black_box(tail.get_value())
            })
        });
    }
    group.finish();
}

fn bench_graph_build(c: &mut Criterion) {
    let ids: Vec<PropertyId> = (0..1_000).map(|i| PropertyId::new(format!("n{i}"))).collect();

    c.bench_function("graph_build_1000", |b| {
        b.iter_batched(
            DependencyGraph::new,
            |mut graph| {
                for id in &ids {
                    graph.register_node(id.clone(), NodeKind::synchronous());
                }
                for pair in ids.windows(2) {
                    graph
                        .add_dependency(&pair[0], &pair[1], DependencyOptions::value())
                        .unwrap();
                }
                black_box(graph.find_cyclic_dependencies())
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_sync_chain, bench_graph_build);
criterion_main!(benches);
