use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use strandgraph::graph::{CompileOptions, Graph, NodeKey, NodeSpec};
use strandgraph::schema::SchemaId;

fn build_chain(len: usize) -> Graph {
    let mut graph = Graph::new();
    for i in 0..len {
        graph = graph
            .add_node(
                format!("n{i}").as_str(),
                NodeSpec::invoke(SchemaId::string(), SchemaId::string(), |_ctx, input| async move {
                    Ok(json!(format!("{}+", input.as_str().unwrap_or_default())))
                }),
            )
            .expect("unique keys");
    }
    graph = graph.add_edge(NodeKey::Start, "n0").expect("edge");
    for i in 1..len {
        graph = graph
            .add_edge(format!("n{}", i - 1).as_str(), format!("n{i}").as_str())
            .expect("edge");
    }
    graph
        .add_edge(format!("n{}", len - 1).as_str(), NodeKey::End)
        .expect("edge")
}

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_chain_32", |b| {
        b.iter(|| {
            let plan = build_chain(32).compile(CompileOptions::new()).expect("compiles");
            std::hint::black_box(plan);
        })
    });

    c.bench_function("compile_wide_fan_out_16", |b| {
        b.iter(|| {
            let mut graph = Graph::new();
            for i in 0..16 {
                graph = graph
                    .add_node(
                        format!("w{i}").as_str(),
                        NodeSpec::passthrough(SchemaId::json()),
                    )
                    .expect("unique keys");
                graph = graph
                    .add_edge(NodeKey::Start, format!("w{i}").as_str())
                    .expect("edge");
                graph = graph
                    .add_edge(format!("w{i}").as_str(), NodeKey::End)
                    .expect("edge");
            }
            let plan = graph.compile(CompileOptions::new()).expect("compiles");
            std::hint::black_box(plan);
        })
    });
}

criterion_group!(benches, bench_compile);
criterion_main!(benches);
