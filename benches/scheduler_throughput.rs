//! Throughput of `Scheduler::run` over linear diagrams of varying length,
//! with an echo handler that does no real work. Grounded on the teacher's
//! `event_bus_throughput` benchmark: one `criterion_group!`, a `build_*`
//! helper that parameterizes diagram size, and `BenchmarkId`/`Throughput`
//! to report a per-node-activation rate rather than a raw wall-clock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime as TokioRuntime;
use uuid::Uuid;

use dipeo_core::context::{CancellationToken, ExecutionContext, ResourceRegistry};
use dipeo_core::diagram::{CompiledDiagram, DiagramBuilder, Handle, NodeSpec, NodeType};
use dipeo_core::envelope::Envelope;
use dipeo_core::events::EventHub;
use dipeo_core::handler::{Handler, HandlerRegistry, NodeError};
use dipeo_core::scheduler::{Scheduler, SchedulerConfig};
use dipeo_core::tokens::TokenStore;
use dipeo_core::tracker::Tracker;

fn node(id: &str, ty: NodeType) -> NodeSpec {
    NodeSpec::new(id, ty)
}

struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn run(&self, ctx: &mut ExecutionContext) -> Result<(), NodeError> {
        let text = ctx
            .inputs()
            .get(Handle::DEFAULT)
            .and_then(|e| e.as_text().ok())
            .unwrap_or("start")
            .to_string();
        ctx.emit_default(Envelope::text(text, ctx.node_id().clone(), Uuid::new_v4()))
    }
}

/// A chain `start -> job_0 -> job_1 -> ... -> job_{n-1} -> end`.
fn build_linear_diagram(n: usize) -> CompiledDiagram {
    let mut builder = DiagramBuilder::new()
        .add_node(node("start", NodeType::Start))
        .add_node(node("end", NodeType::Endpoint));

    let mut prev = "start".to_string();
    for i in 0..n {
        let job_id = format!("job-{i}");
        builder = builder
            .add_node(node(&job_id, NodeType::CodeJob))
            .add_arrow(prev.clone(), Handle::DEFAULT, job_id.clone(), Handle::DEFAULT);
        prev = job_id;
    }
    builder = builder.add_arrow(prev, Handle::DEFAULT, "end", Handle::DEFAULT);
    builder.compile().expect("linear diagram compiles")
}

fn registry() -> Arc<HandlerRegistry> {
    Arc::new(
        HandlerRegistry::new()
            .with_handler(NodeType::Start, Arc::new(EchoHandler))
            .with_handler(NodeType::CodeJob, Arc::new(EchoHandler))
            .with_handler(NodeType::Endpoint, Arc::new(EchoHandler)),
    )
}

fn bench_linear_pipelines(c: &mut Criterion) {
    let rt = TokioRuntime::new().expect("tokio runtime");
    let mut group = c.benchmark_group("scheduler_linear_pipeline");

    for node_count in [8usize, 64, 512] {
        group.throughput(Throughput::Elements(node_count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(node_count),
            &node_count,
            |b, &node_count| {
                let diagram = Arc::new(build_linear_diagram(node_count));
                b.to_async(&rt).iter(|| {
                    let diagram = diagram.clone();
                    async move {
                        let tracker = Arc::new(Tracker::new(1_000));
                        let tokens = Arc::new(TokenStore::new());
                        let hub = EventHub::new(64);
                        let scheduler = Scheduler::new(
                            diagram,
                            tracker,
                            tokens,
                            registry(),
                            Arc::new(hub.emitter()),
                            ResourceRegistry::builder().build(),
                            CancellationToken::new(),
                            SchedulerConfig {
                                parallelism: 8,
                                max_steps: 1_000_000,
                                fail_fast: false,
                                handler_grace: Duration::from_secs(5),
                            },
                        );
                        scheduler.run(Uuid::new_v4(), None).await
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_linear_pipelines);
criterion_main!(benches);
