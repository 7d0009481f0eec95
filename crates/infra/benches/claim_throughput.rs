use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use leasehold_core::{
    ProcessOutcome, ProcessableObject, ProcessingError, ProcessingPhase, ProcessingStatus,
    StatusMapping,
};
use leasehold_infra::{ClaimRequest, Engine, InMemoryWorkStore, ObjectProcessor, WorkStore};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
enum Thumb {
    Waiting,
    Rendering,
    Rendered,
    Broken,
}

impl ProcessingStatus for Thumb {
    fn phase(&self) -> ProcessingPhase {
        match self {
            Thumb::Waiting => ProcessingPhase::Pending,
            Thumb::Rendering => ProcessingPhase::Processing,
            Thumb::Rendered => ProcessingPhase::Completed,
            Thumb::Broken => ProcessingPhase::Failed,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Thumb::Waiting => "WAITING",
            Thumb::Rendering => "RENDERING",
            Thumb::Rendered => "RENDERED",
            Thumb::Broken => "BROKEN",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "WAITING" => Some(Thumb::Waiting),
            "RENDERING" => Some(Thumb::Rendering),
            "RENDERED" => Some(Thumb::Rendered),
            "BROKEN" => Some(Thumb::Broken),
            _ => None,
        }
    }
}

struct Renderer {
    mapping: StatusMapping<Thumb>,
}

#[async_trait]
impl ObjectProcessor<u64, Thumb> for Renderer {
    fn name(&self) -> &str {
        "renderer"
    }

    fn status_mapping(&self) -> &StatusMapping<Thumb> {
        &self.mapping
    }

    async fn process(
        &self,
        _object: &ProcessableObject<u64, Thumb>,
    ) -> Result<ProcessOutcome<Thumb>, ProcessingError> {
        Ok(ProcessOutcome::to_status(Thumb::Rendered))
    }

    fn determine_failure_status(
        &self,
        _object: &ProcessableObject<u64, Thumb>,
        _failed_status: Thumb,
        _error: &ProcessingError,
    ) -> Thumb {
        Thumb::Broken
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn seeded(rt: &tokio::runtime::Runtime, rows: u64) -> Arc<InMemoryWorkStore<u64, Thumb>> {
    let store = InMemoryWorkStore::arc();
    let due = Utc::now() - Duration::seconds(1);
    rt.block_on(async {
        for id in 0..rows {
            let at = due - Duration::milliseconds(id as i64);
            store
                .insert(ProcessableObject::new(id, Thumb::Waiting, at))
                .await
                .unwrap();
        }
    });
    store
}

/// find_eligible + claim on stores of growing size.
fn bench_claim(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim");
    group.throughput(Throughput::Elements(1));

    for rows in [100u64, 1_000, 10_000] {
        group.bench_with_input(BenchmarkId::new("find_and_claim", rows), &rows, |b, &rows| {
            let store = seeded(&rt, rows);
            let mut next = 0u64;
            b.iter(|| {
                rt.block_on(async {
                    let candidates = store
                        .find_eligible(&[Thumb::Waiting], Utc::now(), 1)
                        .await
                        .unwrap();
                    let id = candidates.first().map(|o| o.id).unwrap_or(next % rows);
                    let request = ClaimRequest {
                        id,
                        pending_status: Thumb::Waiting,
                        processing_status: Thumb::Rendering,
                        owner: "bench".to_string(),
                        now: Utc::now(),
                        expected_attempts: 0,
                    };
                    black_box(store.claim(&request).await.unwrap());
                });
                next += 1;
            });
        });
    }

    group.finish();
}

/// Full claim → process → unlock cycle through the engine.
fn bench_engine_cycle(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("engine_cycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("process_next", |b| {
        let store = seeded(&rt, 200_000);
        let processor = Arc::new(Renderer {
            mapping: StatusMapping::new([(Thumb::Waiting, Thumb::Rendering)]).unwrap(),
        });
        let engine = Engine::new(processor, store, "bench");
        b.iter(|| {
            rt.block_on(async { black_box(engine.process_next().await.unwrap()) });
        });
    });

    group.finish();
}

criterion_group!(benches, bench_claim, bench_engine_cycle);
criterion_main!(benches);
