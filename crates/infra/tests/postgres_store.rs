//! Postgres work store against a real database.
//!
//! Run with `DATABASE_URL=postgres://... cargo test -p leasehold-infra -- --ignored`.

use std::sync::Arc;

use chrono::{DateTime, Duration, DurationRound, Utc};
use leasehold_core::{Lease, ObjectId, ProcessableObject, ProcessingPhase, ProcessingStatus, UnlockChange};
use leasehold_infra::{ClaimAttempt, ClaimRequest, PostgresWorkStore, StoreError, UnlockRequest, WorkStore};
use sqlx::postgres::PgPoolOptions;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
enum Export {
    Requested,
    Exporting,
    Exported,
    Abandoned,
}

impl ProcessingStatus for Export {
    fn phase(&self) -> ProcessingPhase {
        match self {
            Export::Requested => ProcessingPhase::Pending,
            Export::Exporting => ProcessingPhase::Processing,
            Export::Exported => ProcessingPhase::Completed,
            Export::Abandoned => ProcessingPhase::Failed,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Export::Requested => "REQUESTED",
            Export::Exporting => "EXPORTING",
            Export::Exported => "EXPORTED",
            Export::Abandoned => "ABANDONED",
        }
    }

    fn from_code(code: &str) -> Option<Self> {
        match code {
            "REQUESTED" => Some(Export::Requested),
            "EXPORTING" => Some(Export::Exporting),
            "EXPORTED" => Some(Export::Exported),
            "ABANDONED" => Some(Export::Abandoned),
            _ => None,
        }
    }
}

type ExportStore = PostgresWorkStore<ObjectId, Export>;

async fn store() -> ExportStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&url)
        .await
        .expect("connect");

    let table = format!("exports_{}", ObjectId::new().as_uuid().simple());
    let store = ExportStore::new(pool, table).unwrap();
    store.ensure_schema().await.unwrap();
    store
}

fn now() -> DateTime<Utc> {
    Utc::now().duration_trunc(Duration::microseconds(1)).unwrap()
}

fn claim(id: ObjectId, owner: &str, at: DateTime<Utc>) -> ClaimRequest<ObjectId, Export> {
    ClaimRequest {
        id,
        pending_status: Export::Requested,
        processing_status: Export::Exporting,
        owner: owner.to_string(),
        now: at,
        expected_attempts: 0,
    }
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn claim_unlock_roundtrip() {
    let store = store().await;
    let id = ObjectId::new();
    let due = now() - Duration::seconds(5);
    store.insert(ProcessableObject::new(id, Export::Requested, due)).await.unwrap();

    let dup = store.insert(ProcessableObject::new(id, Export::Requested, due)).await;
    assert!(matches!(dup, Err(StoreError::AlreadyExists(_))));

    let found = store.find_eligible(&[Export::Requested], now(), 10).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].next_processed, due);

    let at = now();
    let outdated = ClaimRequest {
        expected_attempts: 1,
        ..claim(id, "a", at)
    };
    assert_eq!(store.claim(&outdated).await.unwrap(), 0);
    let early = claim(id, "a", due - Duration::seconds(1));
    assert_eq!(store.claim(&early).await.unwrap(), 0);

    assert_eq!(store.claim(&claim(id, "a", at)).await.unwrap(), 1);
    assert_eq!(store.claim(&claim(id, "b", at)).await.unwrap(), 0);

    let change = UnlockChange {
        status: Export::Exported,
        duration_ms: 120,
        last_processed: Some(at),
        next_processed: due,
        processed: Some(at),
        attempts: 1,
    };
    let stale = UnlockRequest {
        id,
        lease: Lease::new("b", at),
        change: change.clone(),
    };
    assert_eq!(store.unlock(&stale).await.unwrap(), 0);

    let own = UnlockRequest {
        id,
        lease: Lease::new("a", at),
        change,
    };
    assert_eq!(store.unlock(&own).await.unwrap(), 1);

    let row = store.get(&id).await.unwrap().unwrap();
    assert_eq!(row.status, Export::Exported);
    assert_eq!(row.processing_time_ms, 120);
    assert_eq!(row.processed, Some(at));
    assert!(row.lease.is_none());
}

#[tokio::test]
#[ignore = "needs DATABASE_URL"]
async fn sweep_and_suspension() {
    let store = store().await;
    let id = ObjectId::new();
    store
        .insert(ProcessableObject::new(id, Export::Requested, now() - Duration::seconds(120)))
        .await
        .unwrap();

    let locked_at = now() - Duration::seconds(61);
    store.claim(&claim(id, "crashed", locked_at)).await.unwrap();

    let reset = store
        .reset_stale_locks(Export::Exporting, Export::Requested, now() - Duration::seconds(60))
        .await
        .unwrap();
    assert_eq!(reset, 1);

    assert_eq!(store.set_suspended(&id, true).await.unwrap(), 1);
    assert!(store.find_eligible(&[Export::Requested], now(), 10).await.unwrap().is_empty());
    assert_eq!(store.claim(&claim(id, "a", now())).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "needs DATABASE_URL"]
async fn concurrent_claimers_have_exactly_one_winner() {
    let store = Arc::new(store().await);
    let id = ObjectId::new();
    store
        .insert(ProcessableObject::new(id, Export::Requested, now()))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for n in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.claim(&claim(id, &format!("w{n}"), now())).await.unwrap()
        }));
    }

    let mut winners = 0;
    for h in handles {
        winners += h.await.unwrap();
    }
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[ignore = "needs DATABASE_URL"]
async fn concurrent_claim_next_gets_disjoint_rows() {
    let store = Arc::new(store().await);
    let due = now() - Duration::seconds(5);
    for n in 0..4 {
        store
            .insert(ProcessableObject::new(
                ObjectId::new(),
                Export::Requested,
                due - Duration::seconds(n),
            ))
            .await
            .unwrap();
    }

    let transitions = [(Export::Requested, Export::Exporting)];
    let mut handles = Vec::new();
    for n in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_next(&transitions, &format!("w{n}"), now())
                .await
                .unwrap()
        }));
    }

    let mut claimed = Vec::new();
    for h in handles {
        match h.await.unwrap() {
            ClaimAttempt::Claimed(object) => {
                assert_eq!(object.status, Export::Exporting);
                assert_eq!(object.processing_attempts, 1);
                claimed.push(object.id);
            }
            other => panic!("expected a claim, got {other:?}"),
        }
    }
    claimed.sort();
    claimed.dedup();
    assert_eq!(claimed.len(), 4);

    let rest = store.claim_next(&transitions, "late", now()).await.unwrap();
    assert_eq!(rest, ClaimAttempt::Idle);
}
