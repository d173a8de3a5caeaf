//! Property-style checks on reconciliation: idempotence, referential
//! integrity of accepted relationships, and monotonicity of the combined
//! confidence under added agreement.

mod helpers;

use ctg_common::db::init::create_schema;
use ctg_common::db::models::{derive_poi_id, EvidenceSource, FileStatus, NewEvidence, NewPoi};
use ctg_common::db::{evidence, pois, relationships};
use ctg_pipeline::broker::JobEnvelope;
use ctg_pipeline::workers::reconciliation::ReconciliationWorker;
use ctg_pipeline::workers::JobHandler;
use helpers::{seed_file, MemoryDeadLetters};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

async fn seed_pair(pool: &SqlitePool) -> (String, String) {
    let a_file = seed_file(pool, "a.js", FileStatus::Analyzed).await;
    let b_file = seed_file(pool, "b.js", FileStatus::Analyzed).await;

    let a = derive_poi_id("a.js", "function", "caller", 1);
    let b = derive_poi_id("b.js", "function", "callee", 1);

    let mut tx = pool.begin().await.unwrap();
    pois::upsert_pois(
        &mut tx,
        &[
            NewPoi {
                poi_id: a.clone(),
                file_id: a_file,
                poi_type: "function".to_string(),
                name: "caller".to_string(),
                file_path: "a.js".to_string(),
                start_line: 1,
                end_line: 2,
                metadata: None,
            },
            NewPoi {
                poi_id: b.clone(),
                file_id: b_file,
                poi_type: "function".to_string(),
                name: "callee".to_string(),
                file_path: "b.js".to_string(),
                start_line: 1,
                end_line: 2,
                metadata: None,
            },
        ],
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
    (a, b)
}

async fn add_evidence(pool: &SqlitePool, a: &str, b: &str, source: EvidenceSource, confidence: f64) {
    let mut tx = pool.begin().await.unwrap();
    evidence::insert_tx(
        &mut tx,
        &NewEvidence {
            from_poi_id: a.to_string(),
            to_poi_id: b.to_string(),
            relationship_type: "calls".to_string(),
            evidence_source: source,
            confidence,
            metadata: None,
        },
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();
}

fn keys_envelope(a: &str, b: &str) -> JobEnvelope {
    JobEnvelope::new(json!({
        "event_type": "reconcile-keys",
        "data": {"run_id": Uuid::new_v4(), "keys": [
            {"from_poi_id": a, "to_poi_id": b, "relationship_type": "calls"}
        ]}
    }))
}

#[tokio::test]
async fn reconciliation_is_idempotent() {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    create_schema(&pool).await.unwrap();
    let (a, b) = seed_pair(&pool).await;
    add_evidence(&pool, &a, &b, EvidenceSource::IntraFile, 0.9).await;
    add_evidence(&pool, &a, &b, EvidenceSource::Global, 0.6).await;

    let worker = ReconciliationWorker {
        db: pool.clone(),
        dead_letters: Arc::new(MemoryDeadLetters::new()),
    };

    worker.handle(&keys_envelope(&a, &b)).await.unwrap();
    let first = relationships::get(&pool, &a, &b, "calls").await.unwrap().unwrap();

    // Same evidence set, run again: identical accepted relationships
    worker.handle(&keys_envelope(&a, &b)).await.unwrap();
    let second = relationships::get(&pool, &a, &b, "calls").await.unwrap().unwrap();

    assert_eq!(relationships::count(&pool).await.unwrap(), 1);
    assert_eq!(first.confidence_score, second.confidence_score);
    assert_eq!(first.metadata, second.metadata);
}

#[tokio::test]
async fn accepted_relationships_hold_referential_integrity() {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    create_schema(&pool).await.unwrap();
    let (a, b) = seed_pair(&pool).await;
    add_evidence(&pool, &a, &b, EvidenceSource::Deterministic, 1.0).await;

    let worker = ReconciliationWorker {
        db: pool.clone(),
        dead_letters: Arc::new(MemoryDeadLetters::new()),
    };
    worker.handle(&keys_envelope(&a, &b)).await.unwrap();

    for accepted in relationships::load_all(&pool).await.unwrap() {
        assert!(pois::exists(&pool, &accepted.from_poi_id).await.unwrap());
        assert!(pois::exists(&pool, &accepted.to_poi_id).await.unwrap());
        assert!(
            evidence::count_for_key(
                &pool,
                &accepted.from_poi_id,
                &accepted.to_poi_id,
                &accepted.relationship_type
            )
            .await
            .unwrap()
                >= 1,
            "accepted relationship must be backed by evidence"
        );
    }
}

#[tokio::test]
async fn added_agreement_never_decreases_confidence() {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    create_schema(&pool).await.unwrap();
    let (a, b) = seed_pair(&pool).await;
    add_evidence(&pool, &a, &b, EvidenceSource::IntraFile, 0.9).await;
    add_evidence(&pool, &a, &b, EvidenceSource::IntraDirectory, 0.5).await;

    let worker = ReconciliationWorker {
        db: pool.clone(),
        dead_letters: Arc::new(MemoryDeadLetters::new()),
    };
    worker.handle(&keys_envelope(&a, &b)).await.unwrap();
    let before = relationships::get(&pool, &a, &b, "calls").await.unwrap().unwrap();

    // An agreeing source arrives later; re-reconciliation can only raise
    add_evidence(&pool, &a, &b, EvidenceSource::Global, 0.7).await;
    worker.handle(&keys_envelope(&a, &b)).await.unwrap();
    let after = relationships::get(&pool, &a, &b, "calls").await.unwrap().unwrap();

    assert!(after.confidence_score >= before.confidence_score);
}

#[tokio::test]
async fn missing_evidence_key_goes_to_dead_letters() {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    create_schema(&pool).await.unwrap();
    let (a, b) = seed_pair(&pool).await;

    let sink = Arc::new(MemoryDeadLetters::new());
    let worker = ReconciliationWorker {
        db: pool.clone(),
        dead_letters: sink.clone(),
    };

    // Keys with no evidence rows violate the write-ordering contract
    worker.handle(&keys_envelope(&a, &b)).await.unwrap();

    assert_eq!(relationships::count(&pool).await.unwrap(), 0);
    let entries = sink.entries.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].2, "missing_evidence");
}
