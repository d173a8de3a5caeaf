//! Graph round trip: clearing the graph store and replaying the published
//! graph-builder events from the outbox must rebuild an identical graph.

mod helpers;

use ctg_common::db::init::create_schema;
use ctg_common::db::models::{derive_poi_id, EvidenceSource, FileStatus, NewEvidence, NewPoi};
use ctg_common::db::{evidence, outbox, pois};
use ctg_pipeline::broker::{names, JobEnvelope};
use ctg_pipeline::graph::GraphSink;
use ctg_pipeline::workers::graph_build::GraphBuildWorker;
use ctg_pipeline::workers::reconciliation::ReconciliationWorker;
use ctg_pipeline::workers::JobHandler;
use helpers::{seed_file, MemoryDeadLetters, MemoryGraph};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

#[tokio::test]
async fn replaying_published_events_rebuilds_identical_graph() {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    create_schema(&pool).await.unwrap();

    // Three POIs with two accepted relationships between them
    let mut ids = Vec::new();
    for (path, name) in [("a.js", "one"), ("b.js", "two"), ("c.js", "three")] {
        let file_id = seed_file(&pool, path, FileStatus::Analyzed).await;
        let poi_id = derive_poi_id(path, "function", name, 1);
        let mut tx = pool.begin().await.unwrap();
        pois::upsert_pois(
            &mut tx,
            &[NewPoi {
                poi_id: poi_id.clone(),
                file_id,
                poi_type: "function".to_string(),
                name: name.to_string(),
                file_path: path.to_string(),
                start_line: 1,
                end_line: 2,
                metadata: None,
            }],
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        ids.push(poi_id);
    }

    let mut tx = pool.begin().await.unwrap();
    for (from, to) in [(0usize, 1usize), (1, 2)] {
        evidence::insert_tx(
            &mut tx,
            &NewEvidence {
                from_poi_id: ids[from].clone(),
                to_poi_id: ids[to].clone(),
                relationship_type: "calls".to_string(),
                evidence_source: EvidenceSource::Deterministic,
                confidence: 1.0,
                metadata: None,
            },
        )
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();

    let reconciliation = ReconciliationWorker {
        db: pool.clone(),
        dead_letters: Arc::new(MemoryDeadLetters::new()),
    };
    reconciliation
        .handle(&JobEnvelope::new(json!({
            "event_type": "reconcile-keys",
            "data": {"run_id": Uuid::new_v4(), "keys": [
                {"from_poi_id": ids[0], "to_poi_id": ids[1], "relationship_type": "calls"},
                {"from_poi_id": ids[1], "to_poi_id": ids[2], "relationship_type": "calls"},
            ]}
        })))
        .await
        .unwrap();

    // First build: publish and consume the staged graph events
    let graph = Arc::new(MemoryGraph::new());
    let builder = GraphBuildWorker {
        db: pool.clone(),
        graph: graph.clone(),
    };
    for event in outbox::fetch_pending(&pool, 100).await.unwrap() {
        assert_eq!(event.queue_name, names::GRAPH_BUILD);
        assert!(outbox::mark_published(&pool, event.id).await.unwrap());
        let payload: serde_json::Value = serde_json::from_str(&event.payload).unwrap();
        builder.handle(&JobEnvelope::new(payload)).await.unwrap();
    }

    let nodes_before = graph.node_ids();
    let edges_before = graph.edge_set();
    assert_eq!(nodes_before.len(), 3);
    assert_eq!(edges_before.len(), 2);

    // Clear the graph store, then replay the published queue from the outbox
    graph.clear().await.unwrap();
    assert_eq!(graph.node_count().await.unwrap(), 0);

    let replay = outbox::load_published_for_queue(&pool, names::GRAPH_BUILD)
        .await
        .unwrap();
    assert_eq!(replay.len(), 2);
    for event in replay {
        let payload: serde_json::Value = serde_json::from_str(&event.payload).unwrap();
        builder.handle(&JobEnvelope::new(payload)).await.unwrap();
    }

    assert_eq!(graph.node_ids(), nodes_before);
    assert_eq!(graph.edge_set(), edges_before);
}
