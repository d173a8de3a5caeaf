//! Graph builder worker
//!
//! Consumes accepted relationships from the `graph-builder` queue, loads
//! the endpoint POIs from the relational store, and materializes nodes and
//! edge in the graph store. MERGE semantics make every step replay-safe.

use crate::broker::JobEnvelope;
use crate::error::JobError;
use crate::graph::{GraphRelationship, GraphSink};
use crate::workers::JobHandler;
use async_trait::async_trait;
use ctg_common::db::pois;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct GraphBuildData {
    #[allow(dead_code)]
    run_id: Uuid,
    relationship: AcceptedPayload,
}

#[derive(Debug, Deserialize)]
struct AcceptedPayload {
    from_poi_id: String,
    to_poi_id: String,
    relationship_type: String,
    confidence_score: f64,
}

/// Dependencies of the graph builder worker
pub struct GraphBuildWorker {
    pub db: SqlitePool,
    pub graph: Arc<dyn GraphSink>,
}

#[async_trait]
impl JobHandler for GraphBuildWorker {
    async fn handle(&self, job: &JobEnvelope) -> Result<(), JobError> {
        let data: GraphBuildData = serde_json::from_value(job.data().clone())?;
        let relationship = data.relationship;

        // Accepted relationships hold referential integrity over POIs;
        // a missing endpoint here is corrupted state, not a transient
        let from = pois::get(&self.db, &relationship.from_poi_id)
            .await?
            .ok_or_else(|| {
                JobError::fatal(format!(
                    "accepted relationship references missing POI {}",
                    relationship.from_poi_id
                ))
            })?;
        let to = pois::get(&self.db, &relationship.to_poi_id)
            .await?
            .ok_or_else(|| {
                JobError::fatal(format!(
                    "accepted relationship references missing POI {}",
                    relationship.to_poi_id
                ))
            })?;

        self.graph
            .merge_pois(&[from, to])
            .await
            .map_err(|e| JobError::retryable(format!("graph node merge: {}", e)))?;

        self.graph
            .merge_relationship(&GraphRelationship {
                from_poi_id: relationship.from_poi_id.clone(),
                to_poi_id: relationship.to_poi_id.clone(),
                relationship_type: relationship.relationship_type.clone(),
                confidence_score: relationship.confidence_score,
            })
            .await
            .map_err(|e| JobError::retryable(format!("graph edge merge: {}", e)))?;

        info!(
            from = %relationship.from_poi_id,
            to = %relationship.to_poi_id,
            kind = %relationship.relationship_type,
            "Relationship materialized in graph"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphError;
    use ctg_common::db::init::create_schema;
    use ctg_common::db::models::{derive_poi_id, FileStatus, NewPoi, PoiRecord};
    use ctg_common::db::files;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory graph sink capturing merges.
    pub struct MemoryGraph {
        pub nodes: Mutex<HashMap<String, PoiRecord>>,
        pub edges: Mutex<HashSet<(String, String, String)>>,
    }

    impl MemoryGraph {
        pub fn new() -> Self {
            Self {
                nodes: Mutex::new(HashMap::new()),
                edges: Mutex::new(HashSet::new()),
            }
        }
    }

    #[async_trait]
    impl GraphSink for MemoryGraph {
        async fn merge_pois(&self, pois: &[PoiRecord]) -> Result<(), GraphError> {
            let mut nodes = self.nodes.lock().unwrap();
            for poi in pois {
                nodes.insert(poi.poi_id.clone(), poi.clone());
            }
            Ok(())
        }

        async fn merge_relationship(
            &self,
            relationship: &GraphRelationship,
        ) -> Result<(), GraphError> {
            self.edges.lock().unwrap().insert((
                relationship.from_poi_id.clone(),
                relationship.to_poi_id.clone(),
                relationship.relationship_type.clone(),
            ));
            Ok(())
        }

        async fn clear(&self) -> Result<(), GraphError> {
            self.nodes.lock().unwrap().clear();
            self.edges.lock().unwrap().clear();
            Ok(())
        }

        async fn node_count(&self) -> Result<u64, GraphError> {
            Ok(self.nodes.lock().unwrap().len() as u64)
        }
    }

    async fn seed_poi(pool: &SqlitePool, path: &str, name: &str) -> String {
        let mut tx = pool.begin().await.unwrap();
        let file_id = files::upsert_file(&mut tx, path, "h", None, FileStatus::Analyzed)
            .await
            .unwrap();
        let poi_id = derive_poi_id(path, "function", name, 1);
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
        poi_id
    }

    fn envelope(from: &str, to: &str) -> JobEnvelope {
        JobEnvelope::new(json!({
            "event_type": "relationship-accepted",
            "data": {
                "run_id": Uuid::new_v4(),
                "relationship": {
                    "from_poi_id": from,
                    "to_poi_id": to,
                    "relationship_type": "calls",
                    "confidence_score": 0.91,
                    "metadata": {"sources": ["intra_file", "global"]}
                }
            }
        }))
    }

    #[tokio::test]
    async fn test_relationship_materialized() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        let a = seed_poi(&pool, "src/a.js", "main").await;
        let b = seed_poi(&pool, "src/b.js", "helper").await;

        let graph = Arc::new(MemoryGraph::new());
        let worker = GraphBuildWorker {
            db: pool.clone(),
            graph: graph.clone(),
        };

        worker.handle(&envelope(&a, &b)).await.unwrap();

        assert_eq!(graph.node_count().await.unwrap(), 2);
        assert!(graph
            .edges
            .lock()
            .unwrap()
            .contains(&(a.clone(), b.clone(), "calls".to_string())));
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        let a = seed_poi(&pool, "src/a.js", "main").await;
        let b = seed_poi(&pool, "src/b.js", "helper").await;

        let graph = Arc::new(MemoryGraph::new());
        let worker = GraphBuildWorker {
            db: pool.clone(),
            graph: graph.clone(),
        };

        let event = envelope(&a, &b);
        worker.handle(&event).await.unwrap();
        worker.handle(&event).await.unwrap();

        assert_eq!(graph.node_count().await.unwrap(), 2);
        assert_eq!(graph.edges.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_fatal() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        let a = seed_poi(&pool, "src/a.js", "main").await;

        let worker = GraphBuildWorker {
            db: pool.clone(),
            graph: Arc::new(MemoryGraph::new()),
        };

        let err = worker.handle(&envelope(&a, "missing")).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
