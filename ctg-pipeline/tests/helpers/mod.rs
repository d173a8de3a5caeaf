//! Shared test fixtures: scripted oracle, in-memory graph sink and
//! dead-letter sink, and a synchronous outbox dispatcher that stands in
//! for the publisher/broker pair.

#![allow(dead_code)]

use async_trait::async_trait;
use ctg_common::db::models::{FileStatus, PoiRecord};
use ctg_common::db::{files, outbox};
use ctg_pipeline::broker::{BrokerError, DeadLetterSink, JobEnvelope};
use ctg_pipeline::graph::{GraphError, GraphRelationship, GraphSink};
use ctg_pipeline::oracle::{Oracle, OracleError, OracleRequest, OracleResponse, OracleUsage};
use ctg_pipeline::workers::JobHandler;
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

/// Scripted oracle: pops canned bodies in call order.
pub struct MockOracle {
    responses: Mutex<Vec<Result<String, OracleError>>>,
    pub calls: Mutex<Vec<OracleRequest>>,
}

impl MockOracle {
    pub fn new(responses: Vec<Result<String, OracleError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Oracle for MockOracle {
    async fn call(&self, request: &OracleRequest) -> Result<OracleResponse, OracleError> {
        self.calls.lock().unwrap().push(request.clone());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(OracleError::Network("no scripted response left".into()));
        }
        responses.remove(0).map(|body| OracleResponse {
            body,
            usage: OracleUsage::default(),
        })
    }
}

/// In-memory graph sink capturing merged nodes and edges.
pub struct MemoryGraph {
    pub nodes: Mutex<HashMap<String, PoiRecord>>,
    pub edges: Mutex<BTreeSet<(String, String, String)>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            edges: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn edge_set(&self) -> BTreeSet<(String, String, String)> {
        self.edges.lock().unwrap().clone()
    }

    pub fn node_ids(&self) -> BTreeSet<String> {
        self.nodes.lock().unwrap().keys().cloned().collect()
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

    async fn merge_relationship(&self, relationship: &GraphRelationship) -> Result<(), GraphError> {
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

/// Captures per-row dead-letter pushes.
pub struct MemoryDeadLetters {
    pub entries: Mutex<Vec<(String, serde_json::Value, String)>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetters {
    async fn push_dead_letter(
        &self,
        origin_queue: &str,
        payload: &serde_json::Value,
        reason: &str,
    ) -> Result<(), BrokerError> {
        self.entries.lock().unwrap().push((
            origin_queue.to_string(),
            payload.clone(),
            reason.to_string(),
        ));
        Ok(())
    }
}

/// Seed a file row the way the batcher would.
pub async fn seed_file(pool: &SqlitePool, path: &str, status: FileStatus) -> i64 {
    let mut tx = pool.begin().await.unwrap();
    let id = files::upsert_file(&mut tx, path, "test-hash", None, status)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    id
}

/// Synchronous stand-in for the publisher/broker/consumer loop: drains the
/// outbox repeatedly, marking rows published and handing each payload to
/// the registered handler for its queue, until no pending rows remain.
/// Queues without a handler are published and dropped.
pub async fn drain_outbox(
    pool: &SqlitePool,
    handlers: &HashMap<&'static str, Arc<dyn JobHandler>>,
) -> usize {
    let mut delivered = 0;
    loop {
        let pending = outbox::fetch_pending(pool, 100).await.unwrap();
        if pending.is_empty() {
            return delivered;
        }
        for event in pending {
            assert!(outbox::mark_published(pool, event.id).await.unwrap());
            let payload: serde_json::Value = serde_json::from_str(&event.payload).unwrap();
            if let Some(handler) = handlers.get(event.queue_name.as_str()) {
                handler
                    .handle(&JobEnvelope::new(payload))
                    .await
                    .unwrap_or_else(|e| panic!("handler for {} failed: {}", event.queue_name, e));
                delivered += 1;
            }
        }
    }
}
