//! Graph store adapter
//!
//! Bulk-loads accepted POIs and relationships into Neo4j with
//! `UNWIND … MERGE` batches keyed by poi_id, so replayed graph-builder
//! events are idempotent. Node labels derive from poi_type and edge types
//! from the canonical relationship vocabulary; both are sanitized before
//! being formatted into Cypher, since labels cannot be parameters.

use async_trait::async_trait;
use ctg_common::config::Neo4jConfig;
use ctg_common::db::models::PoiRecord;
use neo4rs::{query, BoltList, BoltMap, BoltType, ConfigBuilder, Graph};
use thiserror::Error;
use tracing::{debug, info};

/// Graph store errors
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Graph connection error: {0}")]
    Connection(String),

    #[error("Graph query error: {0}")]
    Query(String),

    #[error("Invalid graph input: {0}")]
    InvalidInput(String),
}

impl From<neo4rs::Error> for GraphError {
    fn from(err: neo4rs::Error) -> Self {
        GraphError::Query(err.to_string())
    }
}

/// One edge to materialize
#[derive(Debug, Clone)]
pub struct GraphRelationship {
    pub from_poi_id: String,
    pub to_poi_id: String,
    pub relationship_type: String,
    pub confidence_score: f64,
}

/// Abstract graph sink; production is Neo4j, tests substitute an
/// in-memory implementation.
#[async_trait]
pub trait GraphSink: Send + Sync {
    async fn merge_pois(&self, pois: &[PoiRecord]) -> Result<(), GraphError>;
    async fn merge_relationship(&self, relationship: &GraphRelationship) -> Result<(), GraphError>;
    async fn clear(&self) -> Result<(), GraphError>;
    async fn node_count(&self) -> Result<u64, GraphError>;
}

/// Node label from a poi_type: `function` → `Function`.
pub fn node_label(poi_type: &str) -> Result<String, GraphError> {
    let cleaned: String = poi_type
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if cleaned.is_empty() {
        return Err(GraphError::InvalidInput(format!(
            "poi_type {:?} yields no usable label",
            poi_type
        )));
    }
    let mut chars = cleaned.chars();
    let first = chars.next().unwrap().to_ascii_uppercase();
    Ok(format!("{}{}", first, chars.as_str()))
}

/// Edge type from a relationship type: `calls` → `CALLS`.
pub fn edge_type(relationship_type: &str) -> Result<String, GraphError> {
    let cleaned: String = relationship_type
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if cleaned.is_empty() {
        return Err(GraphError::InvalidInput(format!(
            "relationship type {:?} yields no usable edge type",
            relationship_type
        )));
    }
    Ok(cleaned.to_ascii_uppercase())
}

/// Neo4j-backed graph store
pub struct Neo4jGraph {
    graph: Graph,
}

impl Neo4jGraph {
    pub async fn connect(config: &Neo4jConfig) -> Result<Self, GraphError> {
        let graph_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .db(config.database.as_str())
            .build()
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        let graph = Graph::connect(graph_config)
            .await
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        info!(uri = %config.uri, database = %config.database, "Connected to graph store");
        Ok(Self { graph })
    }
}

fn poi_row(poi: &PoiRecord) -> BoltMap {
    let mut map = BoltMap::new();
    map.put("poi_id".into(), poi.poi_id.clone().into());
    map.put("name".into(), poi.name.clone().into());
    map.put("poi_type".into(), poi.poi_type.clone().into());
    map.put("file_path".into(), poi.file_path.clone().into());
    map.put("start_line".into(), poi.start_line.into());
    map.put("end_line".into(), poi.end_line.into());
    map
}

#[async_trait]
impl GraphSink for Neo4jGraph {
    async fn merge_pois(&self, pois: &[PoiRecord]) -> Result<(), GraphError> {
        // Labels cannot be parameterized; group rows per label and UNWIND
        // each group as one round trip
        let mut by_label: std::collections::BTreeMap<String, Vec<BoltType>> =
            std::collections::BTreeMap::new();
        for poi in pois {
            let label = node_label(&poi.poi_type)?;
            by_label
                .entry(label)
                .or_default()
                .push(BoltType::Map(poi_row(poi)));
        }

        for (label, rows) in by_label {
            let count = rows.len();
            let rows = BoltType::List(BoltList::from(rows));
            let cypher = format!(
                "UNWIND $rows AS row \
                 MERGE (p:{} {{poi_id: row.poi_id}}) \
                 SET p.name = row.name, \
                     p.poi_type = row.poi_type, \
                     p.file_path = row.file_path, \
                     p.start_line = row.start_line, \
                     p.end_line = row.end_line",
                label
            );
            let mut stream = self.graph.execute(query(&cypher).param("rows", rows)).await?;
            while stream.next().await?.is_some() {}
            debug!(label = %label, count, "Merged POI nodes");
        }
        Ok(())
    }

    async fn merge_relationship(&self, relationship: &GraphRelationship) -> Result<(), GraphError> {
        let edge = edge_type(&relationship.relationship_type)?;
        let cypher = format!(
            "MATCH (a {{poi_id: $from_poi_id}}) \
             MATCH (b {{poi_id: $to_poi_id}}) \
             MERGE (a)-[r:{}]->(b) \
             SET r.confidence = $confidence",
            edge
        );
        let mut stream = self
            .graph
            .execute(
                query(&cypher)
                    .param("from_poi_id", relationship.from_poi_id.as_str())
                    .param("to_poi_id", relationship.to_poi_id.as_str())
                    .param("confidence", relationship.confidence_score),
            )
            .await?;
        while stream.next().await?.is_some() {}
        Ok(())
    }

    async fn clear(&self) -> Result<(), GraphError> {
        self.graph
            .run(query("MATCH (n) WHERE n.poi_id IS NOT NULL DETACH DELETE n"))
            .await?;
        info!("Graph store cleared");
        Ok(())
    }

    async fn node_count(&self) -> Result<u64, GraphError> {
        let mut stream = self
            .graph
            .execute(query(
                "MATCH (n) WHERE n.poi_id IS NOT NULL RETURN count(n) AS count",
            ))
            .await?;
        if let Some(row) = stream.next().await? {
            let count: i64 = row
                .get("count")
                .map_err(|e| GraphError::Query(e.to_string()))?;
            return Ok(count as u64);
        }
        Ok(0)
    }
}
