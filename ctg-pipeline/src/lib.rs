//! ctg-pipeline - Cognitive Triangulation Pipeline
//!
//! Ingests a source tree and produces a knowledge graph of code Points of
//! Interest whose relationships are accepted only when evidence from
//! several independent analysis scopes converges.
//!
//! The pipeline is queue-driven: discovery batches files, analysis workers
//! ask the oracle for findings, validation and reconciliation turn noisy
//! evidence into accepted relationships, and the graph builder materializes
//! them into Neo4j. Every cross-worker hop is a broker queue; every durable
//! write lands in SQLite first and is announced through the transactional
//! outbox.

pub mod broker;
pub mod error;
pub mod extract;
pub mod graph;
pub mod ingest;
pub mod oracle;
pub mod outbox_publisher;
pub mod pipeline;
pub mod workers;
