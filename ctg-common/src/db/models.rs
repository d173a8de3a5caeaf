//! Row types and domain enums shared across CTG modules

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File lifecycle status
///
/// Transitions are strictly monotone: discovered → analyzing →
/// (analyzed | failed). Backward moves are rejected at the query layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Discovered,
    Analyzing,
    Analyzed,
    Failed,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Discovered => "discovered",
            FileStatus::Analyzing => "analyzing",
            FileStatus::Analyzed => "analyzed",
            FileStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "discovered" => Ok(FileStatus::Discovered),
            "analyzing" => Ok(FileStatus::Analyzing),
            "analyzed" => Ok(FileStatus::Analyzed),
            "failed" => Ok(FileStatus::Failed),
            other => Err(Error::Lifecycle(format!("unknown file status: {}", other))),
        }
    }

    /// Position in the lifecycle ordering; terminal states share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            FileStatus::Discovered => 0,
            FileStatus::Analyzing => 1,
            FileStatus::Analyzed | FileStatus::Failed => 2,
        }
    }
}

/// Analysis scope that produced an evidence row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceSource {
    Deterministic,
    IntraFile,
    IntraDirectory,
    Global,
}

impl EvidenceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceSource::Deterministic => "deterministic",
            EvidenceSource::IntraFile => "intra_file",
            EvidenceSource::IntraDirectory => "intra_directory",
            EvidenceSource::Global => "global",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "deterministic" => Ok(EvidenceSource::Deterministic),
            "intra_file" => Ok(EvidenceSource::IntraFile),
            "intra_directory" => Ok(EvidenceSource::IntraDirectory),
            "global" => Ok(EvidenceSource::Global),
            other => Err(Error::Lifecycle(format!(
                "unknown evidence source: {}",
                other
            ))),
        }
    }
}

/// Outbox row status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// A source file tracked by the pipeline
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub content_hash: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub status: FileStatus,
}

/// A Point of Interest extracted from a source file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoiRecord {
    pub id: i64,
    pub poi_id: String,
    pub file_id: i64,
    pub poi_type: String,
    pub name: String,
    pub file_path: String,
    pub directory_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub metadata: Option<serde_json::Value>,
}

/// New POI pending insertion
#[derive(Debug, Clone)]
pub struct NewPoi {
    pub poi_id: String,
    pub file_id: i64,
    pub poi_type: String,
    pub name: String,
    pub file_path: String,
    pub start_line: i64,
    pub end_line: i64,
    pub metadata: Option<serde_json::Value>,
}

/// A single relationship observation, append-only once written
#[derive(Debug, Clone)]
pub struct EvidenceRecord {
    pub id: i64,
    pub from_poi_id: String,
    pub to_poi_id: String,
    pub relationship_type: String,
    pub evidence_source: EvidenceSource,
    pub confidence: f64,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// New evidence row pending insertion
#[derive(Debug, Clone)]
pub struct NewEvidence {
    pub from_poi_id: String,
    pub to_poi_id: String,
    pub relationship_type: String,
    pub evidence_source: EvidenceSource,
    pub confidence: f64,
    pub metadata: Option<serde_json::Value>,
}

/// A relationship that survived reconciliation
#[derive(Debug, Clone)]
pub struct AcceptedRelationship {
    pub id: i64,
    pub from_poi_id: String,
    pub to_poi_id: String,
    pub relationship_type: String,
    pub confidence_score: f64,
    pub metadata: Option<serde_json::Value>,
}

/// A pending or processed outbox event
#[derive(Debug, Clone)]
pub struct OutboxEventRecord {
    pub id: i64,
    pub event_type: String,
    pub queue_name: String,
    pub payload: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Derive the stable POI identifier from its identity fields.
///
/// The identifier must be reproducible across runs so that evidence written
/// by different analysis scopes converges on the same key.
pub fn derive_poi_id(file_path: &str, poi_type: &str, name: &str, start_line: i64) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(poi_type.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(name.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(start_line.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parent directory of a file path, normalized to "." for top-level files.
pub fn directory_of(file_path: &str) -> String {
    match std::path::Path::new(file_path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().to_string(),
        _ => ".".to_string(),
    }
}
