//! Oracle response schemas and parsing
//!
//! The oracle is asked for JSON-only output but models occasionally wrap
//! bodies in markdown fences or prose; `extract_json` peels that off before
//! serde validation. Parse failures here trigger the single corrective
//! reparse attempt in the calling worker.

use serde::Deserialize;

/// Structured output of a file-analysis batch call
#[derive(Debug, Clone, Deserialize)]
pub struct FileAnalysis {
    pub files: Vec<FileFindings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileFindings {
    pub path: String,
    #[serde(default)]
    pub pois: Vec<OraclePoi>,
    #[serde(default)]
    pub relationships: Vec<NamedRelationship>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OraclePoi {
    #[serde(rename = "type")]
    pub poi_type: String,
    pub name: String,
    pub start_line: i64,
    pub end_line: i64,
}

/// Intra-file relationship, endpoints referenced by POI name
#[derive(Debug, Clone, Deserialize)]
pub struct NamedRelationship {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub confidence: f64,
}

/// Structured output of a directory-resolution call
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryAnalysis {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub relationships: Vec<IdRelationship>,
}

/// Structured output of a global-resolution call
#[derive(Debug, Clone, Deserialize)]
pub struct GlobalAnalysis {
    #[serde(default)]
    pub relationships: Vec<IdRelationship>,
}

/// Relationship with endpoints referenced by stable poi id
#[derive(Debug, Clone, Deserialize)]
pub struct IdRelationship {
    pub from_poi_id: String,
    pub to_poi_id: String,
    #[serde(rename = "type")]
    pub relationship_type: String,
    pub confidence: f64,
}

/// Locate the JSON object inside an oracle body, tolerating markdown fences
/// and surrounding prose.
pub fn extract_json(body: &str) -> Option<&str> {
    let start = body.find('{')?;
    let end = body.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&body[start..=end])
}

pub fn parse_file_analysis(body: &str) -> Result<FileAnalysis, serde_json::Error> {
    parse(body)
}

pub fn parse_directory_analysis(body: &str) -> Result<DirectoryAnalysis, serde_json::Error> {
    parse(body)
}

pub fn parse_global_analysis(body: &str) -> Result<GlobalAnalysis, serde_json::Error> {
    parse(body)
}

fn parse<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, serde_json::Error> {
    let json = extract_json(body).unwrap_or(body);
    serde_json::from_str(json)
}
