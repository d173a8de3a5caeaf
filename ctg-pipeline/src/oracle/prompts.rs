//! Prompt builders for the three oracle analysis scopes
//!
//! Each scope gets a fixed system framing demanding JSON-only output and a
//! user payload assembled from pipeline state. The corrective suffix is
//! appended for the single reparse attempt after a schema failure.

use crate::oracle::OracleRequest;
use ctg_common::db::models::PoiRecord;

/// Appended to the user prompt when the first response failed schema
/// validation.
pub const CORRECTIVE_SUFFIX: &str = "\n\nYour previous response was not valid JSON matching the \
required schema. Respond again with ONLY the JSON object, no prose, no markdown fences.";

const FILE_ANALYSIS_SYSTEM: &str = r#"You are a code analysis engine extracting Points of Interest and relationships from source files.

For every file you receive, identify:
- POIs: functions, classes, methods, exported variables, and the file itself
- Intra-file relationships: calls, references, contains between those POIs

RESPONSE FORMAT (JSON ONLY, no prose, no markdown fences):
{
  "files": [
    {
      "path": "<path exactly as given>",
      "pois": [
        {"type": "function", "name": "<identifier>", "start_line": 1, "end_line": 10}
      ],
      "relationships": [
        {"from": "<poi name>", "to": "<poi name>", "type": "calls", "confidence": 0.9}
      ]
    }
  ]
}

REQUIREMENTS:
- Use only names that appear in your own pois arrays
- type is one of: function, class, method, variable, file
- relationship type is one of: calls, imports, references, contains
- confidence is your certainty in [0,1]; omit relationships you cannot ground in the code
- Line numbers are 1-based"#;

const DIRECTORY_SYSTEM: &str = r#"You are a code analysis engine inferring relationships between Points of Interest that live in the same directory.

You receive a directory path and its POIs, each with a stable id. Report
relationships between POIs of DIFFERENT files, plus a one-paragraph summary
of the directory's purpose.

RESPONSE FORMAT (JSON ONLY, no prose, no markdown fences):
{
  "summary": "<one paragraph>",
  "relationships": [
    {"from_poi_id": "<id>", "to_poi_id": "<id>", "type": "calls", "confidence": 0.7}
  ]
}

REQUIREMENTS:
- Use only poi ids given to you; never invent ids
- relationship type is one of: calls, imports, references, contains
- confidence is your certainty in [0,1]"#;

const GLOBAL_SYSTEM: &str = r#"You are a code analysis engine judging candidate relationships between Points of Interest from different directories.

You receive candidate pairs surfaced by name-match hints. For each pair,
decide whether a real relationship exists and of which kind.

RESPONSE FORMAT (JSON ONLY, no prose, no markdown fences):
{
  "relationships": [
    {"from_poi_id": "<id>", "to_poi_id": "<id>", "type": "references", "confidence": 0.6}
  ]
}

REQUIREMENTS:
- Use only poi ids given to you; never invent ids
- Omit pairs with no real relationship
- relationship type is one of: calls, imports, references, contains
- confidence is your certainty in [0,1]"#;

/// Build the batch file-analysis request.
pub fn file_analysis(files: &[(String, String)]) -> OracleRequest {
    let mut user = String::from("Analyze the following source files.\n");
    for (path, content) in files {
        user.push_str(&format!("\n=== FILE: {} ===\n{}\n", path, content));
    }
    OracleRequest {
        system: FILE_ANALYSIS_SYSTEM.to_string(),
        user,
    }
}

/// Build the directory-scope request over an aggregated POI set.
pub fn directory_resolution(directory_path: &str, pois: &[PoiRecord]) -> OracleRequest {
    let mut user = format!("Directory: {}\n\nPOIs:\n", directory_path);
    for poi in pois {
        user.push_str(&format!(
            "- id={} type={} name={} file={} lines={}-{}\n",
            poi.poi_id, poi.poi_type, poi.name, poi.file_path, poi.start_line, poi.end_line
        ));
    }
    OracleRequest {
        system: DIRECTORY_SYSTEM.to_string(),
        user,
    }
}

/// Build the global-scope request over hinted cross-directory pairs.
pub fn global_resolution(pairs: &[(PoiRecord, PoiRecord)]) -> OracleRequest {
    let mut user = String::from("Candidate cross-directory pairs:\n");
    for (from, to) in pairs {
        user.push_str(&format!(
            "- from: id={} type={} name={} file={}\n  to: id={} type={} name={} file={}\n",
            from.poi_id, from.poi_type, from.name, from.file_path,
            to.poi_id, to.poi_type, to.name, to.file_path
        ));
    }
    OracleRequest {
        system: GLOBAL_SYSTEM.to_string(),
        user,
    }
}

/// The reparse attempt re-sends the same user payload with the corrective
/// suffix appended.
pub fn with_corrective_suffix(request: &OracleRequest) -> OracleRequest {
    OracleRequest {
        system: request.system.clone(),
        user: format!("{}{}", request.user, CORRECTIVE_SUFFIX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_analysis_includes_all_files() {
        let request = file_analysis(&[
            ("src/a.js".to_string(), "function a() {}".to_string()),
            ("src/b.js".to_string(), "function b() {}".to_string()),
        ]);
        assert!(request.user.contains("=== FILE: src/a.js ==="));
        assert!(request.user.contains("=== FILE: src/b.js ==="));
        assert!(request.system.contains("JSON ONLY"));
    }

    #[test]
    fn test_corrective_suffix_appends_once() {
        let request = file_analysis(&[("a.js".to_string(), "x".to_string())]);
        let corrected = with_corrective_suffix(&request);
        assert!(corrected.user.ends_with(CORRECTIVE_SUFFIX));
        assert_eq!(corrected.system, request.system);
        assert!(corrected.user.starts_with(&request.user));
    }
}
