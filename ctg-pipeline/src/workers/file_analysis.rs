//! File analysis worker
//!
//! Consumes `file-analysis-queue` batches: runs the deterministic regex
//! pre-pass, asks the oracle for POIs and intra-file relationships, and
//! commits all findings plus downstream outbox events in one transaction.
//! The oracle call never overlaps an open transaction.

use crate::broker::{names, JobEnvelope};
use crate::error::JobError;
use crate::extract;
use crate::oracle::response::{self, FileAnalysis};
use crate::oracle::{prompts, Oracle, OracleError};
use crate::workers::validation::canonical_type;
use crate::workers::{dedup_keys, CandidateKey, JobHandler};
use async_trait::async_trait;
use ctg_common::db::models::{
    derive_poi_id, directory_of, EvidenceSource, FileStatus, NewEvidence, NewPoi,
};
use ctg_common::db::{evidence, files, outbox, pois};
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct FileBatchData {
    run_id: Uuid,
    batch_id: Uuid,
    files: Vec<FileRef>,
}

#[derive(Debug, Deserialize)]
struct FileRef {
    file_id: i64,
    path: String,
}

/// Dependencies of the file analysis worker
pub struct FileAnalysisWorker {
    pub db: SqlitePool,
    pub oracle: Arc<dyn Oracle>,
    pub target_root: PathBuf,
}

#[async_trait]
impl JobHandler for FileAnalysisWorker {
    async fn handle(&self, job: &JobEnvelope) -> Result<(), JobError> {
        let data: FileBatchData = serde_json::from_value(job.data().clone())?;

        // Replay guard: a redelivered batch whose files all reached a
        // terminal state has already been committed
        let mut records = Vec::with_capacity(data.files.len());
        for file_ref in &data.files {
            match files::get_by_id(&self.db, file_ref.file_id).await? {
                Some(record) => records.push(record),
                None => {
                    return Err(JobError::fatal(format!(
                        "batch {} references unknown file id {}",
                        data.batch_id, file_ref.file_id
                    )))
                }
            }
        }
        if records
            .iter()
            .all(|r| matches!(r.status, FileStatus::Analyzed | FileStatus::Failed))
        {
            debug!(batch_id = %data.batch_id, "Batch already processed, acknowledging replay");
            return Ok(());
        }

        // Read contents; a vanished file fails alone, not the batch
        let mut contents: Vec<(i64, String, String)> = Vec::new();
        let mut unreadable: Vec<i64> = Vec::new();
        for record in &records {
            match tokio::fs::read_to_string(self.target_root.join(&record.path)).await {
                Ok(content) => contents.push((record.id, record.path.clone(), content)),
                Err(err) => {
                    warn!(path = %record.path, error = %err, "File unreadable at analysis time");
                    unreadable.push(record.id);
                }
            }
        }

        // Deterministic pre-pass runs before any oracle traffic
        let mut deterministic_rows: Vec<NewEvidence> = Vec::new();
        for (_, path, content) in &contents {
            for edge in extract::extract_imports(path, content) {
                deterministic_rows.push(NewEvidence {
                    from_poi_id: file_poi_id(&edge.from_path),
                    to_poi_id: file_poi_id(&edge.to_path),
                    relationship_type: canonical_type(edge.relationship_type),
                    evidence_source: EvidenceSource::Deterministic,
                    confidence: 1.0,
                    metadata: Some(json!({"line": edge.line, "to_path": edge.to_path})),
                });
            }
        }

        let analysis = if contents.is_empty() {
            FileAnalysis { files: Vec::new() }
        } else {
            let prompt_files: Vec<(String, String)> = contents
                .iter()
                .map(|(_, path, content)| (path.clone(), content.clone()))
                .collect();
            self.analyze_with_reparse(&prompt_files).await?
        };

        // Assemble POIs and intra-file evidence per analyzed file
        let findings_by_path: HashMap<&str, &response::FileFindings> = analysis
            .files
            .iter()
            .map(|f| (f.path.as_str(), f))
            .collect();

        let mut new_pois: Vec<NewPoi> = Vec::new();
        let mut intra_file_rows: Vec<NewEvidence> = Vec::new();
        let mut analyzed_ids: Vec<i64> = Vec::new();
        let mut failed_ids: Vec<i64> = unreadable;

        for (file_id, path, _) in &contents {
            let file_poi = NewPoi {
                poi_id: file_poi_id(path),
                file_id: *file_id,
                poi_type: "file".to_string(),
                name: basename(path),
                file_path: path.clone(),
                start_line: 0,
                end_line: 0,
                metadata: None,
            };

            let findings = match findings_by_path.get(path.as_str()) {
                Some(findings) => findings,
                None => {
                    // Oracle omitted the file; its extraction is skipped
                    // without aborting siblings
                    warn!(path = %path, "Oracle response omitted file, marking failed");
                    failed_ids.push(*file_id);
                    continue;
                }
            };

            let mut name_to_poi: HashMap<&str, String> = HashMap::new();
            name_to_poi.insert(findings.path.as_str(), file_poi.poi_id.clone());
            let file_name = file_poi.name.clone();
            let file_poi_stable = file_poi.poi_id.clone();
            new_pois.push(file_poi);
            name_to_poi.insert(file_name.as_str(), file_poi_stable);

            for poi in &findings.pois {
                if poi.poi_type == "file" {
                    continue; // the file POI is synthesized above
                }
                let stable_id = derive_poi_id(path, &poi.poi_type, &poi.name, poi.start_line);
                name_to_poi.insert(poi.name.as_str(), stable_id.clone());
                new_pois.push(NewPoi {
                    poi_id: stable_id,
                    file_id: *file_id,
                    poi_type: poi.poi_type.clone(),
                    name: poi.name.clone(),
                    file_path: path.clone(),
                    start_line: poi.start_line,
                    end_line: poi.end_line.max(poi.start_line),
                    metadata: None,
                });
            }

            for relationship in &findings.relationships {
                let (Some(from), Some(to)) = (
                    name_to_poi.get(relationship.from.as_str()),
                    name_to_poi.get(relationship.to.as_str()),
                ) else {
                    debug!(
                        path = %path,
                        from = %relationship.from,
                        to = %relationship.to,
                        "Skipping relationship with unresolvable endpoint name"
                    );
                    continue;
                };
                intra_file_rows.push(NewEvidence {
                    from_poi_id: from.clone(),
                    to_poi_id: to.clone(),
                    relationship_type: canonical_type(&relationship.relationship_type),
                    evidence_source: EvidenceSource::IntraFile,
                    confidence: relationship.confidence.clamp(0.0, 1.0),
                    metadata: Some(json!({"batch_id": data.batch_id})),
                });
            }

            analyzed_ids.push(*file_id);
        }

        let directories: BTreeSet<String> = records
            .iter()
            .filter(|r| analyzed_ids.contains(&r.id))
            .map(|r| directory_of(&r.path))
            .collect();

        let candidates = dedup_keys(
            deterministic_rows
                .iter()
                .chain(intra_file_rows.iter())
                .map(|row| CandidateKey {
                    from_poi_id: row.from_poi_id.clone(),
                    to_poi_id: row.to_poi_id.clone(),
                    relationship_type: row.relationship_type.clone(),
                })
                .collect(),
        );

        // Single transaction: POIs, evidence, status moves, outbox events
        let mut tx = self
            .db
            .begin()
            .await
            .map_err(|e| JobError::retryable(format!("begin tx: {}", e)))?;

        pois::upsert_pois(&mut tx, &new_pois).await?;
        for row in deterministic_rows.iter().chain(intra_file_rows.iter()) {
            evidence::insert_tx(&mut tx, row).await?;
        }
        for file_id in &analyzed_ids {
            files::advance_status_tx(&mut tx, *file_id, FileStatus::Analyzed).await?;
        }
        for file_id in &failed_ids {
            files::advance_status_tx(&mut tx, *file_id, FileStatus::Failed).await?;
        }

        for directory in &directories {
            outbox::insert_tx(
                &mut tx,
                "directory-aggregation",
                names::DIRECTORY_AGGREGATION,
                &json!({
                    "event_type": "directory-aggregation",
                    "data": {"run_id": data.run_id, "directory_path": directory}
                }),
            )
            .await?;
        }

        if !candidates.is_empty() {
            outbox::insert_tx(
                &mut tx,
                "relationship-candidates",
                names::ANALYSIS_FINDINGS,
                &json!({
                    "event_type": "relationship-candidates",
                    "data": {"run_id": data.run_id, "candidates": candidates}
                }),
            )
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| JobError::retryable(format!("commit: {}", e)))?;

        info!(
            batch_id = %data.batch_id,
            analyzed = analyzed_ids.len(),
            failed = failed_ids.len(),
            pois = new_pois.len(),
            directories = directories.len(),
            "File batch analyzed"
        );
        Ok(())
    }
}

impl FileAnalysisWorker {
    /// One oracle call plus at most one corrective reparse attempt.
    async fn analyze_with_reparse(
        &self,
        files: &[(String, String)],
    ) -> Result<FileAnalysis, JobError> {
        let request = prompts::file_analysis(files);
        let body = self.call_oracle(&request).await?;

        match response::parse_file_analysis(&body) {
            Ok(analysis) => Ok(analysis),
            Err(first_err) => {
                warn!(error = %first_err, "Oracle response failed schema, attempting corrective reparse");
                let corrected = prompts::with_corrective_suffix(&request);
                let body = self.call_oracle(&corrected).await?;
                response::parse_file_analysis(&body).map_err(|err| {
                    JobError::fatal(format!("oracle response schema-invalid after reparse: {}", err))
                })
            }
        }
    }

    async fn call_oracle(&self, request: &crate::oracle::OracleRequest) -> Result<String, JobError> {
        match self.oracle.call(request).await {
            Ok(response) => Ok(response.body),
            Err(err) => Err(map_oracle_error(err)),
        }
    }
}

pub(crate) fn map_oracle_error(err: OracleError) -> JobError {
    if err.is_retryable() {
        JobError::retryable(err)
    } else {
        JobError::fatal(err)
    }
}

/// Stable id for a file's own POI; deterministic edges target files that
/// may not be analyzed yet, so the id must be derivable from the path alone.
pub(crate) fn file_poi_id(path: &str) -> String {
    derive_poi_id(path, "file", &basename(path), 0)
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{OracleRequest, OracleResponse, OracleUsage};
    use ctg_common::db::init::create_schema;
    use std::sync::Mutex;

    /// Scripted oracle: pops canned bodies in order.
    struct MockOracle {
        responses: Mutex<Vec<Result<String, OracleError>>>,
        pub calls: Mutex<Vec<OracleRequest>>,
    }

    impl MockOracle {
        fn new(responses: Vec<Result<String, OracleError>>) -> Self {
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
                return Err(OracleError::Network("no scripted response".into()));
            }
            responses.remove(0).map(|body| OracleResponse {
                body,
                usage: OracleUsage::default(),
            })
        }
    }

    async fn seed(db: &SqlitePool, root: &Path, name: &str, content: &str) -> (i64, String) {
        tokio::fs::write(root.join(name), content).await.unwrap();
        let mut tx = db.begin().await.unwrap();
        let id = files::upsert_file(
            &mut tx,
            name,
            &crate::ingest::batcher::hash_content(content.as_bytes()),
            None,
            FileStatus::Analyzing,
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
        (id, name.to_string())
    }

    fn batch_envelope(run_id: Uuid, files: &[(i64, String)]) -> JobEnvelope {
        let refs: Vec<serde_json::Value> = files
            .iter()
            .map(|(id, path)| json!({"file_id": id, "path": path}))
            .collect();
        JobEnvelope::new(json!({
            "event_type": "file-batch",
            "data": {"run_id": run_id, "batch_id": Uuid::new_v4(), "files": refs}
        }))
    }

    fn oracle_body(path: &str) -> String {
        json!({
            "files": [{
                "path": path,
                "pois": [
                    {"type": "function", "name": "main", "start_line": 1, "end_line": 3},
                    {"type": "function", "name": "helper", "start_line": 5, "end_line": 7}
                ],
                "relationships": [
                    {"from": "main", "to": "helper", "type": "calls", "confidence": 0.9}
                ]
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_batch_produces_pois_evidence_and_events() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        let root = tempfile::tempdir().unwrap();

        let file = seed(&pool, root.path(), "a.js", "import './b';\nfunction main() {}\n").await;
        let oracle = Arc::new(MockOracle::new(vec![Ok(oracle_body("a.js"))]));
        let worker = FileAnalysisWorker {
            db: pool.clone(),
            oracle: oracle.clone(),
            target_root: root.path().to_path_buf(),
        };

        worker
            .handle(&batch_envelope(Uuid::new_v4(), &[file.clone()]))
            .await
            .unwrap();

        // File POI + two oracle POIs
        assert_eq!(pois::count(&pool).await.unwrap(), 3);
        // One deterministic import + one intra-file call
        assert_eq!(evidence::count(&pool).await.unwrap(), 2);
        let record = files::get_by_id(&pool, file.0).await.unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Analyzed);

        // Directory aggregation + candidate events staged in the outbox
        let pending = outbox::fetch_pending(&pool, 10).await.unwrap();
        let queues: Vec<&str> = pending.iter().map(|e| e.queue_name.as_str()).collect();
        assert!(queues.contains(&names::DIRECTORY_AGGREGATION));
        assert!(queues.contains(&names::ANALYSIS_FINDINGS));
    }

    #[tokio::test]
    async fn test_corrective_reparse_recovers() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        let root = tempfile::tempdir().unwrap();

        let file = seed(&pool, root.path(), "a.js", "function main() {}\n").await;
        let oracle = Arc::new(MockOracle::new(vec![
            Ok("I think the answer is maybe".to_string()),
            Ok(oracle_body("a.js")),
        ]));
        let worker = FileAnalysisWorker {
            db: pool.clone(),
            oracle: oracle.clone(),
            target_root: root.path().to_path_buf(),
        };

        worker
            .handle(&batch_envelope(Uuid::new_v4(), &[file]))
            .await
            .unwrap();

        let calls = oracle.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].user.contains("previous response was not valid"));
    }

    #[tokio::test]
    async fn test_schema_invalid_after_reparse_is_fatal() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        let root = tempfile::tempdir().unwrap();

        let file = seed(&pool, root.path(), "a.js", "function main() {}\n").await;
        let oracle = Arc::new(MockOracle::new(vec![
            Ok("not json".to_string()),
            Ok("still not json".to_string()),
        ]));
        let worker = FileAnalysisWorker {
            db: pool.clone(),
            oracle,
            target_root: root.path().to_path_buf(),
        };

        let err = worker
            .handle(&batch_envelope(Uuid::new_v4(), &[file]))
            .await
            .unwrap_err();
        assert!(!err.is_retryable(), "schema failure after reparse must be fatal");
    }

    #[tokio::test]
    async fn test_retryable_oracle_error_propagates() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        let root = tempfile::tempdir().unwrap();

        let file = seed(&pool, root.path(), "a.js", "function main() {}\n").await;
        let oracle = Arc::new(MockOracle::new(vec![Err(OracleError::Api {
            status: 503,
            message: "overloaded".into(),
        })]));
        let worker = FileAnalysisWorker {
            db: pool.clone(),
            oracle,
            target_root: root.path().to_path_buf(),
        };

        let err = worker
            .handle(&batch_envelope(Uuid::new_v4(), &[file]))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_replay_of_terminal_batch_is_noop() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        let root = tempfile::tempdir().unwrap();

        let file = seed(&pool, root.path(), "a.js", "function main() {}\n").await;
        let oracle = Arc::new(MockOracle::new(vec![Ok(oracle_body("a.js"))]));
        let worker = FileAnalysisWorker {
            db: pool.clone(),
            oracle: oracle.clone(),
            target_root: root.path().to_path_buf(),
        };

        let envelope = batch_envelope(Uuid::new_v4(), &[file]);
        worker.handle(&envelope).await.unwrap();
        let evidence_after_first = evidence::count(&pool).await.unwrap();

        // Redelivery after a crash-before-ack must not duplicate findings
        worker.handle(&envelope).await.unwrap();
        assert_eq!(evidence::count(&pool).await.unwrap(), evidence_after_first);
        assert_eq!(oracle.calls.lock().unwrap().len(), 1, "no second oracle call");
    }

    #[tokio::test]
    async fn test_missing_file_fails_alone() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        create_schema(&pool).await.unwrap();
        let root = tempfile::tempdir().unwrap();

        let good = seed(&pool, root.path(), "a.js", "function main() {}\n").await;
        // Row exists but the file is gone from disk
        let mut tx = pool.begin().await.unwrap();
        let missing_id = files::upsert_file(&mut tx, "gone.js", "h", None, FileStatus::Analyzing)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let oracle = Arc::new(MockOracle::new(vec![Ok(oracle_body("a.js"))]));
        let worker = FileAnalysisWorker {
            db: pool.clone(),
            oracle,
            target_root: root.path().to_path_buf(),
        };

        worker
            .handle(&batch_envelope(
                Uuid::new_v4(),
                &[good.clone(), (missing_id, "gone.js".to_string())],
            ))
            .await
            .unwrap();

        assert_eq!(
            files::get_by_id(&pool, good.0).await.unwrap().unwrap().status,
            FileStatus::Analyzed
        );
        assert_eq!(
            files::get_by_id(&pool, missing_id).await.unwrap().unwrap().status,
            FileStatus::Failed
        );
    }
}
