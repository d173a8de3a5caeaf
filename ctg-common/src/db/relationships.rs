//! Accepted relationship access
//!
//! Reconciliation promotes evidence groups into this table. The unique key
//! is (from, to, type); re-promotion keeps the higher confidence and merges
//! metadata source tags.

use crate::db::models::AcceptedRelationship;
use crate::Result;
use serde_json::Value;
use sqlx::SqlitePool;

/// Upsert an accepted relationship.
///
/// Duplicate keys keep the higher confidence score; the `sources` array in
/// metadata is merged as a set union so repeated promotion is idempotent.
pub async fn upsert_accepted(
    pool: &SqlitePool,
    from_poi_id: &str,
    to_poi_id: &str,
    relationship_type: &str,
    confidence_score: f64,
    metadata: Option<Value>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = upsert_accepted_tx(
        &mut tx,
        from_poi_id,
        to_poi_id,
        relationship_type,
        confidence_score,
        metadata,
    )
    .await?;
    tx.commit().await?;
    Ok(id)
}

/// Same as [`upsert_accepted`] inside a caller-owned transaction, so the
/// promotion commits atomically with its outbox event.
pub async fn upsert_accepted_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    from_poi_id: &str,
    to_poi_id: &str,
    relationship_type: &str,
    confidence_score: f64,
    metadata: Option<Value>,
) -> Result<i64> {
    let existing: Option<(f64, Option<String>)> = sqlx::query_as(
        "SELECT confidence_score, metadata FROM relationships
         WHERE from_poi_id = ? AND to_poi_id = ? AND relationship_type = ?",
    )
    .bind(from_poi_id)
    .bind(to_poi_id)
    .bind(relationship_type)
    .fetch_optional(&mut **tx)
    .await?;

    let (final_confidence, final_metadata) = match existing {
        None => (confidence_score, metadata),
        Some((old_confidence, old_metadata)) => {
            let old_metadata = old_metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?;
            (
                old_confidence.max(confidence_score),
                merge_metadata(old_metadata, metadata),
            )
        }
    };

    let metadata_json = final_metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO relationships
            (from_poi_id, to_poi_id, relationship_type, confidence_score, metadata)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(from_poi_id, to_poi_id, relationship_type) DO UPDATE SET
            confidence_score = excluded.confidence_score,
            metadata = excluded.metadata,
            updated_at = CURRENT_TIMESTAMP
        RETURNING id
        "#,
    )
    .bind(from_poi_id)
    .bind(to_poi_id)
    .bind(relationship_type)
    .bind(final_confidence)
    .bind(metadata_json)
    .fetch_one(&mut **tx)
    .await?;

    Ok(id)
}

/// Merge relationship metadata objects, unioning the `sources` tag array.
///
/// Non-`sources` keys from the newer object win; this is only called with
/// objects produced by reconciliation.
pub fn merge_metadata(existing: Option<Value>, incoming: Option<Value>) -> Option<Value> {
    match (existing, incoming) {
        (None, incoming) => incoming,
        (existing, None) => existing,
        (Some(mut old), Some(new)) => {
            let mut sources: Vec<String> = tag_list(&old);
            for tag in tag_list(&new) {
                if !sources.contains(&tag) {
                    sources.push(tag);
                }
            }

            if let (Some(old_map), Some(new_map)) = (old.as_object_mut(), new.as_object()) {
                for (key, value) in new_map {
                    old_map.insert(key.clone(), value.clone());
                }
                old_map.insert("sources".to_string(), Value::from(sources));
                Some(old)
            } else {
                // Non-object metadata: newer value replaces older
                Some(new)
            }
        }
    }
}

fn tag_list(metadata: &Value) -> Vec<String> {
    metadata
        .get("sources")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub async fn load_all(pool: &SqlitePool) -> Result<Vec<AcceptedRelationship>> {
    let rows: Vec<(i64, String, String, String, f64, Option<String>)> = sqlx::query_as(
        "SELECT id, from_poi_id, to_poi_id, relationship_type, confidence_score, metadata
         FROM relationships ORDER BY id",
    )
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|(id, from_poi_id, to_poi_id, relationship_type, confidence_score, metadata)| {
            let metadata = metadata.as_deref().map(serde_json::from_str).transpose()?;
            Ok(AcceptedRelationship {
                id,
                from_poi_id,
                to_poi_id,
                relationship_type,
                confidence_score,
                metadata,
            })
        })
        .collect()
}

pub async fn get(
    pool: &SqlitePool,
    from_poi_id: &str,
    to_poi_id: &str,
    relationship_type: &str,
) -> Result<Option<AcceptedRelationship>> {
    let row: Option<(i64, String, String, String, f64, Option<String>)> = sqlx::query_as(
        "SELECT id, from_poi_id, to_poi_id, relationship_type, confidence_score, metadata
         FROM relationships
         WHERE from_poi_id = ? AND to_poi_id = ? AND relationship_type = ?",
    )
    .bind(from_poi_id)
    .bind(to_poi_id)
    .bind(relationship_type)
    .fetch_optional(pool)
    .await?;

    row.map(|(id, from_poi_id, to_poi_id, relationship_type, confidence_score, metadata)| {
        let metadata = metadata.as_deref().map(serde_json::from_str).transpose()?;
        Ok(AcceptedRelationship {
            id,
            from_poi_id,
            to_poi_id,
            relationship_type,
            confidence_score,
            metadata,
        })
    })
    .transpose()
}

pub async fn count(pool: &SqlitePool) -> Result<u64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM relationships")
        .fetch_one(pool)
        .await?;
    Ok(count as u64)
}
