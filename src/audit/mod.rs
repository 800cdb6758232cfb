//! Audit Ledger (§4.5): durable per-study audit record guaranteeing at-most-once persistence
//! per study and powering resume.

pub mod export;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::AnyPool;
use tracing::warn;

use crate::error::CoreResult;

/// `(rel_path, study_uid, tag, tag_name, action, old_value, new_value)` — §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Replaced,
    Added,
    Removed,
    Retained,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub rel_path: String,
    pub study_uid: String,
    pub tag_code: String,
    pub tag_name: String,
    pub action: AuditAction,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// A single deduplicated tag entry inside a leaf's `summary_json`.
///
/// Dedup rule (§4.5): keyed by tag code; the first observed `old_value` is retained, each
/// subsequent `new_value` overwrites. `conflicting` records whether more than one distinct
/// `new_value` was observed for this tag within the leaf (DESIGN.md open-question decision #3)
/// — it does not change which value is persisted, it only makes the ambiguity observable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagAuditEntry {
    pub tag_code: String,
    pub tag_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    #[serde(default)]
    pub conflicting: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeafSummaryPayload {
    pub tags: Vec<TagAuditEntry>,
}

/// Fold a stream of per-file [`AuditEvent`]s for one leaf into a deduplicated payload.
pub fn dedup_leaf_events(events: &[AuditEvent]) -> LeafSummaryPayload {
    let mut by_tag: HashMap<String, TagAuditEntry> = HashMap::new();
    for event in events {
        by_tag
            .entry(event.tag_code.clone())
            .and_modify(|entry| {
                if event.new_value != entry.new_value {
                    if entry.new_value.is_some() && event.new_value.is_some() {
                        entry.conflicting = true;
                        warn!(
                            tag = %event.tag_code,
                            study_uid = %event.study_uid,
                            "conflicting new_value observed for tag within leaf"
                        );
                    }
                    entry.new_value = event.new_value.clone();
                }
            })
            .or_insert_with(|| TagAuditEntry {
                tag_code: event.tag_code.clone(),
                tag_name: event.tag_name.clone(),
                old_value: event.old_value.clone(),
                new_value: event.new_value.clone(),
                conflicting: false,
            });
    }
    let mut tags: Vec<TagAuditEntry> = by_tag.into_values().collect();
    tags.sort_by(|a, b| a.tag_code.cmp(&b.tag_code));
    LeafSummaryPayload { tags }
}

#[derive(Debug, Clone, Default)]
pub struct LeafCounts {
    pub files_total: u64,
    pub files_written: u64,
    pub files_reused: u64,
    pub files_with_errors: u64,
}

pub struct AuditLedger {
    pool: AnyPool,
}

impl AuditLedger {
    pub fn new(pool: AnyPool) -> Self {
        AuditLedger { pool }
    }

    pub async fn bootstrap(&self) -> CoreResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS anonymize_study_audit (
                study_instance_uid TEXT PRIMARY KEY,
                cohort_name TEXT NOT NULL,
                leaf_rel_path TEXT NOT NULL,
                completed_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS anonymize_leaf_summary (
                study_instance_uid TEXT PRIMARY KEY,
                cohort_name TEXT NOT NULL,
                leaf_rel_path TEXT NOT NULL,
                files_total INTEGER NOT NULL,
                files_written INTEGER NOT NULL,
                files_reused INTEGER NOT NULL,
                files_with_errors INTEGER NOT NULL,
                summary_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `study_audit_complete(uid)`: presence of a row means "never reprocess for audit".
    pub async fn exists(&self, study_uid: &str) -> CoreResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM anonymize_study_audit WHERE study_instance_uid = ?")
                .bind(study_uid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Insert-if-absent completion marker.
    pub async fn mark_complete(
        &self,
        study_uid: &str,
        cohort_name: &str,
        leaf_rel_path: &str,
    ) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO anonymize_study_audit (study_instance_uid, cohort_name, leaf_rel_path, completed_at)
             VALUES (?, ?, ?, datetime('now'))
             ON CONFLICT (study_instance_uid) DO NOTHING",
        )
        .bind(study_uid)
        .bind(cohort_name)
        .bind(leaf_rel_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert of the leaf's summary row.
    pub async fn record_summary(
        &self,
        study_uid: &str,
        cohort_name: &str,
        leaf_rel_path: &str,
        counts: &LeafCounts,
        payload: &LeafSummaryPayload,
    ) -> CoreResult<()> {
        let summary_json = serde_json::to_string(payload).map_err(|e| {
            crate::error::CoreError::Other {
                message: format!("failed to serialize leaf summary: {e}"),
            }
        })?;
        sqlx::query(
            "INSERT INTO anonymize_leaf_summary
                (study_instance_uid, cohort_name, leaf_rel_path, files_total, files_written,
                 files_reused, files_with_errors, summary_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'), datetime('now'))
             ON CONFLICT (study_instance_uid) DO UPDATE SET
                files_total = excluded.files_total,
                files_written = excluded.files_written,
                files_reused = excluded.files_reused,
                files_with_errors = excluded.files_with_errors,
                summary_json = excluded.summary_json,
                updated_at = datetime('now')",
        )
        .bind(study_uid)
        .bind(cohort_name)
        .bind(leaf_rel_path)
        .bind(counts.files_total as i64)
        .bind(counts.files_written as i64)
        .bind(counts.files_reused as i64)
        .bind(counts.files_with_errors as i64)
        .bind(summary_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Commit a leaf's audit in a single logical operation: `recordSummary` then `markComplete`.
    /// Only called when the leaf produced at least one non-errored result (§4.3 step 5).
    pub async fn finalize_leaf(
        &self,
        study_uid: &str,
        cohort_name: &str,
        leaf_rel_path: &str,
        counts: &LeafCounts,
        events: &[AuditEvent],
    ) -> CoreResult<()> {
        let payload = dedup_leaf_events(events);
        self.record_summary(study_uid, cohort_name, leaf_rel_path, counts, &payload)
            .await?;
        self.mark_complete(study_uid, cohort_name, leaf_rel_path)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(tag: &str, old: Option<&str>, new: Option<&str>) -> AuditEvent {
        AuditEvent {
            rel_path: "P1/a.dcm".to_string(),
            study_uid: "1.2.3".to_string(),
            tag_code: tag.to_string(),
            tag_name: tag.to_string(),
            action: AuditAction::Replaced,
            old_value: old.map(str::to_string),
            new_value: new.map(str::to_string),
        }
    }

    #[test]
    fn dedup_keeps_first_old_and_last_new() {
        let events = vec![
            event("(0010,0020)", Some("A"), Some("SUBJ0001")),
            event("(0010,0020)", Some("A"), Some("SUBJ0001")),
        ];
        let payload = dedup_leaf_events(&events);
        assert_eq!(payload.tags.len(), 1);
        assert_eq!(payload.tags[0].old_value.as_deref(), Some("A"));
        assert_eq!(payload.tags[0].new_value.as_deref(), Some("SUBJ0001"));
        assert!(!payload.tags[0].conflicting);
    }

    #[test]
    fn dedup_flags_conflicting_new_values() {
        let events = vec![
            event("(0008,0020)", Some("20240101"), Some("M00")),
            event("(0008,0020)", Some("20240101"), Some("M06")),
        ];
        let payload = dedup_leaf_events(&events);
        assert_eq!(payload.tags[0].new_value.as_deref(), Some("M06"));
        assert!(payload.tags[0].conflicting);
    }
}
