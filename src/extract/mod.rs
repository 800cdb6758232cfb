//! Extraction Engine orchestration (§4.7): one async writer task and a pool of N subject
//! workers, fed by a bounded queue with backpressure.

pub mod subject;
pub mod tags;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::Sender;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::ExtractConfig;
use crate::error::CoreResult;
use crate::progress::ProgressReporter;
use crate::traversal;
use subject::SubjectResolutionSource;
use tags::FieldMap;

/// Emitted by a subject worker for every successfully read, allowed instance (§4.7).
#[derive(Debug, Clone)]
pub struct InstancePayload {
    pub subject_key: String,
    pub subject_code: String,
    pub resolution_source: SubjectResolutionSource,
    pub patient_id: String,
    pub patient_name: String,
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
    pub modality: String,
    pub rel_path: String,
    pub study_fields: FieldMap,
    pub series_fields: FieldMap,
    pub instance_fields: FieldMap,
    pub mri_fields: FieldMap,
    pub ct_fields: FieldMap,
    pub pet_fields: FieldMap,
}

/// Per-series resume state: files already known done by SOP-UID sort order, or by exact path.
#[derive(Debug, Clone, Default)]
pub struct ResumeState {
    pub resume_tokens_by_series: HashMap<String, String>,
    pub completed_paths: HashSet<PathBuf>,
}

pub struct ExtractionEngine {
    config: ExtractConfig,
    csv_mapping: Option<HashMap<String, String>>,
}

impl ExtractionEngine {
    pub fn new(config: ExtractConfig, csv_mapping: Option<HashMap<String, String>>) -> Self {
        ExtractionEngine { config, csv_mapping }
    }

    /// Run the engine against `cohort_root` (the anonymized `dcm-raw` tree), emitting payloads
    /// into `tx`. The caller owns the paired [`crate::writer::Writer`] draining the other end.
    /// Cancellation: when `cancelled` is observed, the main loop stops scheduling new subjects
    /// and awaits outstanding workers before closing `tx`, letting the writer drain the rest of
    /// the queue (§4.7).
    pub async fn run(
        &self,
        cohort_root: &Path,
        resume: &ResumeState,
        tx: Sender<InstancePayload>,
        progress: Option<Arc<ProgressReporter>>,
        cancelled: Arc<std::sync::atomic::AtomicBool>,
    ) -> CoreResult<()> {
        let subject_dirs = traversal::top_level_dirs(cohort_root).map_err(|e| {
            crate::error::CoreError::RootUnavailable {
                path: cohort_root.to_path_buf(),
                source: e,
            }
        })?;
        let total = subject_dirs.len() as u64;
        let seen_subjects = Arc::new(AtomicU64::new(0));
        let semaphore = Arc::new(Semaphore::new(self.config.subject_workers));

        let mut handles = Vec::with_capacity(subject_dirs.len());
        for dir in subject_dirs {
            if cancelled.load(Ordering::Relaxed) {
                break;
            }
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore open");
            let tx = tx.clone();
            let csv_mapping = self.csv_mapping.clone();
            let salt = self.config.subject_code_salt.clone();
            let allowed = self.config.allowed_modalities.clone();
            let use_specific = self.config.use_specific_tags;
            let series_workers = self.config.series_workers_per_subject;
            let resume = resume.clone();
            let progress = progress.clone();
            let seen_subjects = seen_subjects.clone();
            let cancelled = cancelled.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                process_subject(
                    &dir,
                    csv_mapping.as_ref(),
                    &salt,
                    &allowed,
                    use_specific,
                    series_workers,
                    &resume,
                    tx,
                    cancelled,
                )
                .await;
                let done = seen_subjects.fetch_add(1, Ordering::Relaxed) + 1;
                if let Some(p) = &progress {
                    p.advance(1, Some(done));
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.await;
        }
        let _ = total;
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_subject(
    root: &Path,
    csv_mapping: Option<&HashMap<String, String>>,
    salt: &str,
    allowed_modalities: &[String],
    use_specific_tags: bool,
    series_workers: usize,
    resume: &ResumeState,
    tx: Sender<InstancePayload>,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
) {
    let plan = subject::plan_subject(root);
    let semaphore = Arc::new(Semaphore::new(series_workers.max(1)));
    let mut handles = Vec::with_capacity(plan.files.len());

    for path in plan.files {
        if cancelled.load(Ordering::Relaxed) {
            break;
        }
        if resume.completed_paths.contains(&path) {
            continue;
        }
        let permit = semaphore.clone().acquire_owned().await.expect("semaphore open");
        let tx = tx.clone();
        let subject_key = plan.subject_key.clone();
        let csv_mapping = csv_mapping.cloned();
        let salt = salt.to_string();
        let allowed_modalities = allowed_modalities.to_vec();
        let resume_tokens = resume.resume_tokens_by_series.clone();
        let rel_root = root.to_path_buf();

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            read_instance(
                &path,
                &rel_root,
                &subject_key,
                csv_mapping.as_ref(),
                &salt,
                &allowed_modalities,
                &resume_tokens,
                use_specific_tags,
            )
        });
        let tx_for_send = tx;
        handles.push(tokio::spawn(async move {
            if let Ok(Some(payload)) = handle.await {
                let _ = tx_for_send.send(payload).await;
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }
}

#[allow(clippy::too_many_arguments)]
fn read_instance(
    path: &Path,
    subject_root: &Path,
    subject_key: &str,
    csv_mapping: Option<&HashMap<String, String>>,
    salt: &str,
    allowed_modalities: &[String],
    resume_tokens: &HashMap<String, String>,
    use_specific_tags: bool,
) -> Option<InstancePayload> {
    let obj = if use_specific_tags {
        tags::open_specific(path).ok()?
    } else {
        tags::open_full(path).ok()?
    };
    let fields = tags::extract_fields(&obj);

    if fields.modality.is_empty() {
        debug!(?path, "skipping instance with absent modality");
        return None;
    }
    if !allowed_modalities.is_empty() && !allowed_modalities.iter().any(|m| m == &fields.modality) {
        debug!(?path, modality = %fields.modality, "skipping disallowed modality");
        return None;
    }
    if let Some(token) = resume_tokens.get(&fields.series_uid) {
        if fields.sop_uid.as_str() <= token.as_str() {
            return None;
        }
    }

    let (subject_code, resolution_source) =
        subject::resolve_subject_code(&fields.patient_id, &fields.study_uid, csv_mapping, salt);
    let rel_path = path
        .strip_prefix(subject_root.parent().unwrap_or(subject_root))
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned();

    Some(InstancePayload {
        subject_key: subject_key.to_string(),
        subject_code,
        resolution_source,
        patient_id: fields.patient_id,
        patient_name: fields.patient_name,
        study_uid: fields.study_uid,
        series_uid: fields.series_uid,
        sop_uid: fields.sop_uid,
        modality: fields.modality,
        rel_path,
        study_fields: fields.study_fields,
        series_fields: fields.series_fields,
        instance_fields: fields.instance_fields,
        mri_fields: fields.mri_fields,
        ct_fields: fields.ct_fields,
        pet_fields: fields.pet_fields,
    })
}

