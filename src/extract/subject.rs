//! Subject planning for the Extraction Engine (§4.6): turning one top-level patient folder into
//! an ordered list of candidate files, with resume-token and path-index skip applied.

use std::path::{Path, PathBuf};

use crate::traversal;

/// Where a subject's resolved code came from (§4.7: `SubjectResolver.resolve`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectResolutionSource {
    /// Looked up via the id-strategy CSV mapping.
    Csv,
    /// Salted hash of the PatientID.
    Hash,
    /// PatientID was empty; salted hash of the StudyInstanceUID instead.
    StudyHash,
}

#[derive(Debug, Clone)]
pub struct SubjectPlan {
    pub subject_key: String,
    pub root: PathBuf,
    pub files: Vec<PathBuf>,
}

/// `SubjectResolver.resolve(patientID, studyUID)` (§4.7). CSV lookup wins if provided;
/// otherwise a salted hash of the PatientID; if PatientID is empty, the salted hash of the
/// StudyInstanceUID.
pub fn resolve_subject_code(
    patient_id: &str,
    study_uid: &str,
    csv_mapping: Option<&std::collections::HashMap<String, String>>,
    salt: &str,
) -> (String, SubjectResolutionSource) {
    if let Some(mapping) = csv_mapping {
        if let Some(code) = mapping.get(patient_id).filter(|c| !c.is_empty()) {
            return (code.clone(), SubjectResolutionSource::Csv);
        }
    }
    if patient_id.is_empty() {
        (hash_subject(salt, study_uid), SubjectResolutionSource::StudyHash)
    } else {
        (hash_subject(salt, patient_id), SubjectResolutionSource::Hash)
    }
}

fn hash_subject(salt: &str, value: &str) -> String {
    use blake2::digest::consts::U8;
    use blake2::{Blake2b, Digest};
    let mut hasher = Blake2b::<U8>::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"\0");
    hasher.update(value.as_bytes());
    let bytes = hasher.finalize();
    format!("SUBJ{:016x}", u64::from_be_bytes(bytes.into()))
}

/// Build a subject's file plan from its top-level folder: depth-first traversal (stable,
/// reproducible ordering required for resume-by-path), filtered by `is_candidate`.
pub fn plan_subject(root: &Path) -> SubjectPlan {
    let subject_key = root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let files = traversal::traverse_depth_first(root);
    SubjectPlan {
        subject_key,
        root: root.to_path_buf(),
        files,
    }
}

/// Apply resume-by-SOP-UID: drop every file whose extracted SOP Instance UID sorts
/// lexicographically at or below `resume_token` (§4.6 resume semantics — SOP UIDs are compared
/// as strings, not numerically, matching how they are stored and indexed).
pub fn filter_by_resume_token<'a>(
    files: &'a [(PathBuf, String)],
    resume_token: Option<&str>,
) -> Vec<&'a (PathBuf, String)> {
    match resume_token {
        None => files.iter().collect(),
        Some(token) => files.iter().filter(|(_, sop_uid)| sop_uid.as_str() > token).collect(),
    }
}

/// Apply resume-by-path-index: drop every file already present in `completed_paths` (rel-path
/// keyed). Used instead of the SOP-UID token when `resume_by_path` is configured, since it does
/// not require reading a tag from files already known to be done.
pub fn filter_by_path_index(
    files: &[PathBuf],
    completed_paths: &std::collections::HashSet<PathBuf>,
) -> Vec<PathBuf> {
    files
        .iter()
        .filter(|p| !completed_paths.contains(*p))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_subject_code_prefers_csv_mapping() {
        let mut mapping = std::collections::HashMap::new();
        mapping.insert("P001".to_string(), "SUBJ0042".to_string());
        let (code, source) = resolve_subject_code("P001", "1.2.3", Some(&mapping), "salt");
        assert_eq!(code, "SUBJ0042");
        assert_eq!(source, SubjectResolutionSource::Csv);
    }

    #[test]
    fn resolve_subject_code_falls_back_to_hash() {
        let (code, source) = resolve_subject_code("P001", "1.2.3", None, "salt");
        assert!(code.starts_with("SUBJ"));
        assert_eq!(source, SubjectResolutionSource::Hash);
    }

    #[test]
    fn resolve_subject_code_uses_study_hash_when_patient_id_empty() {
        let (code, source) = resolve_subject_code("", "1.2.3", None, "salt");
        assert!(code.starts_with("SUBJ"));
        assert_eq!(source, SubjectResolutionSource::StudyHash);
    }

    #[test]
    fn resume_token_filters_lexicographically() {
        let files = vec![
            (PathBuf::from("a.dcm"), "1.2.3".to_string()),
            (PathBuf::from("b.dcm"), "1.2.4".to_string()),
        ];
        let remaining = filter_by_resume_token(&files, Some("1.2.3"));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1, "1.2.4");
    }

    #[test]
    fn path_index_drops_completed() {
        let files = vec![PathBuf::from("a.dcm"), PathBuf::from("b.dcm")];
        let mut completed = std::collections::HashSet::new();
        completed.insert(PathBuf::from("a.dcm"));
        let remaining = filter_by_path_index(&files, &completed);
        assert_eq!(remaining, vec![PathBuf::from("b.dcm")]);
    }
}
