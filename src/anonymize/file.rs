//! Per-file anonymization (§4.4).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use dicom_core::header::Tag;
use dicom_core::value::PrimitiveValue;
use dicom_core::VR;
use dicom_object::DefaultDicomObject;
use tracing::warn;

use crate::audit::{AuditAction, AuditEvent};
use crate::config::AnonymizeConfig;
use crate::extract::tags::parse_tag;
use crate::id_strategy::IdStrategy;

use super::scrub;

#[derive(Debug, Clone, Default)]
pub struct FileOutcome {
    pub study_uid: Option<String>,
    pub patient_id_original: Option<String>,
    pub patient_id_updated: Option<String>,
    pub rel_path: String,
    pub wrote_output: bool,
    pub output_preexisting: bool,
    pub events: Vec<AuditEvent>,
}

/// `round(|months(first→study)|)` snapped to the nearest multiple of 6 within ±1 month, clamped
/// to ≥ `M06` when nonzero (resolved from the system this was distilled from — `relativedelta`
/// month arithmetic plus a `days/30.44` fractional correction).
pub fn compute_timepoint(first: NaiveDate, study: NaiveDate) -> String {
    if first == study {
        return "M00".to_string();
    }
    let months = month_delta(first, study);
    let mut rounded = months.abs().round() as i64;
    let mut nearest6 = 6 * ((rounded as f64 / 6.0).round() as i64);
    if nearest6 == 0 {
        nearest6 = 6;
    }
    if (rounded - nearest6).abs() <= 1 {
        rounded = nearest6;
    }
    if rounded == 0 {
        rounded = 6;
    }
    format!("M{rounded:02}")
}

fn month_delta(first: NaiveDate, study: NaiveDate) -> f64 {
    let mut years = study.year() - first.year();
    let mut months = study.month() as i32 - first.month() as i32;
    let mut days = study.day() as i32 - first.day() as i32;
    if days < 0 {
        months -= 1;
    }
    if months < 0 {
        years -= 1;
        months += 12;
    }
    (years * 12 + months) as f64 + days as f64 / 30.44
}

use chrono::Datelike;

fn format_tag(tag: Tag) -> String {
    format!("({:04X},{:04X})", tag.group(), tag.element())
}

/// Compute the output path for `input_path`, mirroring `input_path`'s position relative to
/// `source_root` under `output_root`.
pub fn target_path(input_path: &Path, source_root: &Path, output_root: &Path) -> PathBuf {
    let relative = input_path.strip_prefix(source_root).unwrap_or(input_path);
    output_root.join(relative)
}

/// The renamed-folder counterpart of [`target_path`], used when `rename_patient_folders` is on
/// and the mapped PatientID differs from the input's first path segment.
fn renamed_target_path(
    input_path: &Path,
    source_root: &Path,
    output_root: &Path,
    mapped_pid: &str,
) -> Option<PathBuf> {
    let relative = input_path.strip_prefix(source_root).ok()?;
    let mut components: Vec<_> = relative.components().collect();
    let first = components.first()?.as_os_str().to_str()?;
    if first == mapped_pid {
        return None;
    }
    components[0] = std::path::Component::Normal(std::ffi::OsStr::new(mapped_pid));
    let rebuilt: PathBuf = components.iter().collect();
    Some(output_root.join(rebuilt))
}

/// Anonymize one file (§4.4). Reads the full dataset, applies PatientID replacement and
/// StudyDate timepoint mapping, scrubs, computes the target path, and writes atomically via a
/// `.tmp` sibling. Returns the per-file outcome for aggregation into the leaf result.
pub fn anonymize_file(
    path: &Path,
    source_root: &Path,
    output_root: &Path,
    config: &AnonymizeConfig,
    id_strategy: &IdStrategy,
    first_dates: &HashMap<String, NaiveDate>,
) -> Result<FileOutcome, String> {
    let mut obj = dicom_object::open_file(path).map_err(|e| e.to_string())?;

    let rel_path = path
        .strip_prefix(source_root)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned();

    let pid_tag = parse_tag("PatientID").map_err(|e| e.to_string())?;
    let date_tag = parse_tag("StudyDate").map_err(|e| e.to_string())?;
    let uid_tag = parse_tag("StudyInstanceUID").map_err(|e| e.to_string())?;

    let original_pid = read_str(&obj, pid_tag).unwrap_or_default();
    let original_date = read_str(&obj, date_tag);
    let study_uid = read_str(&obj, uid_tag).unwrap_or_default();

    let mut events = Vec::new();
    let mut new_pid = original_pid.clone();

    if config.anonymize_patient_id && !original_pid.is_empty() {
        let mapped = id_strategy.map(&original_pid, Path::new(&rel_path));
        if mapped != original_pid {
            set_str(&mut obj, pid_tag, &mapped);
            new_pid = mapped.clone();
            events.push(AuditEvent {
                rel_path: rel_path.clone(),
                study_uid: study_uid.clone(),
                tag_code: format_tag(pid_tag),
                tag_name: "PatientID".to_string(),
                action: AuditAction::Replaced,
                old_value: Some(original_pid.clone()),
                new_value: Some(mapped),
            });
        }
    }

    let mut study_date_logged = false;
    if config.map_study_date_to_timepoint && !original_pid.is_empty() {
        if let Some(date_str) = &original_date {
            if let Some(study_dt) = parse_dicom_date(date_str) {
                if let Some(&first_dt) = first_dates.get(&original_pid) {
                    let label = compute_timepoint(first_dt, study_dt);
                    set_str(&mut obj, date_tag, &label);
                    study_date_logged = true;
                    events.push(AuditEvent {
                        rel_path: rel_path.clone(),
                        study_uid: study_uid.clone(),
                        tag_code: format_tag(date_tag),
                        tag_name: "StudyDate".to_string(),
                        action: if original_date.is_some() {
                            AuditAction::Replaced
                        } else {
                            AuditAction::Added
                        },
                        old_value: original_date.clone(),
                        new_value: Some(label),
                    });
                }
            }
        }
    }
    if !study_date_logged {
        if let Some(date_str) = &original_date {
            events.push(AuditEvent {
                rel_path: rel_path.clone(),
                study_uid: study_uid.clone(),
                tag_code: format_tag(date_tag),
                tag_name: "StudyDate".to_string(),
                action: AuditAction::Retained,
                old_value: Some(date_str.clone()),
                new_value: None,
            });
        }
    }

    for (tag, name) in scrub::resolve_scrub_set(&obj, &config.scrub_tags, &config.exclude_tags) {
        let old_value = scrub::display_value(&obj, tag);
        if obj.remove_element(tag).is_some() {
            events.push(AuditEvent {
                rel_path: rel_path.clone(),
                study_uid: study_uid.clone(),
                tag_code: format_tag(tag),
                tag_name: name,
                action: AuditAction::Removed,
                old_value,
                new_value: None,
            });
        }
    }

    let mut target = target_path(path, source_root, output_root);
    let mapped_target = if config.rename_patient_folders && !new_pid.is_empty() {
        renamed_target_path(path, source_root, output_root, &new_pid)
    } else {
        None
    };

    let preexisting = target.exists() || mapped_target.as_ref().is_some_and(|p| p.exists());
    let mut wrote_output = false;
    if !preexisting {
        if let Some(renamed_top) = mapped_target.as_ref().and_then(|p| p.parent()).and_then(|p| p.parent()) {
            if renamed_top.exists() {
                target = mapped_target.clone().unwrap_or(target);
            }
        }
        write_atomically(&obj, &target, config.preserve_uids).map_err(|e| e.to_string())?;
        wrote_output = true;
    }

    Ok(FileOutcome {
        study_uid: (!study_uid.is_empty()).then_some(study_uid),
        patient_id_original: (!original_pid.is_empty()).then_some(original_pid),
        patient_id_updated: (!new_pid.is_empty()).then_some(new_pid),
        rel_path,
        wrote_output,
        output_preexisting: preexisting,
        events,
    })
}

fn read_str(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    obj.element(tag).ok().and_then(|e| e.to_str().ok()).map(|s| s.trim().to_string())
}

fn set_str(obj: &mut DefaultDicomObject, tag: Tag, value: &str) {
    if let Err(e) = obj.update_value(tag, |v| {
        *v = PrimitiveValue::from(value);
    }) {
        warn!(?tag, error = %e, "failed to set tag value during anonymization");
    }
}

fn parse_dicom_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d").ok()
}

/// Write `obj` to `target` via a `.tmp` sibling and an atomic rename (§4.4 step 6).
/// `preserve_uids` selects whether the written file must remain a strictly valid standalone
/// DICOM file (full file-meta enforcement) or may skip that enforcement.
fn write_atomically(obj: &DefaultDicomObject, target: &Path, preserve_uids: bool) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = target.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);

    let write_result = if preserve_uids {
        obj.write_to_file(&tmp_path)
    } else {
        obj.write_all(&mut std::fs::File::create(&tmp_path)?)
    };
    write_result.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
    std::fs::rename(&tmp_path, target)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timepoint_zero_months_is_m00() {
        let d = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        assert_eq!(compute_timepoint(d, d), "M00");
    }

    #[test]
    fn timepoint_snaps_to_nearest_multiple_of_six() {
        let first = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let study = NaiveDate::from_ymd_opt(2024, 7, 2).unwrap();
        assert_eq!(compute_timepoint(first, study), "M06");
    }

    #[test]
    fn timepoint_nonzero_rounds_up_to_m06() {
        let first = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let study = NaiveDate::from_ymd_opt(2024, 1, 8).unwrap();
        assert_eq!(compute_timepoint(first, study), "M06");
    }

    #[test]
    fn timepoint_does_not_snap_outside_tolerance() {
        let first = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let study = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        assert_eq!(compute_timepoint(first, study), "M03");
    }

    #[test]
    fn target_path_mirrors_relative_position() {
        let input = Path::new("/root/in/P1/a.dcm");
        let target = target_path(input, Path::new("/root/in"), Path::new("/root/out"));
        assert_eq!(target, PathBuf::from("/root/out/P1/a.dcm"));
    }

    #[test]
    fn renamed_target_path_rewrites_first_segment() {
        let input = Path::new("/root/in/P1/a.dcm");
        let renamed =
            renamed_target_path(input, Path::new("/root/in"), Path::new("/root/out"), "SUBJ0001")
                .unwrap();
        assert_eq!(renamed, PathBuf::from("/root/out/SUBJ0001/a.dcm"));
    }

    #[test]
    fn renamed_target_path_none_when_unchanged() {
        let input = Path::new("/root/in/P1/a.dcm");
        let renamed = renamed_target_path(input, Path::new("/root/in"), Path::new("/root/out"), "P1");
        assert!(renamed.is_none());
    }
}
