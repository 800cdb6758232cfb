//! Tag scrub-list / exclude-list / UID-VR-exemption logic (§4.4 step 4).
//!
//! Grounded in the teacher's `utils/dicom_tags.rs` dictionary lookup: `StandardDataDictionary`
//! resolves both the tag's canonical name (for the audit's `tag_name` column) and its VR, the
//! same dictionary the teacher uses for `parse_tag`/`get_tag_scope`.

use std::collections::HashSet;

use dicom_core::header::Tag;
use dicom_core::value::Value;
use dicom_core::VR;
use dicom_dictionary_std::StandardDataDictionary;
use dicom_object::DefaultDicomObject;

use crate::extract::tags::parse_tag;

/// Tags that must never be scrubbed regardless of configuration — they are managed explicitly
/// by the earlier steps of §4.4 (PatientID replacement, StudyDate timepoint mapping) or are
/// required for the file to remain a valid, linkable DICOM object.
pub fn always_retained() -> [&'static str; 3] {
    ["PatientID", "StudyDate", "StudyInstanceUID"]
}

fn tag_name(tag: Tag) -> Option<String> {
    use dicom_core::dictionary::DataDictionary;
    StandardDataDictionary.by_tag(tag).map(|e| e.alias().to_string())
}

/// A tag is exempt from scrubbing if its VR is `UI`, or its dictionary name contains "UID" or
/// matches the "Referenc...Sequence" family (e.g. `ReferencedSOPSequence`,
/// `ReferencedStudySequence`) — these identify linkage structure rather than patient identity
/// and breaking them would corrupt the output tree's internal consistency.
pub fn is_uid_exempt(obj: &DefaultDicomObject, tag: Tag) -> bool {
    if let Ok(elem) = obj.element(tag) {
        if elem.header().vr == VR::UI {
            return true;
        }
    }
    match tag_name(tag) {
        Some(name) => is_uid_or_reference_name(&name),
        None => false,
    }
}

/// Resolved from `_name_contains_uid_or_reference` in the system this was distilled from:
/// case-insensitive "uid" anywhere in the name, or "referenc" AND "sequence" both present.
fn is_uid_or_reference_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.contains("uid") || (lower.contains("referenc") && lower.contains("sequence"))
}

/// Resolve the configured scrub list (minus the exclude list, minus the always-retained tags,
/// minus UID-exempt tags) into the concrete set of tags to remove from `obj` (§4.4 step 4).
pub fn resolve_scrub_set(
    obj: &DefaultDicomObject,
    scrub_tags: &[String],
    exclude_tags: &[String],
) -> Vec<(Tag, String)> {
    let exclude: HashSet<&str> = exclude_tags.iter().map(String::as_str).collect();
    let retained: HashSet<&str> = always_retained().into_iter().collect();

    scrub_tags
        .iter()
        .filter(|name| !exclude.contains(name.as_str()) && !retained.contains(name.as_str()))
        .filter_map(|name| parse_tag(name).ok().map(|tag| (tag, name.clone())))
        .filter(|(tag, _)| !is_uid_exempt(obj, *tag))
        .collect()
}

/// A value read purely for the audit log — not every DICOM VR round-trips through `to_str`
/// cleanly (e.g. sequences), so this degrades to a placeholder rather than failing the file.
pub fn display_value(obj: &DefaultDicomObject, tag: Tag) -> Option<String> {
    let elem = obj.element(tag).ok()?;
    match elem.value() {
        Value::Primitive(_) => elem.to_str().ok().map(|s| s.trim().to_string()),
        Value::Sequence(_) => Some("<sequence>".to_string()),
        Value::PixelSequence(_) => Some("<pixel-sequence>".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referenced_sequence_name_matches() {
        assert!(is_uid_or_reference_name("ReferencedSOPSequence"));
        assert!(is_uid_or_reference_name("ReferencedStudySequence"));
        assert!(is_uid_or_reference_name("SOPInstanceUID"));
        assert!(!is_uid_or_reference_name("PatientName"));
    }

    #[test]
    fn always_retained_excludes_core_identity_tags() {
        let retained = always_retained();
        assert!(retained.contains(&"PatientID"));
        assert!(retained.contains(&"StudyDate"));
        assert!(retained.contains(&"StudyInstanceUID"));
    }
}
