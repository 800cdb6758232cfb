//! Minimal-tag and full-dataset DICOM field extraction.
//!
//! Adapts the teacher's `utils/dicom_tags.rs` tag-name parsing and `utils/tag_extractor.rs`
//! scope-grouping idiom: field values are read with `element.to_str()` into plain strings
//! (DICOM `DS`/`IS` numeric values are themselves ASCII strings, so there is no precision lost
//! by keeping them as text until the stack-signature stage rounds them).

use std::collections::HashMap;
use std::path::Path;

use dicom_core::header::Tag;
use dicom_core::DataDictionary;
use dicom_dictionary_std::StandardDataDictionary;
use dicom_object::{DefaultDicomObject, OpenFileOptions};
use tracing::debug;

pub type FieldMap = HashMap<String, Option<String>>;

/// `(field_key, dicom_tag_name)` pairs. `field_key` matches the snake_case name used
/// throughout the stack-signature machinery (`stack::signature`), `dicom_tag_name` is resolved
/// with `StandardDataDictionary`, mirroring the teacher's `parse_tag`.
pub const STUDY_FIELD_TAGS: &[(&str, &str)] = &[
    ("study_date", "StudyDate"),
    ("study_time", "StudyTime"),
    ("study_description", "StudyDescription"),
    ("accession_number", "AccessionNumber"),
    ("referring_physician_name", "ReferringPhysicianName"),
    ("manufacturer", "Manufacturer"),
    ("manufacturer_model_name", "ManufacturerModelName"),
];

pub const SERIES_FIELD_TAGS: &[(&str, &str)] = &[
    ("series_date", "SeriesDate"),
    ("series_time", "SeriesTime"),
    ("series_description", "SeriesDescription"),
    ("series_number", "SeriesNumber"),
    ("sequence_name", "SequenceName"),
    ("protocol_name", "ProtocolName"),
    ("body_part_examined", "BodyPartExamined"),
    ("slice_thickness", "SliceThickness"),
];

pub const INSTANCE_FIELD_TAGS: &[(&str, &str)] = &[
    ("instance_number", "InstanceNumber"),
    ("acquisition_number", "AcquisitionNumber"),
    ("rows", "Rows"),
    ("columns", "Columns"),
    ("pixel_spacing", "PixelSpacing"),
];

/// MR stack-defining parameters (§4.9) plus orientation/type, which every modality carries.
pub const MRI_FIELD_TAGS: &[(&str, &str)] = &[
    ("inversion_time", "InversionTime"),
    ("echo_time", "EchoTime"),
    ("echo_numbers", "EchoNumbers"),
    ("echo_train_length", "EchoTrainLength"),
    ("repetition_time", "RepetitionTime"),
    ("flip_angle", "FlipAngle"),
    ("receive_coil_name", "ReceiveCoilName"),
    ("magnetic_field_strength", "MagneticFieldStrength"),
    ("image_orientation_patient", "ImageOrientationPatient"),
    ("image_type", "ImageType"),
];

/// CT stack-defining parameters (§4.9).
pub const CT_FIELD_TAGS: &[(&str, &str)] = &[
    ("kvp", "KVP"),
    ("tube_current", "XRayTubeCurrent"),
    ("xray_exposure", "Exposure"),
    ("image_orientation_patient", "ImageOrientationPatient"),
    ("image_type", "ImageType"),
];

/// PET stack-defining parameters (§4.9). These are not part of the standard DICOM dictionary
/// under these exact names in every vendor's dialect; they resolve via the same `parse_tag`
/// fallback as any other tag name and simply come back empty when absent, which is the
/// expected behavior for a PET field read from a non-PET series.
pub const PET_FIELD_TAGS: &[(&str, &str)] = &[
    ("pet_bed_index", "ActualFrameDuration"),
    ("pet_frame_type", "FrameType"),
    ("image_orientation_patient", "ImageOrientationPatient"),
    ("image_type", "ImageType"),
];

/// The routing tags every instance read needs regardless of modality.
pub const ROUTING_TAGS: &[&str] = &[
    "PatientID",
    "PatientName",
    "StudyInstanceUID",
    "SeriesInstanceUID",
    "SOPInstanceUID",
    "SOPClassUID",
    "Modality",
];

/// The fixed specific-tag list used by minimal reads (§4.6): routing tags plus every field
/// this module extracts, deduplicated. Building this list from the same per-category arrays
/// used by the full-dataset reader is what makes `use_specific_tags=true/false` produce
/// identical payloads by construction (test_specific_tags.py).
pub fn extract_specific_tags() -> Vec<Tag> {
    let mut names: Vec<&str> = ROUTING_TAGS.to_vec();
    for list in [
        STUDY_FIELD_TAGS,
        SERIES_FIELD_TAGS,
        INSTANCE_FIELD_TAGS,
        MRI_FIELD_TAGS,
        CT_FIELD_TAGS,
        PET_FIELD_TAGS,
    ] {
        names.extend(list.iter().map(|(_, tag_name)| *tag_name));
    }
    names.sort();
    names.dedup();
    names.into_iter().filter_map(|name| parse_tag(name).ok()).collect()
}

pub fn parse_tag(tag_str: &str) -> Result<Tag, String> {
    if let Some(tag) = StandardDataDictionary.parse_tag(tag_str) {
        return Ok(tag);
    }
    if tag_str.len() == 8 {
        if let (Ok(group), Ok(element)) = (
            u16::from_str_radix(&tag_str[0..4], 16),
            u16::from_str_radix(&tag_str[4..8], 16),
        ) {
            return Ok(Tag(group, element));
        }
    }
    Err(format!("Invalid tag format: {tag_str}"))
}

fn read_field(obj: &DefaultDicomObject, tag_name: &str) -> Option<String> {
    let tag = parse_tag(tag_name).ok()?;
    obj.element(tag).ok().and_then(|e| e.to_str().ok()).map(|s| s.trim().to_string())
}

fn extract_field_map(obj: &DefaultDicomObject, tags: &[(&str, &str)]) -> FieldMap {
    tags.iter()
        .map(|(key, tag_name)| (key.to_string(), read_field(obj, tag_name)))
        .collect()
}

/// Open a DICOM file fully (used when `use_specific_tags=false`, or whenever the caller needs
/// every tag, e.g. for anonymization).
pub fn open_full(path: &Path) -> Result<DefaultDicomObject, String> {
    dicom_object::open_file(path).map_err(|e| e.to_string())
}

/// Open a DICOM file stopping at the first tag beyond [`extract_specific_tags`] (§4.6: "stop
/// before the pixel data"). Falls back to a full read transparently if `dicom-object`'s
/// specific-tag reader is unavailable for this transfer syntax.
pub fn open_specific(path: &Path) -> Result<DefaultDicomObject, String> {
    let tags = extract_specific_tags();
    OpenFileOptions::new()
        .read_until(tags.into_iter().max().unwrap_or(Tag(0xFFFF, 0xFFFF)))
        .open_file(path)
        .or_else(|_| dicom_object::open_file(path))
        .map_err(|e| e.to_string())
}

/// The fully assembled per-instance field extraction, shared by both the specific-tag and
/// full-dataset read paths so they are equivalent by construction.
#[derive(Debug, Clone, Default)]
pub struct ExtractedFields {
    pub patient_id: String,
    pub patient_name: String,
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
    pub sop_class_uid: String,
    pub modality: String,
    pub study_fields: FieldMap,
    pub series_fields: FieldMap,
    pub instance_fields: FieldMap,
    pub mri_fields: FieldMap,
    pub ct_fields: FieldMap,
    pub pet_fields: FieldMap,
}

pub fn extract_fields(obj: &DefaultDicomObject) -> ExtractedFields {
    ExtractedFields {
        patient_id: read_field(obj, "PatientID").unwrap_or_default(),
        patient_name: read_field(obj, "PatientName").unwrap_or_default(),
        study_uid: read_field(obj, "StudyInstanceUID").unwrap_or_default(),
        series_uid: read_field(obj, "SeriesInstanceUID").unwrap_or_default(),
        sop_uid: read_field(obj, "SOPInstanceUID").unwrap_or_default(),
        sop_class_uid: read_field(obj, "SOPClassUID").unwrap_or_default(),
        modality: read_field(obj, "Modality").unwrap_or_default(),
        study_fields: extract_field_map(obj, STUDY_FIELD_TAGS),
        series_fields: extract_field_map(obj, SERIES_FIELD_TAGS),
        instance_fields: extract_field_map(obj, INSTANCE_FIELD_TAGS),
        mri_fields: extract_field_map(obj, MRI_FIELD_TAGS),
        ct_fields: extract_field_map(obj, CT_FIELD_TAGS),
        pet_fields: extract_field_map(obj, PET_FIELD_TAGS),
    }
}

/// Read just `(PatientID, StudyInstanceUID)` — the minimal identity read used by the
/// Anonymization Engine's leaf grouping (§4.3 step 2) and by sequential ID-strategy discovery
/// (§4.2).
pub fn read_identity(path: &Path) -> Option<(String, String)> {
    let obj = open_specific(path).ok()?;
    let patient_id = read_field(&obj, "PatientID").unwrap_or_default();
    let study_uid = read_field(&obj, "StudyInstanceUID")?;
    debug!(?path, %study_uid, "read minimal identity");
    Some((patient_id, study_uid))
}
