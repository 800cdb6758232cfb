//! Row structs for the metadata DB tables (§3.1), ported from the SQLAlchemy ORM's columns and
//! trimmed to what this core writes and reads.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct Cohort {
    pub id: i64,
    pub cohort_name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct Subject {
    pub id: i64,
    pub subject_code: String,
    pub patient_id: String,
    pub patient_name: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Study {
    pub id: i64,
    pub study_instance_uid: String,
    pub subject_id: i64,
    pub study_fields: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Series {
    pub id: i64,
    pub series_instance_uid: String,
    pub study_id: i64,
    pub subject_id: i64,
    pub modality: String,
    pub series_fields: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Instance {
    pub id: i64,
    pub sop_instance_uid: String,
    pub series_id: i64,
    pub series_stack_id: Option<i64>,
    pub rel_path: String,
    pub instance_fields: Option<String>,
}

/// One optional row per series for the matching modality (§3.1).
#[derive(Debug, Clone, FromRow, Default, Serialize, Deserialize)]
pub struct MriSeriesDetails {
    pub series_id: i64,
    pub repetition_time: Option<f64>,
    pub echo_time: Option<f64>,
    pub flip_angle: Option<f64>,
    pub magnetic_field_strength: Option<f64>,
    pub inversion_time: Option<f64>,
    pub echo_numbers: Option<String>,
    pub echo_train_length: Option<String>,
    pub receive_coil_name: Option<String>,
}

#[derive(Debug, Clone, FromRow, Default, Serialize, Deserialize)]
pub struct CtSeriesDetails {
    pub series_id: i64,
    pub kvp: Option<f64>,
    pub tube_current: Option<f64>,
    pub xray_exposure: Option<String>,
}

#[derive(Debug, Clone, FromRow, Default, Serialize, Deserialize)]
pub struct PetSeriesDetails {
    pub series_id: i64,
    pub pet_bed_index: Option<String>,
    pub pet_frame_type: Option<String>,
}

/// A discovered stack (§4.9): one row per `(series_id, stack_index)`.
#[derive(Debug, Clone, FromRow, Default, Serialize, Deserialize)]
pub struct SeriesStack {
    pub id: i64,
    pub series_id: i64,
    pub stack_index: i64,
    pub stack_key: Option<String>,
    pub stack_modality: String,
    pub stack_echo_time: Option<f64>,
    pub stack_inversion_time: Option<f64>,
    pub stack_echo_numbers: Option<String>,
    pub stack_echo_train_length: Option<String>,
    pub stack_repetition_time: Option<f64>,
    pub stack_flip_angle: Option<f64>,
    pub stack_receive_coil_name: Option<String>,
    pub stack_xray_exposure: Option<String>,
    pub stack_kvp: Option<f64>,
    pub stack_tube_current: Option<f64>,
    pub stack_pet_bed_index: Option<String>,
    pub stack_pet_frame_type: Option<String>,
    pub stack_image_orientation: String,
    pub stack_orientation_confidence: f64,
    pub stack_image_type: Option<String>,
    pub stack_n_instances: i64,
}
