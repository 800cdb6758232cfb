//! `compute_stack_signature` / `signature_from_stack_record` (§4.9 step 2) and the rounding
//! rules shared by both, so the round-trip invariant (§8 property 4) holds by construction.

use serde::{Deserialize, Serialize};

use super::orientation::OrientationCategory;
use crate::db::models::SeriesStack;

/// Round `value` to `decimals` places using round-half-to-even, matching the host language's
/// native rounding behavior in the system this was distilled from (§4.9 step 2; §9 design
/// note: "fix the rounding rules in one place").
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round_ties_even() / factor
}

fn round_opt(value: Option<f64>, decimals: i32) -> Option<f64> {
    value.map(|v| round_to(v, decimals))
}

/// The ordered tuple of rounded numeric and categorical parameters that defines stack identity
/// (§3, §4.9). Two instances with equal signatures belong to the same stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackSignature {
    pub modality: String,
    /// Rounded to 2 decimal places.
    pub echo_time: Option<f64>,
    /// Rounded to 1 decimal place.
    pub inversion_time: Option<f64>,
    /// Rounded to 2 decimal places.
    pub repetition_time: Option<f64>,
    /// Rounded to 1 decimal place.
    pub flip_angle: Option<f64>,
    pub echo_numbers: Option<String>,
    pub echo_train_length: Option<String>,
    pub receive_coil_name: Option<String>,
    /// Rounded to 0 decimal places, retained as a float.
    pub kvp: Option<f64>,
    /// Rounded to 0 decimal places, retained as a float.
    pub tube_current: Option<f64>,
    pub xray_exposure: Option<String>,
    pub pet_bed_index: Option<String>,
    pub pet_frame_type: Option<String>,
    pub orientation: OrientationCategory,
    pub image_type: Option<String>,
}

impl StackSignature {
    /// Tie-break ordering key for `stack_index` assignment (§4.9 step 3): echo_time ascending,
    /// then inversion_time, then orientation category, then the full tuple lexicographically.
    /// `None` numerics sort before any `Some` value, so series without that parameter group
    /// together at the front deterministically rather than depending on field presence order.
    fn sort_key(&self) -> (OrderedOpt, OrderedOpt, OrientationCategory, String) {
        (
            OrderedOpt(self.echo_time),
            OrderedOpt(self.inversion_time),
            self.orientation,
            format!("{self:?}"),
        )
    }
}

/// `Option<f64>` wrapper giving a total order with `None` first, for use as a sort key.
#[derive(Debug, Clone, Copy, PartialEq)]
struct OrderedOpt(Option<f64>);

impl Eq for OrderedOpt {}

impl PartialOrd for OrderedOpt {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedOpt {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.0, other.0) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal),
        }
    }
}

/// Sort signatures (paired with an opaque index into the caller's instance list) into
/// `stack_index` assignment order (§4.9 step 3).
pub fn sort_for_stack_index<T>(mut items: Vec<(StackSignature, T)>) -> Vec<(StackSignature, T)> {
    items.sort_by(|a, b| a.0.sort_key().cmp(&b.0.sort_key()));
    items
}

/// Raw per-instance stack-defining fields read off a DICOM instance (§4.9 step 1), before
/// rounding. `image_orientation_patient` is the raw backslash-separated string fed to
/// [`super::orientation::compute_orientation`].
#[derive(Debug, Clone, Default)]
pub struct RawStackFields {
    pub modality: String,
    pub echo_time: Option<f64>,
    pub inversion_time: Option<f64>,
    pub repetition_time: Option<f64>,
    pub flip_angle: Option<f64>,
    pub echo_numbers: Option<String>,
    pub echo_train_length: Option<String>,
    pub receive_coil_name: Option<String>,
    pub kvp: Option<f64>,
    pub tube_current: Option<f64>,
    pub xray_exposure: Option<String>,
    pub pet_bed_index: Option<String>,
    pub pet_frame_type: Option<String>,
    pub image_orientation_patient: Option<String>,
    pub image_type: Option<String>,
}

/// Compute an instance's stack signature from its raw fields (§4.9 step 2).
pub fn compute_stack_signature(fields: &RawStackFields) -> StackSignature {
    let orientation = super::orientation::compute_orientation(fields.image_orientation_patient.as_deref());
    StackSignature {
        modality: fields.modality.clone(),
        echo_time: round_opt(fields.echo_time, 2),
        inversion_time: round_opt(fields.inversion_time, 1),
        repetition_time: round_opt(fields.repetition_time, 2),
        flip_angle: round_opt(fields.flip_angle, 1),
        echo_numbers: fields.echo_numbers.clone(),
        echo_train_length: fields.echo_train_length.clone(),
        receive_coil_name: fields.receive_coil_name.clone(),
        kvp: round_opt(fields.kvp, 0),
        tube_current: round_opt(fields.tube_current, 0),
        xray_exposure: fields.xray_exposure.clone(),
        pet_bed_index: fields.pet_bed_index.clone(),
        pet_frame_type: fields.pet_frame_type.clone(),
        orientation: orientation.category,
        image_type: fields.image_type.clone(),
    }
}

/// Reconstruct a signature from a persisted `series_stack` row. Must be the exact inverse of
/// [`compute_stack_signature`] (§8 property 4) — re-rounding already-rounded values is a no-op,
/// which is why both directions funnel through the same `round_to`.
pub fn signature_from_stack_record(row: &SeriesStack) -> StackSignature {
    StackSignature {
        modality: row.stack_modality.clone(),
        echo_time: round_opt(row.stack_echo_time, 2),
        inversion_time: round_opt(row.stack_inversion_time, 1),
        repetition_time: round_opt(row.stack_repetition_time, 2),
        flip_angle: round_opt(row.stack_flip_angle, 1),
        echo_numbers: row.stack_echo_numbers.clone(),
        echo_train_length: row.stack_echo_train_length.clone(),
        receive_coil_name: row.stack_receive_coil_name.clone(),
        kvp: round_opt(row.stack_kvp, 0),
        tube_current: round_opt(row.stack_tube_current, 0),
        xray_exposure: row.stack_xray_exposure.clone(),
        pet_bed_index: row.stack_pet_bed_index.clone(),
        pet_frame_type: row.stack_pet_frame_type.clone(),
        orientation: OrientationCategory::parse(&row.stack_image_orientation)
            .unwrap_or(OrientationCategory::Axial),
        image_type: row.stack_image_type.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_uses_banker_rounding_on_midpoint() {
        assert_eq!(round_to(120.5, 0), 120.0);
        assert_eq!(round_to(121.5, 0), 122.0);
        assert_eq!(round_to(300.7, 0), 301.0);
    }

    #[test]
    fn compute_signature_rounds_per_field_precision() {
        let fields = RawStackFields {
            modality: "MR".to_string(),
            echo_time: Some(5.004),
            inversion_time: Some(900.04),
            flip_angle: Some(12.34),
            ..Default::default()
        };
        let sig = compute_stack_signature(&fields);
        assert_eq!(sig.echo_time, Some(5.0));
        assert_eq!(sig.inversion_time, Some(900.0));
        assert_eq!(sig.flip_angle, Some(12.3));
    }

    #[test]
    fn round_trip_through_stack_record_is_exact_inverse() {
        let fields = RawStackFields {
            modality: "MR".to_string(),
            echo_time: Some(5.004),
            inversion_time: Some(900.04),
            repetition_time: Some(2500.126),
            flip_angle: Some(90.0),
            echo_numbers: Some("1".to_string()),
            image_orientation_patient: Some(r"1\0\0\0\1\0".to_string()),
            image_type: Some("ORIGINAL\\PRIMARY".to_string()),
            ..Default::default()
        };
        let sig = compute_stack_signature(&fields);

        let row = SeriesStack {
            id: 1,
            series_id: 1,
            stack_index: 0,
            stack_key: None,
            stack_modality: sig.modality.clone(),
            stack_echo_time: sig.echo_time,
            stack_inversion_time: sig.inversion_time,
            stack_echo_numbers: sig.echo_numbers.clone(),
            stack_echo_train_length: sig.echo_train_length.clone(),
            stack_repetition_time: sig.repetition_time,
            stack_flip_angle: sig.flip_angle,
            stack_receive_coil_name: sig.receive_coil_name.clone(),
            stack_xray_exposure: sig.xray_exposure.clone(),
            stack_kvp: sig.kvp,
            stack_tube_current: sig.tube_current,
            stack_pet_bed_index: sig.pet_bed_index.clone(),
            stack_pet_frame_type: sig.pet_frame_type.clone(),
            stack_image_orientation: sig.orientation.as_str().to_string(),
            stack_orientation_confidence: 1.0,
            stack_image_type: sig.image_type.clone(),
            stack_n_instances: 1,
        };

        assert_eq!(signature_from_stack_record(&row), sig);
    }

    #[test]
    fn sort_for_stack_index_orders_by_echo_time_ascending() {
        let mk = |te: f64| StackSignature {
            modality: "MR".to_string(),
            echo_time: Some(te),
            inversion_time: None,
            repetition_time: None,
            flip_angle: None,
            echo_numbers: None,
            echo_train_length: None,
            receive_coil_name: None,
            kvp: None,
            tube_current: None,
            xray_exposure: None,
            pet_bed_index: None,
            pet_frame_type: None,
            orientation: OrientationCategory::Axial,
            image_type: None,
        };
        let items = vec![(mk(15.0), "c"), (mk(5.0), "a"), (mk(10.0), "b")];
        let sorted = sort_for_stack_index(items);
        let order: Vec<&str> = sorted.into_iter().map(|(_, v)| v).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
