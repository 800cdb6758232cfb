//! Stack Discovery orchestration (§4.9): groups a Series' instances by acquisition-parameter
//! signature into `SeriesStack`s, assigns stable `stack_index`/`stack_key`, and bulk-updates
//! `instance.series_stack_id` via a temporary join table.

pub mod orientation;
pub mod signature;

use std::collections::BTreeMap;
use std::path::Path;

use sqlx::AnyPool;
use tracing::{info, warn};

use crate::error::CoreResult;
use signature::{compute_stack_signature, sort_for_stack_index, RawStackFields, StackSignature};

/// One instance's stack-defining fields as read back from the metadata DB, keyed by its row id.
#[derive(Debug, Clone)]
pub struct SeriesInstanceRow {
    pub instance_id: i64,
    pub fields: RawStackFields,
}

/// Which dimensions vary within a series (§4.9 step 4), checked in this priority order.
fn choose_stack_key(signatures: &[StackSignature]) -> Option<String> {
    if signatures.len() <= 1 {
        return None;
    }
    let distinct = |f: fn(&StackSignature) -> String| {
        signatures.iter().map(f).collect::<std::collections::HashSet<_>>().len() > 1
    };
    if distinct(|s| format!("{:?}", s.echo_time.map(|v| v.to_bits()))) {
        return Some("multi_echo".to_string());
    }
    if distinct(|s| format!("{:?}", s.inversion_time.map(|v| v.to_bits()))) {
        return Some("multi_ti".to_string());
    }
    if distinct(|s| s.orientation.as_str().to_string()) {
        return Some("multi_orientation".to_string());
    }
    if distinct(|s| s.image_type.clone().unwrap_or_default()) {
        return Some("image_type_variation".to_string());
    }
    None
}

/// A discovered stack, ready to persist: its assigned index, signature, and the member
/// instance row ids whose `series_stack_id` must be bulk-updated to point at it.
#[derive(Debug, Clone)]
pub struct DiscoveredStack {
    pub stack_index: i64,
    pub stack_key: Option<String>,
    pub signature: StackSignature,
    pub instance_ids: Vec<i64>,
}

/// Group `instances` by signature, sort into `stack_index` order, and assign `stack_key`
/// (§4.9 steps 2-4). Pure and independently testable without a database.
pub fn discover_stacks(instances: &[SeriesInstanceRow]) -> Vec<DiscoveredStack> {
    let mut groups: BTreeMap<String, (StackSignature, Vec<i64>)> = BTreeMap::new();
    for row in instances {
        let sig = compute_stack_signature(&row.fields);
        let key = format!("{sig:?}");
        groups
            .entry(key)
            .and_modify(|(_, ids)| ids.push(row.instance_id))
            .or_insert_with(|| (sig, vec![row.instance_id]));
    }

    let grouped: Vec<(StackSignature, Vec<i64>)> = groups.into_values().collect();
    let all_signatures: Vec<StackSignature> = grouped.iter().map(|(s, _)| s.clone()).collect();
    let stack_key = choose_stack_key(&all_signatures);

    let ordered = sort_for_stack_index(grouped);
    ordered
        .into_iter()
        .enumerate()
        .map(|(i, (signature, instance_ids))| DiscoveredStack {
            stack_index: i as i64,
            stack_key: stack_key.clone(),
            signature,
            instance_ids,
        })
        .collect()
}

/// Run stack discovery over every series in the metadata DB (the top-level entry point invoked
/// after extraction completes, §2 data flow). Returns the total number of stacks persisted.
pub async fn run_all(pool: &AnyPool, raw_root: &Path) -> CoreResult<usize> {
    let series_ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM series ORDER BY id").fetch_all(pool).await?;
    let mut total = 0usize;
    for (series_id,) in series_ids {
        total += discover_and_persist_series(pool, raw_root, series_id).await?;
    }
    Ok(total)
}

/// Run stack discovery for one series against the metadata DB: fetch its instances' raw
/// fields by re-reading each instance's anonymized file under `raw_root` (§4.9 step 1 — the
/// per-series detail tables hold one representative row per series and cannot distinguish
/// instances that differ on a stack-defining parameter within the same series), discover
/// stacks, upsert `series_stack` rows, and bulk-update `instance.series_stack_id` through a
/// temporary join table (§4.9 step 5).
pub async fn discover_and_persist_series(
    pool: &AnyPool,
    raw_root: &Path,
    series_id: i64,
) -> CoreResult<usize> {
    let instances = fetch_series_instance_fields(pool, raw_root, series_id).await?;
    if instances.is_empty() {
        return Ok(0);
    }
    let stacks = discover_stacks(&instances);

    sqlx::query(
        "CREATE TEMPORARY TABLE IF NOT EXISTS stack_assignment (
            instance_id INTEGER NOT NULL,
            series_stack_id INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    sqlx::query("DELETE FROM stack_assignment WHERE instance_id IN (SELECT id FROM instance WHERE series_id = ?)")
        .bind(series_id)
        .execute(pool)
        .await?;

    for stack in &stacks {
        let sig = &stack.signature;
        sqlx::query(
            "INSERT INTO series_stack
                (series_id, stack_index, stack_key, stack_modality, stack_echo_time,
                 stack_inversion_time, stack_echo_numbers, stack_echo_train_length,
                 stack_repetition_time, stack_flip_angle, stack_receive_coil_name,
                 stack_xray_exposure, stack_kvp, stack_tube_current, stack_pet_bed_index,
                 stack_pet_frame_type, stack_image_orientation, stack_orientation_confidence,
                 stack_image_type, stack_n_instances)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (series_id, stack_index) DO UPDATE SET
                stack_key = excluded.stack_key,
                stack_n_instances = excluded.stack_n_instances",
        )
        .bind(series_id)
        .bind(stack.stack_index)
        .bind(stack.stack_key.clone())
        .bind(sig.modality.clone())
        .bind(sig.echo_time)
        .bind(sig.inversion_time)
        .bind(sig.echo_numbers.clone())
        .bind(sig.echo_train_length.clone())
        .bind(sig.repetition_time)
        .bind(sig.flip_angle)
        .bind(sig.receive_coil_name.clone())
        .bind(sig.xray_exposure.clone())
        .bind(sig.kvp)
        .bind(sig.tube_current)
        .bind(sig.pet_bed_index.clone())
        .bind(sig.pet_frame_type.clone())
        .bind(sig.orientation.as_str())
        .bind(orientation_confidence_for(&instances, &stack.instance_ids))
        .bind(sig.image_type.clone())
        .bind(stack.instance_ids.len() as i64)
        .execute(pool)
        .await?;

        let row: (i64,) = sqlx::query_as(
            "SELECT id FROM series_stack WHERE series_id = ? AND stack_index = ?",
        )
        .bind(series_id)
        .bind(stack.stack_index)
        .fetch_one(pool)
        .await?;
        let series_stack_id = row.0;

        for instance_id in &stack.instance_ids {
            sqlx::query("INSERT INTO stack_assignment (instance_id, series_stack_id) VALUES (?, ?)")
                .bind(instance_id)
                .bind(series_stack_id)
                .execute(pool)
                .await?;
        }
    }

    sqlx::query(
        "UPDATE instance SET series_stack_id = (
            SELECT series_stack_id FROM stack_assignment WHERE stack_assignment.instance_id = instance.id
         ) WHERE id IN (SELECT instance_id FROM stack_assignment)",
    )
    .execute(pool)
    .await?;

    info!(series_id, stacks = stacks.len(), "stack discovery persisted");
    Ok(stacks.len())
}

fn orientation_confidence_for(instances: &[SeriesInstanceRow], ids: &[i64]) -> f64 {
    let first_id = ids.first().copied();
    instances
        .iter()
        .find(|row| Some(row.instance_id) == first_id)
        .map(|row| orientation::compute_orientation(row.fields.image_orientation_patient.as_deref()).confidence)
        .unwrap_or(0.5)
}

async fn fetch_series_instance_fields(
    pool: &AnyPool,
    raw_root: &Path,
    series_id: i64,
) -> CoreResult<Vec<SeriesInstanceRow>> {
    let rows: Vec<(i64, String, String)> = sqlx::query_as(
        "SELECT i.id, s.modality, i.rel_path
         FROM instance i JOIN series s ON s.id = i.series_id
         WHERE i.series_id = ?",
    )
    .bind(series_id)
    .fetch_all(pool)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for (instance_id, modality, rel_path) in rows {
        match read_raw_fields_from_disk(raw_root, &rel_path, &modality) {
            Ok(fields) => out.push(SeriesInstanceRow { instance_id, fields }),
            Err(e) => warn!(instance_id, %rel_path, error = %e, "skipping instance unreadable during stack discovery"),
        }
    }
    Ok(out)
}

/// Re-read one instance's stack-defining parameters off the anonymized file at
/// `raw_root/rel_path` (§4.9 step 1): the minimal specific-tag read already covers every
/// field this needs (orientation, image-type, and the per-modality numeric/string parameters),
/// so this reuses the Extraction Engine's own tag set rather than inventing a second list.
fn read_raw_fields_from_disk(raw_root: &Path, rel_path: &str, modality: &str) -> Result<RawStackFields, String> {
    let path = raw_root.join(rel_path);
    let obj = crate::extract::tags::open_specific(&path)?;
    let extracted = crate::extract::tags::extract_fields(&obj);

    let group = match modality {
        "MR" => &extracted.mri_fields,
        "CT" => &extracted.ct_fields,
        "PT" => &extracted.pet_fields,
        _ => &extracted.mri_fields,
    };

    let str_field = |key: &str| group.get(key).cloned().flatten();
    let f64_field = |key: &str| str_field(key).and_then(|s| s.trim().parse::<f64>().ok());

    Ok(RawStackFields {
        modality: modality.to_string(),
        echo_time: f64_field("echo_time"),
        inversion_time: f64_field("inversion_time"),
        repetition_time: f64_field("repetition_time"),
        flip_angle: f64_field("flip_angle"),
        echo_numbers: str_field("echo_numbers"),
        echo_train_length: str_field("echo_train_length"),
        receive_coil_name: str_field("receive_coil_name"),
        kvp: f64_field("kvp"),
        tube_current: f64_field("tube_current"),
        xray_exposure: str_field("xray_exposure"),
        pet_bed_index: str_field("pet_bed_index"),
        pet_frame_type: str_field("pet_frame_type"),
        image_orientation_patient: str_field("image_orientation_patient"),
        image_type: str_field("image_type"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, te: Option<f64>, orientation: &str) -> SeriesInstanceRow {
        SeriesInstanceRow {
            instance_id: id,
            fields: RawStackFields {
                modality: "MR".to_string(),
                echo_time: te,
                image_orientation_patient: Some(orientation.to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn multi_echo_series_produces_three_stacks_sorted_by_te() {
        let instances = vec![
            row(1, Some(15.0), r"1\0\0\0\1\0"),
            row(2, Some(5.0), r"1\0\0\0\1\0"),
            row(3, Some(10.0), r"1\0\0\0\1\0"),
        ];
        let stacks = discover_stacks(&instances);
        assert_eq!(stacks.len(), 3);
        assert_eq!(stacks[0].stack_index, 0);
        assert_eq!(stacks[0].signature.echo_time, Some(5.0));
        assert_eq!(stacks[1].signature.echo_time, Some(10.0));
        assert_eq!(stacks[2].signature.echo_time, Some(15.0));
        assert!(stacks.iter().all(|s| s.stack_key.as_deref() == Some("multi_echo")));
        assert!(stacks.iter().all(|s| s.instance_ids.len() == 1));
    }

    #[test]
    fn single_stack_series_has_null_key() {
        let instances = vec![row(1, Some(5.0), r"1\0\0\0\1\0"), row(2, Some(5.0), r"1\0\0\0\1\0")];
        let stacks = discover_stacks(&instances);
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].stack_key, None);
        assert_eq!(stacks[0].instance_ids.len(), 2);
    }

    #[test]
    fn differing_orientation_produces_multi_orientation_key() {
        let instances = vec![
            row(1, Some(5.0), r"1\0\0\0\1\0"),
            row(2, Some(5.0), r"0\1\0\0\0\-1"),
        ];
        let stacks = discover_stacks(&instances);
        assert_eq!(stacks.len(), 2);
        assert!(stacks.iter().all(|s| s.stack_key.as_deref() == Some("multi_orientation")));
    }

    #[test]
    fn stack_index_assignment_is_idempotent_across_calls() {
        let instances = vec![
            row(1, Some(15.0), r"1\0\0\0\1\0"),
            row(2, Some(5.0), r"1\0\0\0\1\0"),
        ];
        let first = discover_stacks(&instances);
        let second = discover_stacks(&instances);
        let first_idx: Vec<i64> = first.iter().map(|s| s.stack_index).collect();
        let second_idx: Vec<i64> = second.iter().map(|s| s.stack_index).collect();
        assert_eq!(first_idx, second_idx);
    }
}
