//! Cohort-wide audit export (§6, §4.5.1): one row per study, unioning every leaf's deduplicated
//! tag set into a flat table. Serializing the result to an actual CSV/XLSX file is left to the
//! caller — out of scope per §1 — but building the row/column structure is core, testable
//! behavior (§8 scenarios 1 and 3).

use std::collections::{BTreeMap, BTreeSet};

use super::TagAuditEntry;

/// Tags that get `_old_value` / `_new_value` column pairs instead of a single column.
const TRACKED_TAGS: [&str; 2] = ["(0010,0020)", "(0008,0020)"];

#[derive(Debug, Clone)]
pub struct LeafAuditExportInput {
    pub study_uid: String,
    pub rel_path: String,
    pub data_folder: String,
    pub parent_folder: String,
    pub sub_folder: String,
    pub tags: Vec<TagAuditEntry>,
}

const STATIC_COLUMNS: [&str; 5] = ["study_uid", "rel_path", "DataFolder", "ParentFolder", "SubFolder"];

/// Build the export table: `(columns, rows)`. `rows[i]` maps column name to value; missing keys
/// mean "no value for this study" and the caller should render them empty. Columns that are
/// empty for every row are dropped.
pub fn build_export(
    leaves: &[LeafAuditExportInput],
) -> (Vec<String>, Vec<BTreeMap<String, String>>) {
    // tag_code -> tag_name, first one observed wins.
    let mut tag_names: BTreeMap<String, String> = BTreeMap::new();
    for leaf in leaves {
        for tag in &leaf.tags {
            tag_names
                .entry(tag.tag_code.clone())
                .or_insert_with(|| tag.tag_name.clone());
        }
    }

    let mut columns: Vec<String> = STATIC_COLUMNS.iter().map(|s| s.to_string()).collect();
    for tag_code in tag_names.keys() {
        if TRACKED_TAGS.contains(&tag_code.as_str()) {
            columns.push(format!("{tag_code}_old_value"));
            columns.push(format!("{tag_code}_new_value"));
        } else {
            columns.push(tag_code.clone());
        }
    }

    let mut rows: Vec<BTreeMap<String, String>> = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        let mut row = BTreeMap::new();
        row.insert("study_uid".to_string(), leaf.study_uid.clone());
        row.insert("rel_path".to_string(), leaf.rel_path.clone());
        row.insert("DataFolder".to_string(), leaf.data_folder.clone());
        row.insert("ParentFolder".to_string(), leaf.parent_folder.clone());
        row.insert("SubFolder".to_string(), leaf.sub_folder.clone());
        for tag in &leaf.tags {
            if TRACKED_TAGS.contains(&tag.tag_code.as_str()) {
                if let Some(old) = &tag.old_value {
                    row.insert(format!("{}_old_value", tag.tag_code), old.clone());
                }
                if let Some(new) = &tag.new_value {
                    row.insert(format!("{}_new_value", tag.tag_code), new.clone());
                }
            } else if let Some(new) = &tag.new_value {
                row.insert(tag.tag_code.clone(), new.clone());
            }
        }
        rows.push(row);
    }

    let nonempty: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.keys().map(|s| s.as_str()))
        .collect();
    let columns: Vec<String> = columns
        .into_iter()
        .filter(|c| STATIC_COLUMNS.contains(&c.as_str()) || nonempty.contains(c.as_str()))
        .collect();

    (columns, rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patient_id_gets_old_new_columns() {
        let leaves = vec![LeafAuditExportInput {
            study_uid: "1.2.3".to_string(),
            rel_path: "P1/a.dcm".to_string(),
            data_folder: "P1".to_string(),
            parent_folder: String::new(),
            sub_folder: String::new(),
            tags: vec![TagAuditEntry {
                tag_code: "(0010,0020)".to_string(),
                tag_name: "PatientID".to_string(),
                old_value: Some("A".to_string()),
                new_value: Some("SUBJ0001".to_string()),
                conflicting: false,
            }],
        }];
        let (columns, rows) = build_export(&leaves);
        assert!(columns.contains(&"(0010,0020)_old_value".to_string()));
        assert!(columns.contains(&"(0010,0020)_new_value".to_string()));
        assert_eq!(rows[0].get("(0010,0020)_old_value").unwrap(), "A");
        assert_eq!(rows[0].get("(0010,0020)_new_value").unwrap(), "SUBJ0001");
    }

    #[test]
    fn untracked_tag_gets_single_column() {
        let leaves = vec![LeafAuditExportInput {
            study_uid: "1.2.3".to_string(),
            rel_path: "P1/a.dcm".to_string(),
            data_folder: "P1".to_string(),
            parent_folder: String::new(),
            sub_folder: String::new(),
            tags: vec![TagAuditEntry {
                tag_code: "(0010,0030)".to_string(),
                tag_name: "PatientBirthDate".to_string(),
                old_value: Some("19700101".to_string()),
                new_value: None,
                conflicting: false,
            }],
        }];
        let (columns, _rows) = build_export(&leaves);
        assert!(!columns.iter().any(|c| c.contains("_old_value")));
    }
}
