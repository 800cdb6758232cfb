//! ID Strategy Builder (§4.2, §3): a total function `(originalPatientID, filePath) → anonymizedID`
//! under one of five strategies.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use blake2::digest::consts::U8;
use blake2::{Blake2b, Digest};
use regex::Regex;

use crate::config::{CsvFallback, IdStrategyConfig, SequentialDiscovery};

type Blake2b64 = Blake2b<U8>;

/// Replace the contiguous run of `X` characters in `format` with `value`. If `value` is shorter
/// than the run, it is zero-padded; if longer, it is used verbatim (never truncated — losing
/// digits would introduce collisions).
fn format_placeholder(format: &str, value: &str) -> String {
    if let Some(start) = format.find('X') {
        let run_len = format[start..].chars().take_while(|&c| c == 'X').count();
        let padded = if value.len() < run_len {
            format!("{}{}", "0".repeat(run_len - value.len()), value)
        } else {
            value.to_string()
        };
        format!("{}{}{}", &format[..start], padded, &format[start + run_len..])
    } else {
        format.to_string()
    }
}

fn format_index(format: &str, value: u64) -> String {
    format_placeholder(format, &value.to_string())
}

/// Hash `(salt, original)` with a keyed Blake2b digest and reduce it mod 10^digits, returned as
/// a zero-padded decimal string of exactly `digits` characters.
fn hash_digits(salt: &str, original: &str, digits: u32) -> String {
    let mut hasher = Blake2b64::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"\0");
    hasher.update(original.as_bytes());
    let result = hasher.finalize();
    let raw = u64::from_be_bytes(result.into());
    let modulus = 10u64.saturating_pow(digits.min(19));
    let value = if modulus == 0 { raw } else { raw % modulus };
    format!("{:0width$}", value, width = digits as usize)
}

fn path_segment(path: &Path, segment: usize) -> Option<String> {
    path.components()
        .filter_map(|c| c.as_os_str().to_str())
        .nth(segment.saturating_sub(1))
        .map(|s| s.to_string())
}

#[derive(Debug)]
pub enum IdStrategy {
    None,
    Folder {
        segment: usize,
        pattern: Option<Regex>,
        format: String,
    },
    Csv {
        mapping: HashMap<String, String>,
        fallback: CsvFallback,
        format: String,
        salt: String,
        /// Precomputed `original → formatted-id` for every PatientID missing from `mapping`
        /// when `fallback` is `SequentialPerTopFolder`. Populated once via
        /// [`discover_csv_fallback`] before the engine runs; `map` only ever does a lookup
        /// against it, never assigns on the fly (see [`discover_csv_fallback`] doc comment).
        fallback_assignments: HashMap<String, String>,
    },
    Deterministic {
        salt: String,
        digits: u32,
        format: String,
    },
    Sequential {
        assignments: HashMap<String, String>,
    },
}

impl IdStrategy {
    /// Build a strategy from config. `Sequential` requires its discovery-assignment map to have
    /// been computed beforehand via [`discover_sequential`]; a `Csv` strategy whose fallback is
    /// `SequentialPerTopFolder` likewise requires `csv_fallback_assignments` to have been
    /// computed beforehand via [`discover_csv_fallback`].
    pub fn from_config(
        config: &IdStrategyConfig,
        csv_mapping: Option<HashMap<String, String>>,
        sequential_assignments: Option<HashMap<String, String>>,
        csv_fallback_assignments: Option<HashMap<String, String>>,
    ) -> Self {
        match config {
            IdStrategyConfig::None => IdStrategy::None,
            IdStrategyConfig::Folder {
                segment,
                pattern,
                format,
            } => IdStrategy::Folder {
                segment: *segment,
                pattern: pattern.as_ref().and_then(|p| Regex::new(p).ok()),
                format: format.clone(),
            },
            IdStrategyConfig::Csv {
                fallback,
                format,
                salt,
                ..
            } => IdStrategy::Csv {
                mapping: csv_mapping.unwrap_or_default(),
                fallback: *fallback,
                format: format.clone(),
                salt: salt.clone(),
                fallback_assignments: csv_fallback_assignments.unwrap_or_default(),
            },
            IdStrategyConfig::Deterministic {
                salt,
                digits,
                format,
            } => IdStrategy::Deterministic {
                salt: salt.clone(),
                digits: *digits,
                format: format.clone(),
            },
            IdStrategyConfig::Sequential { .. } => IdStrategy::Sequential {
                assignments: sequential_assignments.unwrap_or_default(),
            },
        }
    }

    /// `strategy.map(original, path)`. A total function: never fails, the identity strategy is
    /// the only one allowed to reproduce the input verbatim.
    pub fn map(&self, original: &str, rel_path: &Path) -> String {
        match self {
            IdStrategy::None => original.to_string(),
            IdStrategy::Folder {
                segment,
                pattern,
                format,
            } => {
                let raw = path_segment(rel_path, *segment).unwrap_or_default();
                let token = match pattern {
                    Some(re) => re
                        .captures(&raw)
                        .and_then(|c| c.get(1))
                        .map(|m| m.as_str().to_string())
                        .unwrap_or(raw),
                    None => raw,
                };
                format_placeholder(format, &token)
            }
            IdStrategy::Csv {
                mapping,
                fallback,
                format,
                salt,
                fallback_assignments,
            } => {
                if let Some(target) = mapping.get(original).filter(|t| !t.is_empty()) {
                    return target.clone();
                }
                match fallback {
                    CsvFallback::Hash => {
                        let run_len = format
                            .find('X')
                            .map(|start| {
                                format[start..].chars().take_while(|&c| c == 'X').count()
                            })
                            .unwrap_or(5) as u32;
                        format_placeholder(format, &hash_digits(salt, original, run_len))
                    }
                    CsvFallback::SequentialPerTopFolder => fallback_assignments
                        .get(original)
                        .cloned()
                        .unwrap_or_else(|| original.to_string()),
                }
            }
            IdStrategy::Deterministic {
                salt,
                digits,
                format,
            } => format_placeholder(format, &hash_digits(salt, original, *digits)),
            IdStrategy::Sequential { assignments } => assignments
                .get(original)
                .cloned()
                .unwrap_or_else(|| original.to_string()),
        }
    }
}

/// Run the discovery pass for the `sequential` strategy and return `original → formatted-id`.
///
/// `read_identity` performs one lightweight DICOM read and returns `(patientId, studyUid)` for
/// a candidate file, or `None` if the file could not be read.
///
/// Per-top-folder discovery intentionally selects the *first* candidate file iteration produces
/// for each top-level folder rather than the lexicographically smallest one, matching observed
/// behavior of the system this was distilled from (see DESIGN.md open-question decision #1):
/// the resulting ID ordering can depend on filesystem iteration order when a folder holds
/// multiple files whose earliest-discovered PatientID differs from its lexicographically first.
pub fn discover_sequential<F>(
    top_level_dirs: &[PathBuf],
    candidates_of: impl Fn(&Path) -> Vec<PathBuf>,
    discovery: SequentialDiscovery,
    format: &str,
    base: u64,
    read_identity: F,
) -> HashMap<String, String>
where
    F: Fn(&Path) -> Option<(String, String)>,
{
    let mut ordered_originals: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    let mut dirs = top_level_dirs.to_vec();
    dirs.sort();

    match discovery {
        SequentialDiscovery::PerTopFolder => {
            for dir in &dirs {
                for candidate in candidates_of(dir) {
                    if let Some((patient_id, _study_uid)) = read_identity(&candidate) {
                        if seen.insert(patient_id.clone()) {
                            ordered_originals.push(patient_id);
                        }
                        break;
                    }
                }
            }
        }
        SequentialDiscovery::OnePerStudy => {
            let mut seen_studies = std::collections::HashSet::new();
            for dir in &dirs {
                for candidate in candidates_of(dir) {
                    if let Some((patient_id, study_uid)) = read_identity(&candidate) {
                        if seen_studies.insert(study_uid) && seen.insert(patient_id.clone()) {
                            ordered_originals.push(patient_id);
                        }
                    }
                }
            }
        }
        SequentialDiscovery::All => {
            let mut all: Vec<String> = Vec::new();
            for dir in &dirs {
                for candidate in candidates_of(dir) {
                    if let Some((patient_id, _)) = read_identity(&candidate) {
                        if seen.insert(patient_id.clone()) {
                            all.push(patient_id);
                        }
                    }
                }
            }
            all.sort();
            ordered_originals = all;
        }
    }

    ordered_originals
        .into_iter()
        .enumerate()
        .map(|(i, original)| (original, format_index(format, base + i as u64)))
        .collect()
}

/// Smallest number the `SequentialPerTopFolder` fallback's counter may start from: one past the
/// largest numeric suffix already present among `mapping`'s non-empty target values that share
/// `format`'s static (non-`X`) prefix, or `1` if none parse.
fn starting_number_for_missing(mapping: &HashMap<String, String>, format: &str) -> u64 {
    let width = format.chars().filter(|&c| c == 'X').count();
    let static_prefix: String = if width > 0 {
        format.replacen(&"X".repeat(width), "", 1)
    } else {
        format.to_string()
    };
    mapping
        .values()
        .filter(|v| !v.is_empty())
        .filter_map(|v| {
            let suffix = if !static_prefix.is_empty() && v.starts_with(static_prefix.as_str()) {
                &v[static_prefix.len()..]
            } else {
                v.as_str()
            };
            suffix.parse::<u64>().ok()
        })
        .max()
        .map(|m| m + 1)
        .unwrap_or(1)
}

/// Eager discovery pass for the `csv` strategy's `SequentialPerTopFolder` fallback (§4.2):
/// assigns every PatientID missing from `mapping` an id drawn from one counter shared across the
/// whole source tree, never reset per folder despite the variant's name. Candidate discovery
/// uses the same per-top-folder pass as [`discover_sequential`]'s `PerTopFolder` mode (first
/// candidate file `read_identity` succeeds on per top-level folder, in sorted folder order);
/// PatientIDs that already have a non-empty mapping entry are skipped without consuming a
/// counter value.
pub fn discover_csv_fallback<F>(
    top_level_dirs: &[PathBuf],
    candidates_of: impl Fn(&Path) -> Vec<PathBuf>,
    mapping: &HashMap<String, String>,
    format: &str,
    read_identity: F,
) -> HashMap<String, String>
where
    F: Fn(&Path) -> Option<(String, String)>,
{
    let mut dirs = top_level_dirs.to_vec();
    dirs.sort();

    let mut ordered_originals: Vec<String> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for dir in &dirs {
        for candidate in candidates_of(dir) {
            if let Some((patient_id, _study_uid)) = read_identity(&candidate) {
                if seen.insert(patient_id.clone()) {
                    ordered_originals.push(patient_id);
                }
                break;
            }
        }
    }

    let mut next_counter = starting_number_for_missing(mapping, format);
    let mut assignments = HashMap::new();
    for original in ordered_originals {
        if mapping.get(&original).filter(|t| !t.is_empty()).is_some() {
            continue;
        }
        assignments.insert(original, format_index(format, next_counter));
        next_counter += 1;
    }
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_placeholder_zero_pads() {
        assert_eq!(format_placeholder("SUBJXXXX", "1"), "SUBJ0001");
        assert_eq!(format_placeholder("SUBJXXXX", "12345"), "SUBJ12345");
    }

    #[test]
    fn none_strategy_is_identity() {
        let strategy = IdStrategy::None;
        assert_eq!(strategy.map("P001", Path::new("P001/a.dcm")), "P001");
    }

    #[test]
    fn deterministic_is_stable() {
        let strategy = IdStrategy::Deterministic {
            salt: "s".to_string(),
            digits: 5,
            format: "MISSEDXXXXX".to_string(),
        };
        let a = strategy.map("B", Path::new("B/a.dcm"));
        let b = strategy.map("B", Path::new("B/a.dcm"));
        assert_eq!(a, b);
        assert!(a.starts_with("MISSED"));
        assert_eq!(a.len(), "MISSED".len() + 5);
    }

    #[test]
    fn csv_hash_fallback_matches_deterministic_digits() {
        let mut mapping = HashMap::new();
        mapping.insert("A".to_string(), "X01".to_string());
        let strategy = IdStrategy::Csv {
            mapping,
            fallback: CsvFallback::Hash,
            format: "MISSEDXXXXX".to_string(),
            salt: "s".to_string(),
            fallback_assignments: HashMap::new(),
        };
        assert_eq!(strategy.map("A", Path::new("A/a.dcm")), "X01");
        let missed = strategy.map("B", Path::new("B/a.dcm"));
        assert!(missed.starts_with("MISSED"));
        assert_eq!(missed.len(), "MISSED".len() + 5);
    }

    #[test]
    fn csv_sequential_fallback_uses_one_global_counter_not_per_folder() {
        let mapping = HashMap::new();
        let assignments = discover_csv_fallback(
            &[PathBuf::from("P1"), PathBuf::from("P2"), PathBuf::from("P3")],
            |dir| vec![dir.join("a.dcm")],
            &mapping,
            "MISSEDXXXXX",
            |path| {
                if path.starts_with("P1") {
                    Some(("A".to_string(), "study1".to_string()))
                } else if path.starts_with("P2") {
                    Some(("B".to_string(), "study2".to_string()))
                } else {
                    Some(("C".to_string(), "study3".to_string()))
                }
            },
        );
        assert_eq!(assignments.get("A").unwrap(), "MISSED00001");
        assert_eq!(assignments.get("B").unwrap(), "MISSED00002");
        assert_eq!(assignments.get("C").unwrap(), "MISSED00003");

        let strategy = IdStrategy::Csv {
            mapping: HashMap::new(),
            fallback: CsvFallback::SequentialPerTopFolder,
            format: "MISSEDXXXXX".to_string(),
            salt: "s".to_string(),
            fallback_assignments: assignments,
        };
        assert_eq!(strategy.map("A", Path::new("P1/a.dcm")), "MISSED00001");
        assert_eq!(strategy.map("C", Path::new("P3/a.dcm")), "MISSED00003");
    }

    #[test]
    fn csv_sequential_fallback_skips_already_mapped_ids_without_consuming_counter() {
        let mut mapping = HashMap::new();
        mapping.insert("A".to_string(), "KEEP001".to_string());
        let assignments = discover_csv_fallback(
            &[PathBuf::from("P1"), PathBuf::from("P2")],
            |dir| vec![dir.join("a.dcm")],
            &mapping,
            "MISSEDXXXXX",
            |path| {
                if path.starts_with("P1") {
                    Some(("A".to_string(), "study1".to_string()))
                } else {
                    Some(("B".to_string(), "study2".to_string()))
                }
            },
        );
        assert!(assignments.get("A").is_none());
        assert_eq!(assignments.get("B").unwrap(), "MISSED00001");
    }

    #[test]
    fn sequential_discovery_assigns_in_order() {
        let assignments = discover_sequential(
            &[PathBuf::from("P1"), PathBuf::from("P2")],
            |dir| vec![dir.join("a.dcm")],
            SequentialDiscovery::PerTopFolder,
            "SUBJXXXX",
            1,
            |path| {
                if path.starts_with("P1") {
                    Some(("A".to_string(), "study1".to_string()))
                } else {
                    Some(("B".to_string(), "study2".to_string()))
                }
            },
        );
        assert_eq!(assignments.get("A").unwrap(), "SUBJ0001");
        assert_eq!(assignments.get("B").unwrap(), "SUBJ0002");
    }
}
