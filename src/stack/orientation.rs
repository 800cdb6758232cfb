//! Orientation category + confidence (§4.9): derived from the DICOM `ImageOrientationPatient`
//! vector by projecting the cross product of its row/column cosines onto the canonical axes.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum OrientationCategory {
    Axial,
    Coronal,
    Sagittal,
}

impl OrientationCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            OrientationCategory::Axial => "Axial",
            OrientationCategory::Coronal => "Coronal",
            OrientationCategory::Sagittal => "Sagittal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Axial" => Some(OrientationCategory::Axial),
            "Coronal" => Some(OrientationCategory::Coronal),
            "Sagittal" => Some(OrientationCategory::Sagittal),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Orientation {
    pub category: OrientationCategory,
    pub confidence: f64,
}

/// Default returned on any parse failure (§4.9): `None` input, empty string, fewer than 6
/// components, or any component that fails float parsing.
fn fallback() -> Orientation {
    Orientation {
        category: OrientationCategory::Axial,
        confidence: 0.5,
    }
}

/// Strip one layer of surrounding `[...]` brackets and `'...'`/`"..."` quotes, tolerating
/// whichever the source vendor's string serialization wrapped the backslash-separated value in.
fn strip_wrapping(s: &str) -> &str {
    let s = s.trim();
    let s = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')).unwrap_or(s);
    let s = s
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(s);
    s.strip_prefix('"').and_then(|s| s.strip_suffix('"')).unwrap_or(s)
}

fn parse_six_floats(raw: &str) -> Option<[f64; 6]> {
    let cleaned = strip_wrapping(raw);
    let parts: Vec<&str> = cleaned.split('\\').map(str::trim).collect();
    if parts.len() < 6 {
        return None;
    }
    let mut out = [0.0f64; 6];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = parts[i].parse::<f64>().ok()?;
    }
    Some(out)
}

fn cross(row: [f64; 3], col: [f64; 3]) -> [f64; 3] {
    [
        row[1] * col[2] - row[2] * col[1],
        row[2] * col[0] - row[0] * col[2],
        row[0] * col[1] - row[1] * col[0],
    ]
}

/// Derive orientation category + confidence from a raw `ImageOrientationPatient` string.
/// Falls back to `Axial`/0.5 on any parse failure (§4.9), so the function is total.
pub fn compute_orientation(raw: Option<&str>) -> Orientation {
    let Some(raw) = raw else {
        return fallback();
    };
    if raw.trim().is_empty() {
        return fallback();
    }
    let Some(values) = parse_six_floats(raw) else {
        return fallback();
    };

    let row = [values[0], values[1], values[2]];
    let col = [values[3], values[4], values[5]];
    let normal = cross(row, col);

    let (axis, magnitude) = [normal[0], normal[1], normal[2]]
        .iter()
        .enumerate()
        .map(|(i, v)| (i, v.abs()))
        .fold((0usize, 0.0f64), |best, cur| if cur.1 > best.1 { cur } else { best });

    let category = match axis {
        0 => OrientationCategory::Sagittal,
        1 => OrientationCategory::Coronal,
        _ => OrientationCategory::Axial,
    };

    Orientation {
        category,
        confidence: magnitude.clamp(0.0, 1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axial_unit_vectors_give_full_confidence() {
        let o = compute_orientation(Some(r"1\0\0\0\1\0"));
        assert_eq!(o.category, OrientationCategory::Axial);
        assert!((o.confidence - 1.0).abs() < 1e-9);
    }

    #[test]
    fn sagittal_orientation() {
        let o = compute_orientation(Some(r"0\1\0\0\0\-1"));
        assert_eq!(o.category, OrientationCategory::Sagittal);
    }

    #[test]
    fn noisy_vector_still_categorizes_stably() {
        let o = compute_orientation(Some(
            r"0.9997\-0.022\-0.005\-0.0076\-0.135\-0.991",
        ));
        assert_eq!(o.category, OrientationCategory::Axial);
    }

    #[test]
    fn bracket_and_quote_wrapping_is_tolerated() {
        let plain = compute_orientation(Some(r"1\0\0\0\1\0"));
        let bracketed = compute_orientation(Some(r"[1\0\0\0\1\0]"));
        let quoted = compute_orientation(Some("'1\\0\\0\\0\\1\\0'"));
        assert_eq!(plain, bracketed);
        assert_eq!(plain, quoted);
    }

    #[test]
    fn missing_or_short_vector_falls_back_to_axial_half_confidence() {
        assert_eq!(compute_orientation(None), fallback());
        assert_eq!(compute_orientation(Some("")), fallback());
        assert_eq!(compute_orientation(Some(r"1\0\0")), fallback());
        assert_eq!(compute_orientation(Some(r"a\b\c\d\e\f")), fallback());
    }
}
