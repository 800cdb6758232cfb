//! Derivatives Layout Manager (§4.1): normalizes a user-selected cohort root into
//! `derivatives/dcm-original` and `derivatives/dcm-raw`, detecting resume state.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{CoreResult, CreateDirSnafu};
use snafu::ResultExt;

const DERIVATIVES: &str = "derivatives";
const DCM_ORIGINAL: &str = "dcm-original";
const DCM_RAW: &str = "dcm-raw";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStatus {
    Fresh,
    RawExistsEmpty,
    RawExistsWithContent,
}

#[derive(Debug, Clone)]
pub struct DerivativesLayout {
    pub source_path: PathBuf,
    pub output_path: PathBuf,
    pub status: RawStatus,
}

fn is_dir_nonempty(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Which of the six layouts `root` matches.
enum Layout {
    /// `root` itself is the `dcm-original` directory.
    OriginalSelected,
    /// `root` itself is the `dcm-raw` directory.
    RawSelected,
    /// `root` itself is the `derivatives/` directory.
    DerivativesSelected,
    /// `root` already contains both `derivatives/dcm-original` and `derivatives/dcm-raw`.
    CohortRoot,
    /// `root` already has `dcm-original` and `dcm-raw` as direct children, with no `derivatives/`
    /// wrapper — an already-populated flat cohort root, not one awaiting migration.
    FlatCohortRoot,
    /// `root` is a cohort root whose contents still need migrating into `derivatives/dcm-original`.
    NeedsMigration,
}

fn classify(root: &Path) -> Layout {
    let name = root.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if name == DCM_ORIGINAL {
        return Layout::OriginalSelected;
    }
    if name == DCM_RAW {
        return Layout::RawSelected;
    }
    if name == DERIVATIVES {
        return Layout::DerivativesSelected;
    }
    let derivatives = root.join(DERIVATIVES);
    if derivatives.join(DCM_ORIGINAL).is_dir() || derivatives.join(DCM_RAW).is_dir() {
        return Layout::CohortRoot;
    }
    if root.join(DCM_ORIGINAL).is_dir() && root.join(DCM_RAW).is_dir() {
        return Layout::FlatCohortRoot;
    }
    Layout::NeedsMigration
}

/// Resolve `root` into `(sourcePath, outputPath, status)`, migrating in place when necessary.
pub fn resolve_layout(root: &Path) -> CoreResult<DerivativesLayout> {
    let (source_path, output_path) = match classify(root) {
        Layout::OriginalSelected => {
            let derivatives_dir = root
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf());
            (root.to_path_buf(), derivatives_dir.join(DCM_RAW))
        }
        Layout::RawSelected => {
            let derivatives_dir = root
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| root.to_path_buf());
            (derivatives_dir.join(DCM_ORIGINAL), root.to_path_buf())
        }
        Layout::DerivativesSelected => (root.join(DCM_ORIGINAL), root.join(DCM_RAW)),
        Layout::CohortRoot => (
            root.join(DERIVATIVES).join(DCM_ORIGINAL),
            root.join(DERIVATIVES).join(DCM_RAW),
        ),
        Layout::FlatCohortRoot => (root.join(DCM_ORIGINAL), root.join(DCM_RAW)),
        Layout::NeedsMigration => {
            migrate_into_derivatives(root)?;
            (
                root.join(DERIVATIVES).join(DCM_ORIGINAL),
                root.join(DERIVATIVES).join(DCM_RAW),
            )
        }
    };

    let raw_had_content = is_dir_nonempty(&output_path);

    fs::create_dir_all(&source_path).context(CreateDirSnafu {
        path: source_path.clone(),
    })?;
    fs::create_dir_all(&output_path).context(CreateDirSnafu {
        path: output_path.clone(),
    })?;

    let status = if raw_had_content {
        RawStatus::RawExistsWithContent
    } else if output_path.exists() {
        RawStatus::RawExistsEmpty
    } else {
        RawStatus::Fresh
    };

    Ok(DerivativesLayout {
        source_path,
        output_path,
        status,
    })
}

/// Move every child of `root` into `root/derivatives/dcm-original/`, skipping anything whose
/// destination already exists.
fn migrate_into_derivatives(root: &Path) -> CoreResult<()> {
    let original_dir = root.join(DERIVATIVES).join(DCM_ORIGINAL);
    fs::create_dir_all(&original_dir).context(CreateDirSnafu {
        path: original_dir.clone(),
    })?;

    let entries = fs::read_dir(root).context(CreateDirSnafu {
        path: root.to_path_buf(),
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        if name == DERIVATIVES {
            continue;
        }
        let dest = original_dir.join(&name);
        if dest.exists() {
            warn!(?dest, "migration destination already exists, skipping");
            continue;
        }
        info!(?path, ?dest, "migrating cohort root child into dcm-original");
        fs::rename(&path, &dest).context(CreateDirSnafu { path: dest.clone() })?;
    }
    Ok(())
}

/// Empty the output directory non-destructively with respect to inputs.
pub fn clean_raw(output_path: &Path) -> CoreResult<()> {
    if !output_path.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(output_path)
        .context(CreateDirSnafu {
            path: output_path.to_path_buf(),
        })?
        .flatten()
    {
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).context(CreateDirSnafu { path: path.clone() })?;
        } else {
            fs::remove_file(&path).context(CreateDirSnafu { path: path.clone() })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn fresh_cohort_root_creates_both_dirs() {
        let dir = tempdir().unwrap();
        let layout = resolve_layout(dir.path()).unwrap();
        assert_eq!(layout.status, RawStatus::Fresh);
        assert!(layout.source_path.ends_with("dcm-original"));
        assert!(layout.output_path.ends_with("dcm-raw"));
        assert!(layout.source_path.is_dir());
        assert!(layout.output_path.is_dir());
    }

    #[test]
    fn migration_moves_existing_children() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("P1")).unwrap();
        fs::write(dir.path().join("P1").join("a.dcm"), b"x").unwrap();

        let layout = resolve_layout(dir.path()).unwrap();
        assert!(layout.source_path.join("P1").join("a.dcm").is_file());
        assert!(!dir.path().join("P1").exists());
    }

    #[test]
    fn flat_cohort_root_is_not_migrated() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join(DCM_ORIGINAL)).unwrap();
        fs::create_dir(dir.path().join(DCM_RAW)).unwrap();
        fs::create_dir(dir.path().join(DCM_ORIGINAL).join("P1")).unwrap();
        fs::write(dir.path().join(DCM_ORIGINAL).join("P1").join("a.dcm"), b"x").unwrap();

        let layout = resolve_layout(dir.path()).unwrap();
        assert_eq!(layout.source_path, dir.path().join(DCM_ORIGINAL));
        assert_eq!(layout.output_path, dir.path().join(DCM_RAW));
        assert!(layout.source_path.join("P1").join("a.dcm").is_file());
        assert!(!dir.path().join(DERIVATIVES).exists());
    }

    #[test]
    fn raw_with_content_is_reported() {
        let dir = tempdir().unwrap();
        let layout = resolve_layout(dir.path()).unwrap();
        fs::write(layout.output_path.join("marker.txt"), b"x").unwrap();

        let layout2 = resolve_layout(dir.path()).unwrap();
        assert_eq!(layout2.status, RawStatus::RawExistsWithContent);
    }
}
