//! Filesystem Traversal & Signature Reader (§4.6): three traversal modes shared by the
//! Anonymization Engine and the Extraction Engine, built on `walkdir`.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};

use tracing::warn;
use walkdir::WalkDir;

/// A file is a *candidate* iff its suffix is `.dcm` (case-insensitive) or empty.
pub fn is_candidate(path: &Path) -> bool {
    match path.extension() {
        None => true,
        Some(ext) => ext.eq_ignore_ascii_case("dcm"),
    }
}

/// Streaming mode: yield files as discovered, breadth-first. Directories that can't be read
/// (Path-absent / Permission-denied, §7) are skipped silently mid-scan rather than aborting.
pub fn traverse_streaming(root: &Path) -> Receiver<PathBuf> {
    let (tx, rx) = channel();
    let root = root.to_path_buf();
    std::thread::spawn(move || {
        let mut queue: VecDeque<PathBuf> = VecDeque::new();
        queue.push_back(root);
        while let Some(dir) = queue.pop_front() {
            let entries = match std::fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(?dir, error = %e, "skipping unreadable directory during streaming traversal");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    queue.push_back(path);
                } else if is_candidate(&path) {
                    if tx.send(path).is_err() {
                        return;
                    }
                }
            }
        }
    });
    rx
}

/// Leaf-batched mode: buffer candidates until a threshold of distinct parent directories is
/// reached, then emit that batch sorted by `(parent, name)`. The final partial batch (if any)
/// is emitted too.
pub fn traverse_leaf_batched(root: &Path, parent_threshold: usize) -> Vec<Vec<PathBuf>> {
    let mut batches = Vec::new();
    let mut buffer: Vec<PathBuf> = Vec::new();
    let mut parents: HashSet<PathBuf> = HashSet::new();

    for entry in WalkDir::new(root).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        if !is_candidate(&path) {
            continue;
        }
        if let Some(parent) = path.parent() {
            parents.insert(parent.to_path_buf());
        }
        buffer.push(path);
        if parents.len() >= parent_threshold {
            batches.push(sort_batch(std::mem::take(&mut buffer)));
            parents.clear();
        }
    }
    if !buffer.is_empty() {
        batches.push(sort_batch(buffer));
    }
    batches
}

fn sort_batch(mut batch: Vec<PathBuf>) -> Vec<PathBuf> {
    batch.sort_by(|a, b| {
        let pa = a.parent().map(Path::to_path_buf).unwrap_or_default();
        let pb = b.parent().map(Path::to_path_buf).unwrap_or_default();
        pa.cmp(&pb).then_with(|| a.file_name().cmp(&b.file_name()))
    });
    batch
}

/// Depth-first mode: recurse into each directory fully, sorting children lexicographically.
pub fn traverse_depth_first(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| is_candidate(p))
        .collect()
}

/// Top-level directories directly under `root`, sorted lexicographically — the unit of
/// round-robin partitioning for the Anonymization Engine (§4.3).
pub fn top_level_dirs(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn candidate_accepts_dcm_and_extensionless() {
        assert!(is_candidate(Path::new("a.dcm")));
        assert!(is_candidate(Path::new("a.DCM")));
        assert!(is_candidate(Path::new("a")));
        assert!(!is_candidate(Path::new("a.txt")));
    }

    #[test]
    fn depth_first_sorts_lexicographically() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.dcm"), b"x").unwrap();
        std::fs::write(dir.path().join("a.dcm"), b"x").unwrap();
        let files = traverse_depth_first(dir.path());
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.dcm", "b.dcm"]);
    }

    #[test]
    fn leaf_batched_emits_final_partial_batch() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("P1")).unwrap();
        std::fs::write(dir.path().join("P1").join("a.dcm"), b"x").unwrap();
        let batches = traverse_leaf_batched(dir.path(), 10);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
    }
}
