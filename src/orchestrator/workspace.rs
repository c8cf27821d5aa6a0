//! Per-plan working copies of the submission tree.

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::preflight::{fixups, TEXT_EXTENSIONS};
use crate::submission::{FileRole, Submission};

/// Files whose contents decide whether cross-references have settled.
pub const DIGEST_EXTENSIONS: &[&str] = &["aux", "toc", "out"];

/// Copies every non-ignored file of `submission` below `dest`.
///
/// Each plan compiles in its own copy, so concurrent plans never see each
/// other's intermediate files and the extracted tree stays pristine.
pub fn prepare(submission: &Submission, dest: &Path) -> io::Result<usize> {
    fs::create_dir_all(dest)?;
    let mut copied = 0;
    for file in submission.files.values() {
        if file.role == FileRole::Ignored {
            continue;
        }
        let target = dest.join(&file.path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(submission.abs(&file.path), &target)?;
        copied += 1;
    }
    debug!(dest = %dest.display(), copied, "workspace prepared");
    Ok(copied)
}

/// Rewrites text sources in the working copy with the known source fixups.
///
/// Returns the relative paths that changed.
pub fn apply_fixups(submission: &Submission, dest: &Path) -> io::Result<Vec<String>> {
    let mut changed = Vec::new();
    for file in submission.files.values() {
        if file.role == FileRole::Ignored || !TEXT_EXTENSIONS.contains(&file.extension().as_str()) {
            continue;
        }
        let path = dest.join(&file.path);
        let bytes = fs::read(&path)?;
        let text = String::from_utf8_lossy(&bytes);
        if let Some(fixed) = fixups::apply(&text) {
            fs::write(&path, fixed)?;
            changed.push(file.path.clone());
        }
    }
    Ok(changed)
}

/// Digest over a job's cross-reference files, `None` when none exist yet.
pub fn aux_digest(dir: &Path, job: &str) -> Option<String> {
    let mut hasher = Sha256::new();
    let mut seen = false;
    for ext in DIGEST_EXTENSIONS {
        if let Ok(bytes) = fs::read(dir.join(format!("{}.{}", job, ext))) {
            hasher.update(ext.as_bytes());
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
            seen = true;
        }
    }
    seen.then(|| hex::encode(hasher.finalize()))
}

/// Directory name for a plan's working copy.
pub fn plan_dir(work_root: &Path, index: usize, entry: &str) -> PathBuf {
    let flat: String = entry
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect();
    work_root.join(format!("{:02}-{}", index, flat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn submission(files: &[(&str, &str)]) -> (TempDir, Submission) {
        let dir = TempDir::new().unwrap();
        for (path, body) in files {
            let p = dir.path().join(path);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, body).unwrap();
        }
        let sub = Submission::scan(dir.path(), None).unwrap();
        (dir, sub)
    }

    #[test]
    fn test_prepare_skips_ignored() {
        let (_src, mut sub) = submission(&[("main.tex", "x"), ("sub/fig.pdf", "y"), ("junk.txt", "z")]);
        sub.set_role("junk.txt", FileRole::Ignored, crate::submission::RoleSource::Manifest);
        let dest = TempDir::new().unwrap();
        assert_eq!(prepare(&sub, dest.path()).unwrap(), 2);
        assert!(dest.path().join("sub/fig.pdf").exists());
        assert!(!dest.path().join("junk.txt").exists());
    }

    #[test]
    fn test_fixups_touch_only_matching_sources() {
        let (_src, sub) = submission(&[
            ("main.tex", "\\graphicspath{{figs}}\n"),
            ("other.tex", "plain\n"),
        ]);
        let dest = TempDir::new().unwrap();
        prepare(&sub, dest.path()).unwrap();
        let changed = apply_fixups(&sub, dest.path()).unwrap();
        assert_eq!(changed, vec!["main.tex".to_string()]);
        let fixed = fs::read_to_string(dest.path().join("main.tex")).unwrap();
        assert!(fixed.contains("\\graphicspath{{figs/}}"));
        // Source tree is untouched
        assert_eq!(fs::read_to_string(sub.abs("main.tex")).unwrap(), "\\graphicspath{{figs}}\n");
    }

    #[test]
    fn test_aux_digest_tracks_changes() {
        let dir = TempDir::new().unwrap();
        assert_eq!(aux_digest(dir.path(), "main"), None);
        fs::write(dir.path().join("main.aux"), "\\relax\n").unwrap();
        let first = aux_digest(dir.path(), "main").unwrap();
        assert_eq!(aux_digest(dir.path(), "main").unwrap(), first);
        fs::write(dir.path().join("main.toc"), "\\contentsline\n").unwrap();
        assert_ne!(aux_digest(dir.path(), "main").unwrap(), first);
    }

    #[test]
    fn test_plan_dir_is_flat() {
        let root = Path::new("/work");
        assert_eq!(plan_dir(root, 1, "paper/main.tex"), PathBuf::from("/work/01-paper_main.tex"));
    }
}
