//! Atomic writes and the `<base>.outcome.tar.gz` bundle
//!
//! The bundle is deterministic for identical inputs: entries are sorted, and
//! headers carry a zero mtime, zero uid/gid and normalized modes.

use flate2::write::GzEncoder;
use flate2::Compression;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, Header};
use walkdir::WalkDir;

use super::{OutcomeError, OUTCOME_FILE};

/// Suffix of the bundle file.
pub const BUNDLE_SUFFIX: &str = ".outcome.tar.gz";

/// Compiles include globs; `*` does not cross directory separators.
pub fn include_set(patterns: &[String]) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).literal_separator(true).build()?);
    }
    builder.build()
}

/// Write atomically to file (write-then-rename)
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut temp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);
    fs::write(&temp_path, bytes)?;
    fs::rename(&temp_path, path)
}

/// Relative paths below `out_dir` matched by `include`, sorted.
pub fn collect(out_dir: &Path, include: &GlobSet) -> Result<Vec<String>, OutcomeError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(out_dir).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(out_dir) else {
            continue;
        };
        let rel = rel.to_string_lossy().replace('\\', "/");
        if rel == OUTCOME_FILE || rel.ends_with(BUNDLE_SUFFIX) {
            continue;
        }
        if include.is_match(&rel) {
            files.push(rel);
        }
    }
    files.sort();
    Ok(files)
}

fn append(builder: &mut Builder<impl Write>, name: &str, contents: &[u8]) -> io::Result<()> {
    let mut header = Header::new_gnu();
    header.set_path(name)?;
    header.set_size(contents.len() as u64);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append(&header, contents)
}

/// Writes `<dest>` holding the outcome record followed by `files` from `out_dir`.
pub fn write_bundle(
    dest: &Path,
    record: &[u8],
    out_dir: &Path,
    files: &[String],
) -> Result<PathBuf, OutcomeError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    {
        let mut builder = Builder::new(&mut encoder);
        append(&mut builder, OUTCOME_FILE, record)?;
        for rel in files {
            let contents = fs::read(out_dir.join(rel))?;
            append(&mut builder, rel, &contents)?;
        }
        builder.finish()?;
    }
    let bytes = encoder.finish()?;
    write_atomic(dest, &bytes)?;
    Ok(dest.to_path_buf())
}
