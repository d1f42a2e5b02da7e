//! Greedy coverage-preserving corpus reduction.

use crate::coverage;
use crate::util::{copy_file, ensure_dir};
use anyhow::Context;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinimizeOutcome {
    /// Inputs deleted from the corpus.
    pub removed: usize,
    /// Coverage bits of the surviving set.
    pub final_coverage: u64,
}

/// Prune corpus inputs of `target` that do not contribute coverage.
///
/// Files are replayed from smallest to largest into an empty scratch cache;
/// a file survives only if it strictly increases the measured coverage.
/// Deletions apply to the real corpus as well, so the reduction persists
/// with the next upload.
pub fn minimize_corpus(
    pkg_dir: &Path,
    corpus_dir: &Path,
    target: &str,
    seed_adds: usize,
) -> anyhow::Result<MinimizeOutcome> {
    // Start from a clean project tree so program-embedded seeds are
    // measured through the coverage path, not as corpus files.
    let testdata_dir = pkg_dir.join("testdata").join("fuzz").join(target);
    if let Err(e) = fs::remove_dir_all(&testdata_dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(e).with_context(|| format!("removing {}", testdata_dir.display()));
        }
    }

    let scratch = tempfile::Builder::new()
        .prefix("fuzzmill-cache-")
        .tempdir()
        .context("creating scratch cache dir")?;
    let scratch_target = scratch.path().join(target);
    ensure_dir(&scratch_target).context("creating scratch corpus dir")?;

    let corpus_target = corpus_dir.join(target);
    let files = match list_files_by_size(&corpus_target) {
        Ok(files) => files,
        Err(NotADir) => {
            return Ok(MinimizeOutcome {
                removed: 0,
                final_coverage: 0,
            })
        }
    };

    let mut best = 0u64;
    let mut removed = 0usize;
    for file in files {
        let src = corpus_target.join(&file.name);
        let dst = scratch_target.join(&file.name);
        copy_file(&src, &dst)?;

        let new = coverage::measure(pkg_dir, scratch.path(), target, seed_adds)
            .with_context(|| format!("measuring coverage for {}", file.name))?;

        if new > best {
            best = new;
            continue;
        }
        if new < best {
            log::warn!(
                "nondeterministic fuzz target {}: coverage decreased on {} ({} -> {})",
                target,
                file.name,
                best,
                new
            );
        }
        fs::remove_file(&src).with_context(|| format!("remove {}", src.display()))?;
        fs::remove_file(&dst).with_context(|| format!("remove {}", dst.display()))?;
        removed += 1;
    }

    log::info!(
        "corpus minimization complete for {}: removed {}, final coverage {}",
        target,
        removed,
        best
    );
    Ok(MinimizeOutcome {
        removed,
        final_coverage: best,
    })
}

struct FileEntry {
    name: String,
    size: u64,
}

struct NotADir;

/// Corpus files sorted smallest first; name breaks ties so the order is
/// stable across runs.
fn list_files_by_size(dir: &Path) -> Result<Vec<FileEntry>, NotADir> {
    let entries = fs::read_dir(dir).map_err(|_| NotADir)?;
    let mut files = Vec::new();
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        files.push(FileEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: meta.len(),
        });
    }
    sort_by_size(&mut files);
    Ok(files)
}

fn sort_by_size(files: &mut [FileEntry]) {
    files.sort_by(|a, b| a.size.cmp(&b.size).then_with(|| a.name.cmp(&b.name)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_by_size_then_name() {
        let mut files = vec![
            FileEntry {
                name: "bbb".into(),
                size: 10,
            },
            FileEntry {
                name: "aaa".into(),
                size: 10,
            },
            FileEntry {
                name: "zzz".into(),
                size: 1,
            },
        ];
        sort_by_size(&mut files);
        let order: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(order, ["zzz", "aaa", "bbb"]);
    }

    #[test]
    fn listing_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("small"), b"x").unwrap();
        std::fs::write(dir.path().join("large"), b"xxxx").unwrap();
        let files = list_files_by_size(dir.path()).ok().unwrap();
        let order: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(order, ["small", "large"]);
    }

    #[test]
    fn missing_corpus_dir_minimizes_nothing() {
        let pkg = tempfile::tempdir().unwrap();
        let corpus = tempfile::tempdir().unwrap();
        let out = minimize_corpus(pkg.path(), corpus.path(), "FuzzAbsent", 0).unwrap();
        assert_eq!(out.removed, 0);
        assert_eq!(out.final_coverage, 0);
    }
}
