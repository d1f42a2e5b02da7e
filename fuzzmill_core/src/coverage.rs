//! Coverage measurement for one fuzz target.
//!
//! The engine itself reports coverage: running `go test -fuzz` with
//! `GODEBUG=fuzzdebug=1` and a fuzztime of exactly `seed adds + corpus
//! files` iterations makes it process every baseline input and print the
//! number of coverage bits without performing any mutation.

use anyhow::Context;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoverageError {
    #[error("coverage bits not found in fuzz output:\n{0}")]
    BitsNotFound(String),
    #[error("baseline coverage counters not found in fuzz output:\n{0}")]
    BaselineNotFound(String),
}

/// Run `go <args>` inside `pkg_dir` and return the combined output.
/// A non-zero exit is an error carrying that output.
pub fn run_go(pkg_dir: &Path, args: &[String], envs: &[(&str, &str)]) -> anyhow::Result<String> {
    let mut cmd = Command::new("go");
    cmd.args(args).current_dir(pkg_dir);
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let output = cmd
        .output()
        .with_context(|| format!("failed to run go {:?} in {}", args, pkg_dir.display()))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        anyhow::bail!(
            "go {:?} failed in {} ({}): {}",
            args,
            pkg_dir.display(),
            output.status,
            combined.trim()
        );
    }
    Ok(combined)
}

/// Number of plain files in `corpus_dir/<target>`; a missing directory
/// holds zero inputs.
pub fn count_corpus_files(corpus_dir: &Path, target: &str) -> anyhow::Result<usize> {
    let dir = corpus_dir.join(target);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("read corpus dir {}", dir.display())),
    };
    let mut n = 0;
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            n += 1;
        }
    }
    Ok(n)
}

/// Measure the coverage bits reached by the target's baseline inputs: the
/// program-embedded seeds plus the files currently in `corpus_dir/<target>`.
///
/// `seed_adds` is the number of seeds the target registers via `f.Add`,
/// obtained once per target from [`seed_adds`].
pub fn measure(
    pkg_dir: &Path,
    corpus_dir: &Path,
    target: &str,
    seed_adds: usize,
) -> anyhow::Result<u64> {
    let corpus_files = count_corpus_files(corpus_dir, target)?;
    let iterations = seed_adds + corpus_files;
    if iterations == 0 {
        return Ok(0);
    }

    let output = run_fuzz_iterations(pkg_dir, corpus_dir, target, iterations)?;
    parse_coverage_bits(&output)
        .ok_or_else(|| CoverageError::BitsNotFound(output).into())
}

/// Count the seeds a target adds programmatically. One engine iteration is
/// enough: the baseline progress line reports the total number of baseline
/// inputs, and everything that is not a corpus file is a seed.
pub fn seed_adds(pkg_dir: &Path, corpus_dir: &Path, target: &str) -> anyhow::Result<usize> {
    let corpus_files = count_corpus_files(corpus_dir, target)?;
    let output = run_fuzz_iterations(pkg_dir, corpus_dir, target, 1)?;
    let (_, total) = parse_baseline_total(&output)
        .ok_or(CoverageError::BaselineNotFound(output))?;
    Ok((total as usize).saturating_sub(corpus_files))
}

fn run_fuzz_iterations(
    pkg_dir: &Path,
    corpus_dir: &Path,
    target: &str,
    iterations: usize,
) -> anyhow::Result<String> {
    // -run together with -fuzz skips the package's unit tests; the fixed
    // fuzztime stops the engine right after the baseline pass.
    let args = vec![
        "test".to_string(),
        format!("-run=^{}$", target),
        format!("-fuzz=^{}$", target),
        format!("-fuzztime={}x", iterations),
        format!("-test.fuzzcachedir={}", corpus_dir.display()),
    ];
    run_go(pkg_dir, &args, &[("GODEBUG", "fuzzdebug=1")])
}

/// Extract `initial coverage bits: <N>` printed under fuzzdebug.
pub fn parse_coverage_bits(output: &str) -> Option<u64> {
    let re = Regex::new(r"initial coverage bits:\s+([0-9]+)").unwrap();
    let caps = re.captures(output)?;
    caps[1].parse().ok()
}

/// Extract the final `gathering baseline coverage: <k>/<total>` counters.
pub fn parse_baseline_total(output: &str) -> Option<(u64, u64)> {
    let re = Regex::new(r"gathering baseline coverage:\s+([0-9]+)/([0-9]+)").unwrap();
    let caps = re.captures_iter(output).last()?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_coverage_bits() {
        let output = "fuzz: elapsed: 0s, gathering baseline coverage: 0/3 completed\n\
                      DEBUG finished processing input corpus, initial coverage bits: 287\n\
                      fuzz: elapsed: 0s, gathering baseline coverage: 3/3 completed\n";
        assert_eq!(parse_coverage_bits(output), Some(287));
        assert_eq!(parse_coverage_bits("PASS\nok\n"), None);
    }

    #[test]
    fn parses_last_baseline_counters() {
        let output = "fuzz: elapsed: 0s, gathering baseline coverage: 0/5 completed\n\
                      fuzz: elapsed: 1s, gathering baseline coverage: 5/5 completed\n";
        assert_eq!(parse_baseline_total(output), Some((5, 5)));
        assert_eq!(parse_baseline_total("no counters here"), None);
    }

    #[test]
    fn counts_only_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        let target_dir = dir.path().join("FuzzFoo");
        std::fs::create_dir_all(target_dir.join("nested")).unwrap();
        std::fs::write(target_dir.join("a"), b"1").unwrap();
        std::fs::write(target_dir.join("b"), b"2").unwrap();
        assert_eq!(count_corpus_files(dir.path(), "FuzzFoo").unwrap(), 2);
        assert_eq!(count_corpus_files(dir.path(), "FuzzMissing").unwrap(), 0);
    }
}
