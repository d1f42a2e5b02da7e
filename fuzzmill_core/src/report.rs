//! Coverage report store: a master index over all known targets plus a
//! per-target coverage history, both persisted as JSON next to rendered
//! HTML.

use crate::util::ensure_dir;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One `(package, target)` pair of the master index. The derived ordering
/// is the index ordering: by package, then by target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct TargetState {
    pub package: String,
    pub target: String,
}

/// One dated coverage measurement of a target, newest first in history
/// files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    pub date: String,
    pub coverage: u64,
    pub report: String,
}

/// Load `state.json`; a missing file is an empty index.
pub fn load_master_state(state_path: &Path) -> anyhow::Result<Vec<TargetState>> {
    let data = match fs::read(state_path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("read state file {}", state_path.display()))
        }
    };
    serde_json::from_slice(&data)
        .with_context(|| format!("invalid JSON in state file {}", state_path.display()))
}

pub fn save_master_state(state_path: &Path, states: &[TargetState]) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(states).context("serialize master state")?;
    fs::write(state_path, data)
        .with_context(|| format!("write state file {}", state_path.display()))
}

/// Union of two index lists, deduplicated and sorted by `(package, target)`.
pub fn merge_states(existing: &[TargetState], new: &[TargetState]) -> Vec<TargetState> {
    let mut merged: Vec<TargetState> = existing.iter().chain(new.iter()).cloned().collect();
    merged.sort();
    merged.dedup();
    merged
}

/// Merge `new_states` into the master index and regenerate `index.html`.
/// Targets are only ever added; the index never prunes.
pub fn update_master(
    report_dir: &Path,
    project: &str,
    new_states: &[TargetState],
) -> anyhow::Result<()> {
    ensure_dir(report_dir).context("create report directory")?;

    let state_path = report_dir.join("state.json");
    let existing = load_master_state(&state_path)?;
    let merged = merge_states(&existing, new_states);
    save_master_state(&state_path, &merged)?;

    let index_path = report_dir.join("index.html");
    fs::write(&index_path, render_index(project, &merged))
        .with_context(|| format!("write {}", index_path.display()))
}

/// Load a target's history file; a missing file is an empty history.
pub fn load_history(json_path: &Path) -> anyhow::Result<Vec<HistoryEntry>> {
    let data = match fs::read(json_path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("read history file {}", json_path.display()))
        }
    };
    serde_json::from_slice(&data)
        .with_context(|| format!("parse history JSON {}", json_path.display()))
}

/// Prepend a new dated entry to the target's history and re-render its
/// HTML. Idempotent per day: when the newest entry already carries `date`
/// nothing changes and `false` is returned.
pub fn update_target_history(
    report_dir: &Path,
    package: &str,
    target: &str,
    date: &str,
    coverage: u64,
    report_path: &str,
) -> anyhow::Result<bool> {
    let target_dir = report_dir.join("targets").join(package);
    ensure_dir(&target_dir).context("create target report directory")?;

    let json_path = target_dir.join(format!("{}.json", target));
    let mut history = load_history(&json_path)?;
    if history.first().map(|e| e.date.as_str()) == Some(date) {
        return Ok(false);
    }

    history.insert(
        0,
        HistoryEntry {
            date: date.to_string(),
            coverage,
            report: report_path.to_string(),
        },
    );

    let data = serde_json::to_vec_pretty(&history)
        .with_context(|| format!("serialize history for {}/{}", package, target))?;
    fs::write(&json_path, data)
        .with_context(|| format!("write history file {}", json_path.display()))?;

    let html_path = target_dir.join(format!("{}.html", target));
    fs::write(&html_path, render_target(target, &history))
        .with_context(|| format!("write {}", html_path.display()))?;
    Ok(true)
}

fn render_index(project: &str, states: &[TargetState]) -> String {
    let mut rows = String::new();
    for s in states {
        rows.push_str(&format!(
            "    <li><a href=\"targets/{pkg}/{target}.html\">{pkg}/{target}</a></li>\n",
            pkg = escape(&s.package),
            target = escape(&s.target),
        ));
    }
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{project} fuzzing coverage</title></head>\n\
         <body>\n  <h1>Fuzzing coverage for {project}</h1>\n  <ul>\n{rows}  </ul>\n</body>\n</html>\n",
        project = escape(project),
        rows = rows,
    )
}

fn render_target(target: &str, history: &[HistoryEntry]) -> String {
    let mut rows = String::new();
    for e in history {
        rows.push_str(&format!(
            "    <tr><td>{}</td><td>{}</td><td><a href=\"{}\">daily report</a></td></tr>\n",
            escape(&e.date),
            e.coverage,
            escape(&e.report),
        ));
    }
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{target} coverage history</title></head>\n\
         <body>\n  <h1>{target}</h1>\n  <table>\n    \
         <tr><th>Date</th><th>Coverage bits</th><th>Report</th></tr>\n{rows}  </table>\n</body>\n</html>\n",
        target = escape(target),
        rows = rows,
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(pkg: &str, target: &str) -> TargetState {
        TargetState {
            package: pkg.to_string(),
            target: target.to_string(),
        }
    }

    #[test]
    fn merge_sorts_and_dedups() {
        let existing = vec![state("pkg/b", "FuzzB"), state("pkg/a", "FuzzZ")];
        let new = vec![
            state("pkg/a", "FuzzA"),
            state("pkg/b", "FuzzB"),
            state("pkg/a", "FuzzZ"),
        ];
        let merged = merge_states(&existing, &new);
        assert_eq!(
            merged,
            vec![
                state("pkg/a", "FuzzA"),
                state("pkg/a", "FuzzZ"),
                state("pkg/b", "FuzzB"),
            ]
        );
    }

    #[test]
    fn master_state_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        update_master(dir.path(), "demo", &[state("pkg", "FuzzA")]).unwrap();
        update_master(dir.path(), "demo", &[state("pkg", "FuzzA"), state("pkg", "FuzzB")])
            .unwrap();

        let states = load_master_state(&dir.path().join("state.json")).unwrap();
        assert_eq!(states, vec![state("pkg", "FuzzA"), state("pkg", "FuzzB")]);
        let index = std::fs::read_to_string(dir.path().join("index.html")).unwrap();
        assert!(index.contains("targets/pkg/FuzzA.html"));
        assert!(index.contains("targets/pkg/FuzzB.html"));
    }

    #[test]
    fn history_update_is_idempotent_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let updated =
            update_target_history(dir.path(), "pkg", "FuzzA", "2026-08-02", 100, "FuzzA/2026-08-02.html")
                .unwrap();
        assert!(updated);
        let updated =
            update_target_history(dir.path(), "pkg", "FuzzA", "2026-08-02", 120, "FuzzA/2026-08-02.html")
                .unwrap();
        assert!(!updated);

        let history =
            load_history(&dir.path().join("targets").join("pkg").join("FuzzA.json")).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].coverage, 100);
    }

    #[test]
    fn history_prepends_new_days() {
        let dir = tempfile::tempdir().unwrap();
        update_target_history(dir.path(), "pkg", "FuzzA", "2026-08-01", 90, "FuzzA/2026-08-01.html")
            .unwrap();
        update_target_history(dir.path(), "pkg", "FuzzA", "2026-08-02", 95, "FuzzA/2026-08-02.html")
            .unwrap();

        let history =
            load_history(&dir.path().join("targets").join("pkg").join("FuzzA.json")).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].date, "2026-08-02");
        assert_eq!(history[1].date, "2026-08-01");
    }
}
