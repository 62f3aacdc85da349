//! Status reporting: expand targets, classify artifacts, render.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use colored::Colorize;
use globset::Glob;
use serde_json::json;

use crate::cache::CacheStore;
use crate::dag::{expand_target, find_records_under, rel_path, ArtifactSet};
use crate::freshness::{Freshness, FreshnessChecker};
use crate::hash::Hasher;
use crate::record::output_path_for;
use crate::scm::SourceControl;

pub struct StatusEntry {
    pub path: String,
    pub freshness: Freshness,
}

pub struct StatusReport {
    pub entries: Vec<StatusEntry>,
}

impl StatusReport {
    pub fn fresh_count(&self) -> usize {
        self.entries.iter().filter(|e| e.freshness.is_fresh()).count()
    }

    pub fn stale_count(&self) -> usize {
        self.entries.iter().filter(|e| e.freshness.is_stale()).count()
    }

    pub fn error_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.freshness, Freshness::Error { .. }))
            .count()
    }

    pub fn has_stale(&self) -> bool {
        self.stale_count() > 0
    }

    /// Structured output: path -> {state, reason, current_md5?, recorded_md5?}.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for entry in &self.entries {
            let mut value = serde_json::Map::new();
            value.insert("state".into(), json!(entry.freshness.state()));
            value.insert("reason".into(), json!(entry.freshness.reason()));
            if let Freshness::DataStale {
                recorded, actual, ..
            } = &entry.freshness
            {
                value.insert("recorded_md5".into(), json!(recorded));
                value.insert("current_md5".into(), json!(actual));
            }
            map.insert(entry.path.clone(), serde_json::Value::Object(value));
        }
        serde_json::Value::Object(map)
    }

    /// Human-readable report. Fresh entries are hidden unless `show_all`
    /// (git-status style); a summary line always trails.
    pub fn render_human(&self, show_all: bool) -> String {
        let mut lines = Vec::new();
        for entry in &self.entries {
            let icon = match &entry.freshness {
                Freshness::Fresh => {
                    if !show_all {
                        continue;
                    }
                    "ok".green()
                }
                Freshness::MissingOutput { .. } | Freshness::MissingDep { .. } => "??".yellow(),
                Freshness::Error { .. } => "!!".red(),
                _ => "stale".red(),
            };
            let mut line = format!("{icon} {}", entry.path);
            if let Some(reason) = entry.freshness.reason() {
                line.push_str(&format!(" ({reason})"));
            }
            lines.push(line);
        }
        let mut summary = format!(
            "Fresh: {}, Stale: {}",
            self.fresh_count(),
            self.stale_count()
        );
        if self.error_count() > 0 {
            summary.push_str(&format!(", Errors: {}", self.error_count()));
        }
        if !lines.is_empty() {
            lines.push(String::new());
        }
        lines.push(summary);
        lines.join("\n")
    }
}

/// Expand status/run targets into record files. A target may be a record
/// file, an output path, a directory, or a glob over output paths. With
/// no targets, every record under the root participates. Order follows
/// the input, each expansion sorted; duplicates collapse.
pub fn expand_targets(root: &Path, targets: &[String]) -> Result<Vec<PathBuf>> {
    let mut records: Vec<PathBuf> = Vec::new();
    if targets.is_empty() {
        records = find_records_under(root);
    } else {
        for target in targets {
            if target.contains(['*', '?', '[']) {
                let matcher = Glob::new(target)
                    .with_context(|| format!("invalid glob '{target}'"))?
                    .compile_matcher();
                let matched = find_records_under(root).into_iter().filter(|record| {
                    output_path_for(record)
                        .and_then(|out| rel_path(root, &out))
                        .is_some_and(|rel| matcher.is_match(&rel))
                });
                records.extend(matched);
            } else {
                records.extend(expand_target(root, Path::new(target)));
            }
        }
    }
    let mut seen = std::collections::BTreeSet::new();
    records.retain(|r| seen.insert(r.clone()));
    Ok(records)
}

/// Classify every artifact in the set on a bounded pool, preserving the
/// set's load order.
pub fn collect(
    set: &ArtifactSet,
    hasher: &Hasher,
    cache: &CacheStore,
    scm: &dyn SourceControl,
    workers: usize,
) -> Result<StatusReport> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
        .context("building worker pool")?;
    let checker = FreshnessChecker::new(set, hasher, cache, scm);
    let classified: Vec<Freshness> = pool.install(|| {
        use rayon::prelude::*;
        set.artifacts
            .par_iter()
            .map(|artifact| checker.classify(artifact))
            .collect()
    });
    let entries = set
        .artifacts
        .iter()
        .zip(classified)
        .map(|(artifact, freshness)| StatusEntry {
            path: artifact.name().to_string(),
            freshness,
        })
        .collect();
    Ok(StatusReport { entries })
}
