//! Content diffs across two revisions.
//!
//! Each side of a diff resolves a path to cached content: through the
//! artifact record at a revision (read via the source-control adapter),
//! through the manifest of a tracked ancestor directory, or - when the
//! new side is the working tree - the live file itself. File pairs go
//! through the external `diff` tool (optionally after a preprocessing
//! command with a `{}` placeholder); directory pairs are compared by
//! manifest, entry by entry.

use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use tracing::debug;

use crate::cache::CacheStore;
use crate::dag::rel_path;
use crate::error::HuellaError;
use crate::hash::{Hasher, ManifestEntry};
use crate::record::{output_path_for, ArtifactRecord};
use crate::scm::{RevRange, SourceControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    TrackedPresent,
    TrackedMissingFromCache,
    NotTracked,
    Absent,
}

#[derive(Debug, Clone)]
struct Side {
    status: CacheStatus,
    md5: Option<String>,
    is_dir: bool,
    /// Content to feed the textual diff: a cache object or a live file.
    file: Option<PathBuf>,
    /// Live working-tree directory (manifest computed on the fly).
    live_dir: Option<PathBuf>,
}

impl Side {
    fn absent(status: CacheStatus) -> Self {
        Side {
            status,
            md5: None,
            is_dir: false,
            file: None,
            live_dir: None,
        }
    }

    fn has_content(&self) -> bool {
        self.file.is_some() || self.live_dir.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    /// Lines of unified context (`diff -U n`); default `-u`.
    pub unified: Option<u32>,
    pub ignore_whitespace: bool,
    /// Force color on/off for the textual diff; `None` lets `diff` decide.
    pub color: Option<bool>,
    /// Preprocessing command with a `{}` placeholder for the file path.
    pub preprocess: Option<String>,
}

pub struct DiffEngine<'a> {
    pub root: &'a Path,
    pub cache: &'a CacheStore,
    pub scm: &'a dyn SourceControl,
    pub hasher: &'a Hasher,
}

impl<'a> DiffEngine<'a> {
    /// Diff one path between the two sides of `range`. Returns the diff
    /// status: 0 for identical, 1 for different.
    pub fn diff_path(
        &self,
        target: &Path,
        range: &RevRange,
        opts: &DiffOptions,
        out: &mut dyn IoWrite,
    ) -> Result<i32> {
        let rel = self.normalize_target(target)?;
        let old = self.resolve_side(&rel, Some(&range.old))?;
        let new = self.resolve_side(&rel, range.new.as_deref())?;

        let new_name = range.new.as_deref().unwrap_or("working tree");
        for (side, name) in [(&old, range.old.as_str()), (&new, new_name)] {
            if side.status == CacheStatus::TrackedMissingFromCache {
                let md5 = side.md5.clone().unwrap_or_default();
                return Err(HuellaError::CacheMissing { md5 })
                    .with_context(|| format!("cache missing for '{name}'"));
            }
        }
        if !old.has_content() && !new.has_content() {
            bail!("'{rel}' is not tracked at either revision");
        }

        if old.is_dir || new.is_dir {
            let old_manifest = self.side_manifest(&old)?;
            let new_manifest = self.side_manifest(&new)?;
            let changed = render_dir_diff(&old_manifest, &new_manifest, &rel, out)?;
            return Ok(if changed { 1 } else { 0 });
        }

        // Materialize both sides, preprocessed if requested. The temp
        // files must outlive the diff subprocess.
        let mut keep_alive: Vec<tempfile::NamedTempFile> = Vec::new();
        let old_path = self.materialize(&old, opts, &mut keep_alive)?;
        let new_path = self.materialize(&new, opts, &mut keep_alive)?;
        run_diff_tool(&old_path, &new_path, opts, out)
    }

    /// Summary mode: no content fetching, just record hashes. Emits
    /// `path: old8 -> new8` per changed record and returns 1 when
    /// anything changed.
    pub fn summary(
        &self,
        records: &[PathBuf],
        range: &RevRange,
        out: &mut dyn IoWrite,
    ) -> Result<i32> {
        let mut changed = 0;
        for record_path in records {
            let Some(output) = output_path_for(record_path) else {
                continue;
            };
            let abs = if output.is_absolute() {
                output
            } else {
                self.root.join(output)
            };
            let Some(rel) = rel_path(self.root, &abs) else {
                continue;
            };
            let old_md5 = self.record_md5_at(&rel, Some(&range.old))?;
            let new_md5 = self.record_md5_at(&rel, range.new.as_deref())?;
            if old_md5 == new_md5 {
                continue;
            }
            changed += 1;
            writeln!(
                out,
                "{rel}: {} -> {}",
                short(old_md5.as_deref()),
                short(new_md5.as_deref())
            )?;
        }
        if changed == 0 {
            writeln!(out, "No changes.")?;
        }
        Ok(if changed > 0 { 1 } else { 0 })
    }

    /// Strip a trailing record suffix and make the target root-relative.
    fn normalize_target(&self, target: &Path) -> Result<String> {
        let data = output_path_for(target).unwrap_or_else(|| target.to_path_buf());
        let abs = if data.is_absolute() {
            data
        } else {
            self.root.join(data)
        };
        rel_path(self.root, &abs)
            .with_context(|| format!("'{}' is outside the repository", target.display()))
    }

    fn record_md5_at(&self, rel: &str, rev: Option<&str>) -> Result<Option<String>> {
        Ok(self.load_record_at(rel, rev)?.and_then(|r| r.primary_out().md5.clone()))
    }

    fn load_record_at(&self, rel: &str, rev: Option<&str>) -> Result<Option<ArtifactRecord>> {
        let record_rel = format!("{rel}{}", crate::record::RECORD_SUFFIX);
        match rev {
            Some(rev) => {
                let Some(bytes) = self.scm.read_blob(rev, &record_rel)? else {
                    return Ok(None);
                };
                let text = String::from_utf8_lossy(&bytes);
                Ok(Some(ArtifactRecord::parse(&text, Path::new(&record_rel))?))
            }
            None => Ok(ArtifactRecord::load_opt(&self.root.join(&record_rel))?),
        }
    }

    fn resolve_side(&self, rel: &str, rev: Option<&str>) -> Result<Side> {
        // Working-tree side: the live file wins when it exists.
        if rev.is_none() {
            let abs = self.root.join(rel);
            if abs.is_file() {
                return Ok(Side {
                    status: CacheStatus::TrackedPresent,
                    md5: None,
                    is_dir: false,
                    file: Some(abs),
                    live_dir: None,
                });
            }
            if abs.is_dir() {
                return Ok(Side {
                    status: CacheStatus::TrackedPresent,
                    md5: None,
                    is_dir: true,
                    file: None,
                    live_dir: Some(abs),
                });
            }
        }

        // Direct record at this revision.
        if let Some(record) = self.load_record_at(rel, rev)? {
            let out = record.primary_out();
            let Some(md5) = &out.md5 else {
                return Ok(Side::absent(CacheStatus::Absent));
            };
            let is_dir = out.is_dir || self.cache.is_dir_object(md5);
            if !self.cache.has(md5) {
                return Ok(Side {
                    status: CacheStatus::TrackedMissingFromCache,
                    md5: Some(md5.clone()),
                    is_dir,
                    file: None,
                    live_dir: None,
                });
            }
            return Ok(Side {
                status: CacheStatus::TrackedPresent,
                md5: Some(md5.clone()),
                is_dir,
                file: Some(self.cache.path_for(md5)),
                live_dir: None,
            });
        }

        // Entry inside a tracked ancestor directory.
        if let Some(side) = self.resolve_in_ancestor(rel, rev)? {
            return Ok(side);
        }
        Ok(Side::absent(CacheStatus::NotTracked))
    }

    fn resolve_in_ancestor(&self, rel: &str, rev: Option<&str>) -> Result<Option<Side>> {
        let parts: Vec<&str> = rel.split('/').collect();
        for i in (1..parts.len()).rev() {
            let ancestor = parts[..i].join("/");
            let rest = parts[i..].join("/");
            let Some(record) = self.load_record_at(&ancestor, rev)? else {
                continue;
            };
            let Some(dir_md5) = &record.primary_out().md5 else {
                continue;
            };
            if !self.cache.has(dir_md5) {
                return Ok(Some(Side {
                    status: CacheStatus::TrackedMissingFromCache,
                    md5: Some(dir_md5.clone()),
                    is_dir: false,
                    file: None,
                    live_dir: None,
                }));
            }
            debug!("resolving {rest} inside tracked dir {ancestor}");
            let Some(entry) = self.cache.resolve_in_dir(dir_md5, &rest)? else {
                return Ok(Some(Side::absent(CacheStatus::Absent)));
            };
            if !self.cache.has(&entry.md5) {
                return Ok(Some(Side {
                    status: CacheStatus::TrackedMissingFromCache,
                    md5: Some(entry.md5),
                    is_dir: false,
                    file: None,
                    live_dir: None,
                }));
            }
            return Ok(Some(Side {
                status: CacheStatus::TrackedPresent,
                file: Some(self.cache.path_for(&entry.md5)),
                md5: Some(entry.md5),
                is_dir: false,
                live_dir: None,
            }));
        }
        Ok(None)
    }

    fn side_manifest(&self, side: &Side) -> Result<Vec<ManifestEntry>> {
        if let Some(dir) = &side.live_dir {
            return Ok(self.hasher.build_dir_manifest(dir)?);
        }
        match &side.md5 {
            Some(md5) if side.is_dir => Ok(self.cache.read_dir_manifest(md5)?),
            _ => Ok(Vec::new()),
        }
    }

    /// Produce the file to hand to `diff`: the side's content, piped
    /// through the preprocessing command when one is given. Absent sides
    /// become an empty temp file.
    fn materialize(
        &self,
        side: &Side,
        opts: &DiffOptions,
        keep_alive: &mut Vec<tempfile::NamedTempFile>,
    ) -> Result<PathBuf> {
        let Some(file) = &side.file else {
            let empty = tempfile::NamedTempFile::new().context("creating temp file")?;
            let path = empty.path().to_path_buf();
            keep_alive.push(empty);
            return Ok(path);
        };
        let Some(preprocess) = &opts.preprocess else {
            return Ok(file.clone());
        };

        let cmd = preprocess.replace("{}", &shell_quote(&file.to_string_lossy()));
        debug!("preprocess: {cmd}");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .current_dir(self.root)
            .output()
            .with_context(|| format!("running preprocess '{cmd}'"))?;
        if !output.status.success() {
            bail!(
                "preprocess '{cmd}' failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        let mut tmp = tempfile::NamedTempFile::new().context("creating temp file")?;
        tmp.write_all(&output.stdout)?;
        tmp.flush()?;
        let path = tmp.path().to_path_buf();
        keep_alive.push(tmp);
        Ok(path)
    }
}

/// Compare two directory manifests, emitting added/removed/modified
/// lines in lexicographic relpath order. Returns whether anything
/// differed.
pub fn render_dir_diff(
    old: &[ManifestEntry],
    new: &[ManifestEntry],
    base: &str,
    out: &mut dyn IoWrite,
) -> Result<bool> {
    use std::collections::BTreeMap;
    let old_map: BTreeMap<&str, &ManifestEntry> =
        old.iter().map(|e| (e.relpath.as_str(), e)).collect();
    let new_map: BTreeMap<&str, &ManifestEntry> =
        new.iter().map(|e| (e.relpath.as_str(), e)).collect();

    let mut relpaths: Vec<&str> = old_map.keys().chain(new_map.keys()).copied().collect();
    relpaths.sort_unstable();
    relpaths.dedup();

    let mut changed = false;
    for rel in relpaths {
        let full = format!("{base}/{rel}");
        match (old_map.get(rel), new_map.get(rel)) {
            (None, Some(entry)) => {
                changed = true;
                writeln!(
                    out,
                    "{}",
                    format!("+ {full}  {}  {}", short(Some(&entry.md5)), entry.size).green()
                )?;
            }
            (Some(entry), None) => {
                changed = true;
                writeln!(
                    out,
                    "{}",
                    format!("- {full}  {}  {}", short(Some(&entry.md5)), entry.size).red()
                )?;
            }
            (Some(before), Some(after)) if before.md5 != after.md5 => {
                changed = true;
                writeln!(
                    out,
                    "{}",
                    format!("- {full}  {}  {}", short(Some(&before.md5)), before.size).red()
                )?;
                writeln!(
                    out,
                    "{}",
                    format!("+ {full}  {}  {}", short(Some(&after.md5)), after.size).green()
                )?;
            }
            _ => {}
        }
    }
    Ok(changed)
}

/// Run the external `diff` tool on two files, streaming its output.
fn run_diff_tool(
    old: &Path,
    new: &Path,
    opts: &DiffOptions,
    out: &mut dyn IoWrite,
) -> Result<i32> {
    let mut cmd = Command::new("diff");
    match opts.unified {
        Some(n) => {
            cmd.arg("-U").arg(n.to_string());
        }
        None => {
            cmd.arg("-u");
        }
    }
    if opts.ignore_whitespace {
        cmd.arg("-w");
    }
    match opts.color {
        Some(true) => {
            cmd.arg("--color=always");
        }
        Some(false) => {
            cmd.arg("--color=never");
        }
        None => {}
    }
    cmd.arg(old).arg(new);
    let output = cmd.output().context("running diff")?;
    out.write_all(&output.stdout)?;
    match output.status.code() {
        Some(code @ (0 | 1)) => Ok(code),
        other => bail!(
            "diff failed (status {:?}): {}",
            other,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    }
}

fn short(md5: Option<&str>) -> String {
    match md5 {
        Some(md5) => md5[..8.min(md5.len())].to_string(),
        None => "--------".to_string(),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
