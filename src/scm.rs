//! Read-only source-control adapter.
//!
//! The core never writes to the surrounding repository; it only needs
//! three queries: the current revision, blob ids for a batch of paths at
//! a revision (one `ls-tree` invocation per batch), and raw blob content.
//! The trait keeps the binding pluggable; `GitScm` shells out to the
//! ambient `git`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::HuellaError;

/// Revision pair produced by `resolve_range`. `new: None` means the
/// working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevRange {
    pub old: String,
    pub new: Option<String>,
}

pub trait SourceControl: Send + Sync {
    /// Current revision id, or `None` outside a repository (or before the
    /// first commit).
    fn current_revision(&self) -> Option<String>;

    /// Blob ids for `paths` at `rev`, resolved in a single batched call.
    /// A path with no blob at that revision maps to `None`.
    fn blob_ids_at(
        &self,
        rev: &str,
        paths: &[String],
    ) -> Result<HashMap<String, Option<String>>, HuellaError>;

    /// Content of `path` at `rev`; `None` when absent at that revision.
    fn read_blob(&self, rev: &str, path: &str) -> Result<Option<Vec<u8>>, HuellaError>;

    /// Resolve `X`, `X..Y`, or (via the `^` shorthand upstream) `X^..X`
    /// into a concrete range.
    fn resolve_range(&self, spec: &str) -> Result<RevRange, HuellaError>;
}

/// Git binding that shells out to the ambient `git` binary.
#[derive(Debug)]
pub struct GitScm {
    root: PathBuf,
}

impl GitScm {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn git(&self, args: &[&str]) -> Result<std::process::Output, HuellaError> {
        debug!("git {:?}", args);
        Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .map_err(|e| HuellaError::Scm(format!("failed to run git: {e}")))
    }
}

impl SourceControl for GitScm {
    fn current_revision(&self) -> Option<String> {
        let output = self.git(&["rev-parse", "HEAD"]).ok()?;
        if !output.status.success() {
            return None;
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if sha.is_empty() {
            None
        } else {
            Some(sha)
        }
    }

    fn blob_ids_at(
        &self,
        rev: &str,
        paths: &[String],
    ) -> Result<HashMap<String, Option<String>>, HuellaError> {
        let mut map: HashMap<String, Option<String>> =
            paths.iter().map(|p| (p.clone(), None)).collect();
        if paths.is_empty() {
            return Ok(map);
        }

        let mut args: Vec<&str> = vec!["ls-tree", "-r", "-z", rev, "--"];
        args.extend(paths.iter().map(String::as_str));
        let output = self.git(&args)?;
        if !output.status.success() {
            return Err(HuellaError::Scm(format!(
                "ls-tree failed at {rev}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // Entries look like: "<mode> <type> <oid>\t<path>\0"
        let stdout = String::from_utf8_lossy(&output.stdout);
        for entry in stdout.split('\0') {
            let Some((head, path)) = entry.split_once('\t') else {
                continue;
            };
            let mut fields = head.split_whitespace();
            let (_mode, kind, oid) = match (fields.next(), fields.next(), fields.next()) {
                (Some(m), Some(k), Some(o)) => (m, k, o),
                _ => continue,
            };
            if kind != "blob" {
                continue;
            }
            if let Some(slot) = map.get_mut(path) {
                *slot = Some(oid.to_string());
            }
        }
        Ok(map)
    }

    fn read_blob(&self, rev: &str, path: &str) -> Result<Option<Vec<u8>>, HuellaError> {
        let spec = format!("{rev}:{path}");
        let output = self.git(&["show", &spec])?;
        if output.status.success() {
            Ok(Some(output.stdout))
        } else {
            // Missing blob at this revision is `absent`, not an error.
            Ok(None)
        }
    }

    fn resolve_range(&self, spec: &str) -> Result<RevRange, HuellaError> {
        if let Some((old, new)) = spec.split_once("..") {
            if old.is_empty() || new.is_empty() {
                return Err(HuellaError::Scm(format!(
                    "revision range '{spec}' needs both sides"
                )));
            }
            Ok(RevRange {
                old: old.to_string(),
                new: Some(new.to_string()),
            })
        } else if spec.is_empty() {
            Err(HuellaError::Scm("empty revision spec".into()))
        } else {
            Ok(RevRange {
                old: spec.to_string(),
                new: None,
            })
        }
    }
}

/// Expand the `-R <rev>` shorthand into `<rev>^..<rev>`.
pub fn parent_range(rev: &str) -> String {
    format!("{rev}^..{rev}")
}

/// An adapter for use outside any repository: no revision, no blobs.
pub struct NoScm;

impl SourceControl for NoScm {
    fn current_revision(&self) -> Option<String> {
        None
    }

    fn blob_ids_at(
        &self,
        _rev: &str,
        paths: &[String],
    ) -> Result<HashMap<String, Option<String>>, HuellaError> {
        Ok(paths.iter().map(|p| (p.clone(), None)).collect())
    }

    fn read_blob(&self, _rev: &str, _path: &str) -> Result<Option<Vec<u8>>, HuellaError> {
        Ok(None)
    }

    fn resolve_range(&self, _spec: &str) -> Result<RevRange, HuellaError> {
        Err(HuellaError::Scm("not inside a source-control repository".into()))
    }
}

/// Helper for callers that hold a `GitScm` root path.
pub fn repo_relative(root: &Path, path: &Path) -> Option<String> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };
    let rel = abs.strip_prefix(root).ok()?;
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn git_available() -> bool {
        Command::new("git").arg("--version").output().is_ok()
    }

    fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(dir)
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        }
    }

    fn commit_all(dir: &Path, message: &str) {
        for args in [vec!["add", "-A"], vec!["commit", "-q", "-m", message]] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(dir)
                .status()
                .unwrap();
            assert!(status.success());
        }
    }

    #[test]
    fn resolve_range_forms() {
        let scm = GitScm::new(".");
        let pair = scm.resolve_range("abc..def").unwrap();
        assert_eq!(pair.old, "abc");
        assert_eq!(pair.new.as_deref(), Some("def"));

        let single = scm.resolve_range("HEAD").unwrap();
        assert_eq!(single.old, "HEAD");
        assert!(single.new.is_none());

        assert!(scm.resolve_range("..x").is_err());
        assert!(scm.resolve_range("").is_err());
    }

    #[test]
    fn parent_range_shorthand() {
        assert_eq!(parent_range("abc123"), "abc123^..abc123");
    }

    #[test]
    fn no_scm_answers_absent() {
        let scm = NoScm;
        assert!(scm.current_revision().is_none());
        let ids = scm.blob_ids_at("HEAD", &["a".into()]).unwrap();
        assert_eq!(ids.get("a"), Some(&None));
    }

    #[test]
    fn git_batched_lookup_and_blob_read() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("tracked.txt"), b"v1\n").unwrap();
        commit_all(dir.path(), "first");

        let scm = GitScm::new(dir.path());
        let head = scm.current_revision().expect("revision after commit");

        let ids = scm
            .blob_ids_at(&head, &["tracked.txt".into(), "missing.txt".into()])
            .unwrap();
        assert!(ids.get("tracked.txt").unwrap().is_some());
        assert!(ids.get("missing.txt").unwrap().is_none());

        let blob = scm.read_blob(&head, "tracked.txt").unwrap();
        assert_eq!(blob.as_deref(), Some(&b"v1\n"[..]));
        assert!(scm.read_blob(&head, "missing.txt").unwrap().is_none());
    }

    #[test]
    fn blob_ids_change_with_content() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        std::fs::write(dir.path().join("data.csv"), b"a\n").unwrap();
        commit_all(dir.path(), "first");
        let scm = GitScm::new(dir.path());
        let rev1 = scm.current_revision().unwrap();

        std::fs::write(dir.path().join("data.csv"), b"b\n").unwrap();
        commit_all(dir.path(), "second");
        let rev2 = scm.current_revision().unwrap();

        let paths = vec!["data.csv".to_string()];
        let old = scm.blob_ids_at(&rev1, &paths).unwrap();
        let new = scm.blob_ids_at(&rev2, &paths).unwrap();
        assert_ne!(old.get("data.csv"), new.get("data.csv"));
    }
}
