//! Freshness classification for artifacts.
//!
//! Every artifact lands in exactly one state: fresh, data-stale,
//! dep-stale, missing-output, missing-dep, or error. The decision order
//! is fixed (first match wins): missing or placeholder outputs, then
//! output hash mismatches, then - for records with a computation - the
//! dependency checks. A batched source-control lookup short-circuits the
//! dependency walk: when `code_ref` is recorded and no dep blob differs
//! between that revision and HEAD (with tracked deps vouched for by
//! their own records), the artifact is fresh without hashing anything.
//!
//! The checker never propagates failures; IO and parse problems become
//! the `Error` classification so one broken artifact cannot take down a
//! status sweep.

use tracing::debug;

use crate::cache::CacheStore;
use crate::dag::{Artifact, ArtifactSet};
use crate::error::HuellaError;
use crate::hash::Hasher;
use crate::record::Computation;
use crate::scm::SourceControl;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    DataStale {
        path: String,
        recorded: String,
        actual: String,
    },
    DepStale {
        dep: String,
    },
    MissingOutput {
        path: String,
        reason: String,
    },
    MissingDep {
        dep: String,
    },
    Error {
        reason: String,
    },
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }

    /// Stale states are the ones `run` acts on.
    pub fn is_stale(&self) -> bool {
        matches!(
            self,
            Freshness::DataStale { .. }
                | Freshness::DepStale { .. }
                | Freshness::MissingOutput { .. }
                | Freshness::MissingDep { .. }
        )
    }

    pub fn state(&self) -> &'static str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::DataStale { .. } => "data-stale",
            Freshness::DepStale { .. } => "dep-stale",
            Freshness::MissingOutput { .. } => "missing-output",
            Freshness::MissingDep { .. } => "missing-dep",
            Freshness::Error { .. } => "error",
        }
    }

    /// One-line diagnostic, `None` for fresh artifacts.
    pub fn reason(&self) -> Option<String> {
        match self {
            Freshness::Fresh => None,
            Freshness::DataStale {
                path,
                recorded,
                actual,
            } => Some(format!(
                "{path}: hash mismatch ({}... vs {}...)",
                &recorded[..8.min(recorded.len())],
                &actual[..8.min(actual.len())]
            )),
            Freshness::DepStale { dep } => Some(format!("dep changed: {dep}")),
            Freshness::MissingOutput { path, reason } => Some(format!("{path}: {reason}")),
            Freshness::MissingDep { dep } => Some(format!("dep missing: {dep}")),
            Freshness::Error { reason } => Some(reason.clone()),
        }
    }
}

enum DepCurrent {
    Md5(String),
    Missing,
}

pub struct FreshnessChecker<'a> {
    pub set: &'a ArtifactSet,
    pub hasher: &'a Hasher,
    pub cache: &'a CacheStore,
    pub scm: &'a dyn SourceControl,
}

impl<'a> FreshnessChecker<'a> {
    pub fn new(
        set: &'a ArtifactSet,
        hasher: &'a Hasher,
        cache: &'a CacheStore,
        scm: &'a dyn SourceControl,
    ) -> Self {
        Self {
            set,
            hasher,
            cache,
            scm,
        }
    }

    /// Classify one artifact. Infallible by contract: anything unexpected
    /// becomes `Freshness::Error`.
    pub fn classify(&self, artifact: &Artifact) -> Freshness {
        match self.classify_inner(artifact) {
            Ok(freshness) => freshness,
            Err(e) => Freshness::Error {
                reason: e.to_string(),
            },
        }
    }

    fn classify_inner(&self, artifact: &Artifact) -> Result<Freshness, HuellaError> {
        let root = &self.set.root;

        for (i, out) in artifact.record.outs.iter().enumerate() {
            let rel = &artifact.rel_outs[i];
            let Some(recorded) = &out.md5 else {
                return Ok(Freshness::MissingOutput {
                    path: rel.clone(),
                    reason: "placeholder, never computed".into(),
                });
            };
            let abs = artifact.abs_out(root, i);
            if !abs.exists() {
                return Ok(Freshness::MissingOutput {
                    path: rel.clone(),
                    reason: "output file missing".into(),
                });
            }
            let hashed = self.hasher.hash_path(&abs)?;
            if hashed.md5 != *recorded {
                return Ok(Freshness::DataStale {
                    path: rel.clone(),
                    recorded: recorded.clone(),
                    actual: hashed.md5,
                });
            }
            if !self.cache.has(recorded) {
                return Ok(Freshness::MissingOutput {
                    path: rel.clone(),
                    reason: format!("cache object {recorded} missing; run pull to fetch it"),
                });
            }
        }

        let Some(comp) = artifact.record.computation() else {
            return Ok(Freshness::Fresh);
        };
        if comp.deps.is_empty() {
            return Ok(Freshness::Fresh);
        }

        if let Some(code_ref) = &comp.code_ref {
            if self.fast_path(comp, code_ref) {
                debug!("{}: fresh via blob-id fast path", artifact.name());
                return Ok(Freshness::Fresh);
            }
        }

        for (dep, recorded) in &comp.deps {
            match self.current_dep_md5(dep)? {
                DepCurrent::Md5(current) => {
                    if current != *recorded {
                        return Ok(Freshness::DepStale { dep: dep.clone() });
                    }
                }
                DepCurrent::Missing => {
                    return Ok(Freshness::MissingDep { dep: dep.clone() });
                }
            }
        }

        Ok(Freshness::Fresh)
    }

    /// Batched blob-id comparison. Tracked deps are vouched for by their
    /// records; everything else must have an identical blob id at
    /// `code_ref` and HEAD. Any uncertainty fails the fast path and falls
    /// back to per-dep hashing.
    fn fast_path(&self, comp: &Computation, code_ref: &str) -> bool {
        let mut git_paths: Vec<String> = Vec::new();
        for (dep, recorded) in &comp.deps {
            if let Some(current) = self.tracked_dep_md5(dep) {
                if current.as_deref() != Some(recorded.as_str()) {
                    return false;
                }
            } else {
                git_paths.push(dep.clone());
            }
        }
        if git_paths.is_empty() {
            return true;
        }
        let Some(head) = self.scm.current_revision() else {
            return false;
        };
        if head == code_ref {
            return true;
        }
        let Ok(old_ids) = self.scm.blob_ids_at(code_ref, &git_paths) else {
            return false;
        };
        let Ok(new_ids) = self.scm.blob_ids_at(&head, &git_paths) else {
            return false;
        };
        git_paths.iter().all(|path| {
            matches!(
                (old_ids.get(path), new_ids.get(path)),
                (Some(Some(a)), Some(Some(b))) if a == b
            )
        })
    }

    /// Recorded md5 for a dep that is itself a tracked artifact or lives
    /// inside a tracked directory. `None` when the dep is neither.
    fn tracked_dep_md5(&self, dep: &str) -> Option<Option<String>> {
        if let Some(artifact) = self.set.get(dep) {
            let pos = artifact.rel_outs.iter().position(|o| o == dep)?;
            return Some(artifact.record.outs[pos].md5.clone());
        }
        if let Some((dir_artifact, rest)) = self.set.dir_containing(dep) {
            let pos = dir_artifact
                .rel_outs
                .iter()
                .position(|o| dep.starts_with(o.as_str()))?;
            let dir_md5 = dir_artifact.record.outs[pos].md5.as_ref()?;
            let entry = self.cache.resolve_in_dir(dir_md5, &rest).ok()?;
            return Some(entry.map(|e| e.md5));
        }
        None
    }

    /// Current md5 of a dep as the executor would record it; `None` when
    /// the dep cannot be resolved.
    pub fn dep_md5(&self, dep: &str) -> Result<Option<String>, HuellaError> {
        Ok(match self.current_dep_md5(dep)? {
            DepCurrent::Md5(md5) => Some(md5),
            DepCurrent::Missing => None,
        })
    }

    fn current_dep_md5(&self, dep: &str) -> Result<DepCurrent, HuellaError> {
        // Tracked artifact: trust its record, no rehashing.
        if let Some(artifact) = self.set.get(dep) {
            let pos = artifact
                .rel_outs
                .iter()
                .position(|o| o == dep)
                .expect("artifact indexed under this output");
            return Ok(match &artifact.record.outs[pos].md5 {
                Some(md5) => DepCurrent::Md5(md5.clone()),
                None => DepCurrent::Missing,
            });
        }
        // Entry inside a tracked directory: consult the manifest.
        if let Some((dir_artifact, rest)) = self.set.dir_containing(dep) {
            let pos = dir_artifact
                .rel_outs
                .iter()
                .position(|o| dep.starts_with(o.as_str()))
                .expect("dir artifact indexed under this output");
            let Some(dir_md5) = &dir_artifact.record.outs[pos].md5 else {
                return Ok(DepCurrent::Missing);
            };
            return Ok(match self.cache.resolve_in_dir(dir_md5, &rest)? {
                Some(entry) => DepCurrent::Md5(entry.md5),
                None => DepCurrent::Missing,
            });
        }
        // Plain source file: hash on demand.
        let abs = self.set.root.join(dep);
        if !abs.exists() {
            return Ok(DepCurrent::Missing);
        }
        let hashed = self.hasher.hash_path(&abs)?;
        Ok(DepCurrent::Md5(hashed.md5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{record_path_for, ArtifactRecord, Computation, OutputEntry, RecordMeta};
    use crate::scm::NoScm;
    use indexmap::IndexMap;
    use std::collections::HashMap;
    use std::path::PathBuf;

    static NO_SCM: NoScm = NoScm;

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        cache: CacheStore,
        hasher: Hasher,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().to_path_buf();
            let cache = CacheStore::new(root.join(".huella/cache"));
            Fixture {
                _dir: dir,
                root,
                cache,
                hasher: Hasher::new(None),
            }
        }

        /// Write a file, cache its content, and create its record.
        fn track_file(&self, rel: &str, content: &[u8]) -> String {
            let abs = self.root.join(rel);
            std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
            std::fs::write(&abs, content).unwrap();
            let md5 = self.cache.put_bytes(content).unwrap();
            let mut out = OutputEntry::new(abs.file_name().unwrap().to_string_lossy());
            out.md5 = Some(md5.clone());
            out.size = Some(content.len() as u64);
            ArtifactRecord::for_output(out)
                .write_atomic(&record_path_for(&abs))
                .unwrap();
            md5
        }

        fn with_computation(&self, rel: &str, cmd: &str, deps: &[(&str, &str)]) {
            let abs = self.root.join(rel);
            let record_path = record_path_for(&abs);
            let mut record = ArtifactRecord::load(&record_path).unwrap();
            let mut dep_map = IndexMap::new();
            for (path, md5) in deps {
                dep_map.insert(path.to_string(), md5.to_string());
            }
            record.meta = Some(RecordMeta {
                computation: Some(Computation {
                    cmd: Some(cmd.to_string()),
                    deps: dep_map,
                    ..Default::default()
                }),
                ..Default::default()
            });
            record.write_atomic(&record_path).unwrap();
        }

        fn set(&self, outs: &[&str]) -> ArtifactSet {
            let records: Vec<PathBuf> = outs
                .iter()
                .map(|o| record_path_for(&self.root.join(o)))
                .collect();
            ArtifactSet::load(&self.root, &records).unwrap()
        }

        fn classify(&self, set: &ArtifactSet, out: &str) -> Freshness {
            let checker = FreshnessChecker::new(set, &self.hasher, &self.cache, &NO_SCM);
            checker.classify(set.get(out).unwrap())
        }
    }

    #[test]
    fn untouched_artifact_is_fresh() {
        let fx = Fixture::new();
        fx.track_file("a.txt", b"alpha");
        let set = fx.set(&["a.txt"]);
        assert_eq!(fx.classify(&set, "a.txt"), Freshness::Fresh);
    }

    #[test]
    fn placeholder_is_missing_output() {
        let fx = Fixture::new();
        let abs = fx.root.join("pending.bin");
        ArtifactRecord::for_output(OutputEntry::new("pending.bin"))
            .write_atomic(&record_path_for(&abs))
            .unwrap();
        let set = fx.set(&["pending.bin"]);
        let freshness = fx.classify(&set, "pending.bin");
        assert_eq!(freshness.state(), "missing-output");
        assert!(freshness.reason().unwrap().contains("placeholder"));
    }

    #[test]
    fn deleted_output_is_missing_output() {
        let fx = Fixture::new();
        fx.track_file("a.txt", b"alpha");
        std::fs::remove_file(fx.root.join("a.txt")).unwrap();
        let set = fx.set(&["a.txt"]);
        assert_eq!(fx.classify(&set, "a.txt").state(), "missing-output");
    }

    #[test]
    fn modified_output_is_data_stale() {
        let fx = Fixture::new();
        fx.track_file("a.txt", b"alpha");
        std::fs::write(fx.root.join("a.txt"), b"changed").unwrap();
        let set = fx.set(&["a.txt"]);
        let freshness = fx.classify(&set, "a.txt");
        assert_eq!(freshness.state(), "data-stale");
        assert!(freshness.reason().unwrap().contains("hash mismatch"));
    }

    #[test]
    fn evicted_cache_object_reports_missing() {
        let fx = Fixture::new();
        let md5 = fx.track_file("a.txt", b"alpha");
        std::fs::remove_file(fx.cache.path_for(&md5)).unwrap();
        let set = fx.set(&["a.txt"]);
        let freshness = fx.classify(&set, "a.txt");
        assert_eq!(freshness.state(), "missing-output");
        assert!(freshness.reason().unwrap().contains("run pull"));
    }

    #[test]
    fn tracked_dep_mismatch_is_dep_stale_without_rehash() {
        let fx = Fixture::new();
        let a_md5 = fx.track_file("a.txt", b"alpha");
        fx.track_file("b.txt", b"beta");
        // b's record claims a different hash for a than a's record holds.
        let stale = "00000000000000000000000000000000";
        assert_ne!(a_md5, stale);
        fx.with_computation("b.txt", "make b", &[("a.txt", stale)]);
        let set = fx.set(&["a.txt", "b.txt"]);
        assert_eq!(
            fx.classify(&set, "b.txt"),
            Freshness::DepStale {
                dep: "a.txt".into()
            }
        );
    }

    #[test]
    fn matching_deps_are_fresh() {
        let fx = Fixture::new();
        let a_md5 = fx.track_file("a.txt", b"alpha");
        fx.track_file("b.txt", b"beta");
        fx.with_computation("b.txt", "make b", &[("a.txt", &a_md5)]);
        let set = fx.set(&["a.txt", "b.txt"]);
        assert_eq!(fx.classify(&set, "b.txt"), Freshness::Fresh);
    }

    #[test]
    fn plain_file_dep_change_is_dep_stale() {
        let fx = Fixture::new();
        fx.track_file("out.txt", b"result");
        std::fs::write(fx.root.join("script.py"), b"print(1)").unwrap();
        let (script_md5, _) = crate::hash::hash_file_uncached(&fx.root.join("script.py")).unwrap();
        fx.with_computation("out.txt", "python script.py", &[("script.py", &script_md5)]);

        let set = fx.set(&["out.txt"]);
        assert_eq!(fx.classify(&set, "out.txt"), Freshness::Fresh);

        std::fs::write(fx.root.join("script.py"), b"print(2)").unwrap();
        let set = fx.set(&["out.txt"]);
        assert_eq!(
            fx.classify(&set, "out.txt"),
            Freshness::DepStale {
                dep: "script.py".into()
            }
        );
    }

    #[test]
    fn vanished_dep_is_missing_dep() {
        let fx = Fixture::new();
        fx.track_file("out.txt", b"result");
        fx.with_computation(
            "out.txt",
            "python gone.py",
            &[("gone.py", "00000000000000000000000000000000")],
        );
        let set = fx.set(&["out.txt"]);
        assert_eq!(
            fx.classify(&set, "out.txt"),
            Freshness::MissingDep {
                dep: "gone.py".into()
            }
        );
    }

    #[test]
    fn dep_inside_tracked_dir_resolves_via_manifest() {
        let fx = Fixture::new();
        // Tracked directory with one file, manifest in cache.
        let data = fx.root.join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("rows.csv"), b"1,2\n").unwrap();
        let hashed = fx.hasher.hash_path(&data).unwrap();
        let manifest = hashed.manifest.clone().unwrap();
        fx.cache
            .put_bytes(&crate::hash::manifest_bytes(&manifest))
            .unwrap();
        fx.cache.put_bytes(b"1,2\n").unwrap();
        let mut out = OutputEntry::new("data");
        out.md5 = Some(hashed.md5.clone());
        out.size = Some(hashed.size);
        out.is_dir = true;
        ArtifactRecord::for_output(out)
            .write_atomic(&record_path_for(&data))
            .unwrap();

        let rows_md5 = &manifest[0].md5;
        fx.track_file("model.bin", b"weights");
        fx.with_computation("model.bin", "train", &[("data/rows.csv", rows_md5)]);

        let set = fx.set(&["data", "model.bin"]);
        assert_eq!(fx.classify(&set, "model.bin"), Freshness::Fresh);

        // A dep recorded with a different hash goes dep-stale.
        fx.with_computation(
            "model.bin",
            "train",
            &[("data/rows.csv", "00000000000000000000000000000000")],
        );
        let set = fx.set(&["data", "model.bin"]);
        assert_eq!(fx.classify(&set, "model.bin").state(), "dep-stale");
    }

    // Stub adapter with scripted blob ids, for fast-path tests.
    struct StubScm {
        head: String,
        ids: HashMap<(String, String), String>,
    }

    impl SourceControl for StubScm {
        fn current_revision(&self) -> Option<String> {
            Some(self.head.clone())
        }

        fn blob_ids_at(
            &self,
            rev: &str,
            paths: &[String],
        ) -> Result<HashMap<String, Option<String>>, HuellaError> {
            Ok(paths
                .iter()
                .map(|p| {
                    let id = self.ids.get(&(rev.to_string(), p.clone())).cloned();
                    (p.clone(), id)
                })
                .collect())
        }

        fn read_blob(&self, _rev: &str, _path: &str) -> Result<Option<Vec<u8>>, HuellaError> {
            Ok(None)
        }

        fn resolve_range(&self, _spec: &str) -> Result<crate::scm::RevRange, HuellaError> {
            unreachable!("not used in these tests")
        }
    }

    fn with_code_ref(fx: &Fixture, rel: &str, code_ref: &str) {
        let record_path = record_path_for(&fx.root.join(rel));
        let mut record = ArtifactRecord::load(&record_path).unwrap();
        record.computation_mut().unwrap().code_ref = Some(code_ref.to_string());
        record.write_atomic(&record_path).unwrap();
    }

    #[test]
    fn equal_blob_ids_skip_dep_hashing() {
        let fx = Fixture::new();
        fx.track_file("out.txt", b"result");
        std::fs::write(fx.root.join("script.py"), b"v1").unwrap();
        // Record a dep hash that does NOT match the file on disk; only the
        // fast path can call this fresh.
        fx.with_computation(
            "out.txt",
            "python script.py",
            &[("script.py", "00000000000000000000000000000000")],
        );
        with_code_ref(&fx, "out.txt", "rev-old");

        let mut ids = HashMap::new();
        ids.insert(("rev-old".to_string(), "script.py".to_string()), "blob1".to_string());
        ids.insert(("rev-new".to_string(), "script.py".to_string()), "blob1".to_string());
        let scm = StubScm {
            head: "rev-new".into(),
            ids,
        };

        let set = fx.set(&["out.txt"]);
        let checker = FreshnessChecker::new(&set, &fx.hasher, &fx.cache, &scm);
        assert_eq!(checker.classify(set.get("out.txt").unwrap()), Freshness::Fresh);
    }

    #[test]
    fn differing_blob_ids_fall_back_to_hashing() {
        let fx = Fixture::new();
        fx.track_file("out.txt", b"result");
        std::fs::write(fx.root.join("script.py"), b"v2").unwrap();
        fx.with_computation(
            "out.txt",
            "python script.py",
            &[("script.py", "00000000000000000000000000000000")],
        );
        with_code_ref(&fx, "out.txt", "rev-old");

        let mut ids = HashMap::new();
        ids.insert(("rev-old".to_string(), "script.py".to_string()), "blob1".to_string());
        ids.insert(("rev-new".to_string(), "script.py".to_string()), "blob2".to_string());
        let scm = StubScm {
            head: "rev-new".into(),
            ids,
        };

        let set = fx.set(&["out.txt"]);
        let checker = FreshnessChecker::new(&set, &fx.hasher, &fx.cache, &scm);
        assert_eq!(
            checker.classify(set.get("out.txt").unwrap()),
            Freshness::DepStale {
                dep: "script.py".into()
            }
        );
    }

    #[test]
    fn fresh_excludes_every_stale_state() {
        let fx = Fixture::new();
        fx.track_file("a.txt", b"alpha");
        let set = fx.set(&["a.txt"]);
        let freshness = fx.classify(&set, "a.txt");
        assert!(freshness.is_fresh());
        assert!(!freshness.is_stale());
        assert!(freshness.reason().is_none());
    }
}
