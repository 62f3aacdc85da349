//! Repository discovery and the record-management operations.
//!
//! A huella repository is any directory with a `.huella/` state dir at
//! its root, holding the content cache and the mtime cache. Commands
//! discover the root by walking up from the working directory.

use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::config::HuellaConfig;
use crate::dag::{find_records_under, rel_path};
use crate::error::HuellaError;
use crate::hash::Hasher;
use crate::hash_cache::HashCache;
use crate::record::{
    find_tracked_ancestor, output_path_for, record_path_for, ArtifactRecord, Computation,
    OutputEntry, RecordMeta,
};
use crate::scm::{GitScm, SourceControl};

pub const STATE_DIR: &str = ".huella";

#[derive(Debug)]
pub struct Repo {
    pub root: PathBuf,
    pub config: HuellaConfig,
    pub cache: CacheStore,
    pub hash_cache: Arc<HashCache>,
    pub hasher: Hasher,
    pub scm: GitScm,
}

#[derive(Debug)]
pub struct AddOutcome {
    pub rel: String,
    pub md5: Option<String>,
    pub placeholder: bool,
}

#[derive(Debug, Default)]
pub struct GcReport {
    pub removed: usize,
    pub freed: u64,
    /// Objects that would be removed (dry mode keeps them).
    pub candidates: Vec<String>,
}

impl Repo {
    /// Create the state directory and open the repository.
    pub fn init(dir: &Path, force: bool) -> Result<Repo> {
        let state = dir.join(STATE_DIR);
        if state.exists() && force {
            std::fs::remove_dir_all(&state)
                .with_context(|| format!("recreating {}", state.display()))?;
        }
        std::fs::create_dir_all(state.join("cache"))
            .with_context(|| format!("creating {}", state.display()))?;
        info!("initialized huella repository at {}", dir.display());
        Self::open(dir.to_path_buf())
    }

    /// Walk up from the working directory to the nearest state dir.
    pub fn discover() -> Result<Repo> {
        let cwd = std::env::current_dir().context("reading working directory")?;
        Self::discover_from(&cwd)
    }

    pub fn discover_from(start: &Path) -> Result<Repo> {
        let mut current = Some(start);
        while let Some(dir) = current {
            if dir.join(STATE_DIR).is_dir() {
                return Self::open(dir.to_path_buf());
            }
            current = dir.parent();
        }
        bail!("not inside a huella repository (run 'huella init' first)")
    }

    pub fn open(root: PathBuf) -> Result<Repo> {
        let state = root.join(STATE_DIR);
        let config = HuellaConfig::load(&state);
        let cache_dir = match &config.cache_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => state.join("cache"),
        };
        let hash_cache = Arc::new(HashCache::open(&state.join(crate::hash_cache::DB_FILE))?);
        Ok(Repo {
            scm: GitScm::new(root.clone()),
            cache: CacheStore::new(cache_dir),
            hasher: Hasher::new(Some(Arc::clone(&hash_cache))),
            hash_cache,
            config,
            root,
        })
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    fn rel(&self, path: &Path) -> Result<String> {
        let abs = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        rel_path(&self.root, &abs)
            .with_context(|| format!("'{}' is outside the repository", path.display()))
    }

    /// Track a file or directory: hash it, store its content in the
    /// cache, and write (or refresh) its record. With `cmd`/`deps` a
    /// computation block is recorded; a missing target plus a command
    /// yields a placeholder for a later run.
    pub fn add(
        &self,
        target: &Path,
        deps: &[String],
        cmd: Option<&str>,
        recursive: bool,
    ) -> Result<AddOutcome> {
        let rel = self.rel(target)?;
        let abs = self.root.join(&rel);
        let record_path = record_path_for(&abs);

        // Stale tracked deps block the add unless --recursive refreshes
        // them first.
        for dep in deps {
            let dep_abs = self.root.join(dep);
            let dep_record = record_path_for(&dep_abs);
            if dep_record.is_file() && dep_abs.exists() {
                let mut visited = std::collections::BTreeSet::new();
                if self.dep_is_stale(dep)? {
                    if recursive {
                        self.refresh_tracked(dep, &mut visited)?;
                    } else {
                        bail!("dep '{dep}' is stale; re-add it or pass --recursive");
                    }
                }
            }
        }

        let existing = ArtifactRecord::load_opt(&record_path)?;

        let mut out = OutputEntry::new(
            abs.file_name()
                .with_context(|| format!("'{rel}' has no file name"))?
                .to_string_lossy(),
        );
        let placeholder = if abs.exists() {
            let hashed = self.hasher.hash_path(&abs)?;
            self.store_content(&abs, &hashed)?;
            out.md5 = Some(hashed.md5);
            out.size = Some(hashed.size);
            out.is_dir = hashed.is_dir;
            false
        } else if cmd.is_some() {
            true
        } else {
            bail!("'{rel}' does not exist (pass --cmd to create a placeholder record)");
        };

        let meta = if cmd.is_some() || !deps.is_empty() {
            let mut dep_map = indexmap::IndexMap::new();
            for dep in deps {
                match self.dep_md5(dep)? {
                    Some(md5) => {
                        dep_map.insert(dep.clone(), md5);
                    }
                    None => bail!("dep '{dep}' does not exist"),
                }
            }
            Some(RecordMeta {
                computation: Some(Computation {
                    cmd: cmd.map(String::from),
                    code_ref: self.scm.current_revision(),
                    deps: dep_map,
                    params: None,
                    extra: serde_yaml::Mapping::new(),
                }),
                extra: serde_yaml::Mapping::new(),
            })
        } else {
            // Plain re-add keeps whatever computation the record had.
            existing.and_then(|r| r.meta)
        };

        let record = ArtifactRecord {
            outs: vec![out],
            meta,
        };
        record.write_atomic(&record_path)?;
        debug!("wrote {}", record_path.display());

        Ok(AddOutcome {
            md5: record.primary_out().md5.clone(),
            placeholder,
            rel,
        })
    }

    fn dep_is_stale(&self, dep: &str) -> Result<bool> {
        let dep_abs = self.root.join(dep);
        let record = match ArtifactRecord::load_opt(&record_path_for(&dep_abs))? {
            Some(record) => record,
            None => return Ok(false),
        };
        let Some(recorded) = &record.primary_out().md5 else {
            return Ok(true);
        };
        let hashed = self.hasher.hash_path(&dep_abs)?;
        Ok(hashed.md5 != *recorded)
    }

    /// Depth-first refresh of a stale tracked artifact and its stale
    /// tracked deps, preserving computation blocks.
    fn refresh_tracked(
        &self,
        rel: &str,
        visited: &mut std::collections::BTreeSet<String>,
    ) -> Result<()> {
        if !visited.insert(rel.to_string()) {
            return Ok(());
        }
        let abs = self.root.join(rel);
        let record_path = record_path_for(&abs);
        let mut record = ArtifactRecord::load(&record_path)?;
        if let Some(comp) = record.computation() {
            let deps: Vec<String> = comp.deps.keys().cloned().collect();
            for dep in deps {
                if record_path_for(&self.root.join(&dep)).is_file() && self.dep_is_stale(&dep)? {
                    self.refresh_tracked(&dep, visited)?;
                }
            }
        }
        let hashed = self.hasher.hash_path(&abs)?;
        self.store_content(&abs, &hashed)?;
        let out = &mut record.outs[0];
        out.md5 = Some(hashed.md5);
        out.size = Some(hashed.size);
        out.is_dir = hashed.is_dir;
        record.write_atomic(&record_path)?;
        info!("refreshed stale dep {rel}");
        Ok(())
    }

    fn store_content(&self, abs: &Path, hashed: &crate::hash::HashedPath) -> Result<()> {
        if let Some(manifest) = &hashed.manifest {
            for entry in manifest {
                self.cache.put_file(&abs.join(&entry.relpath))?;
            }
            self.cache
                .put_bytes(&crate::hash::manifest_bytes(manifest))?;
        } else {
            self.cache.put_file(abs)?;
        }
        Ok(())
    }

    /// Current md5 of a dep path: its record, its containing tracked
    /// directory's manifest, or a direct hash.
    fn dep_md5(&self, dep: &str) -> Result<Option<String>> {
        let abs = self.root.join(dep);
        if let Some(record) = ArtifactRecord::load_opt(&record_path_for(&abs))? {
            return Ok(record.primary_out().md5.clone());
        }
        if let Some((ancestor_record, rest)) = find_tracked_ancestor(&abs, &self.root) {
            let record = ArtifactRecord::load(&ancestor_record)?;
            if let Some(dir_md5) = &record.primary_out().md5 {
                if let Some(entry) = self.cache.resolve_in_dir(dir_md5, &rest)? {
                    return Ok(Some(entry.md5));
                }
            }
            return Ok(None);
        }
        if !abs.exists() {
            return Ok(None);
        }
        Ok(Some(self.hasher.hash_path(&abs)?.md5))
    }

    /// Stop tracking targets. With `outs` the output files go too; cache
    /// objects stay until `gc`.
    pub fn remove(&self, targets: &[String], outs: bool) -> Result<usize> {
        let mut removed = 0;
        for target in targets {
            let rel = self.rel(Path::new(target))?;
            let data = match output_path_for(Path::new(&rel)) {
                Some(out) => out.to_string_lossy().into_owned(),
                None => rel,
            };
            let abs = self.root.join(&data);
            let record_path = record_path_for(&abs);
            if !record_path.is_file() {
                bail!("'{data}' is not tracked");
            }
            std::fs::remove_file(&record_path)
                .map_err(|e| HuellaError::io(&record_path, e))?;
            removed += 1;
            if outs && abs.exists() {
                if abs.is_dir() {
                    std::fs::remove_dir_all(&abs).map_err(|e| HuellaError::io(&abs, e))?;
                } else {
                    std::fs::remove_file(&abs).map_err(|e| HuellaError::io(&abs, e))?;
                }
            }
        }
        Ok(removed)
    }

    /// Delete cache objects referenced by no record. Manifest objects and
    /// the entries inside them count as referenced.
    pub fn gc(&self, dry: bool) -> Result<GcReport> {
        let mut live: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        for record_path in find_records_under(&self.root) {
            let record = match ArtifactRecord::load(&record_path) {
                Ok(record) => record,
                Err(e) => {
                    bail!("cannot gc with unreadable record: {e}");
                }
            };
            for out in &record.outs {
                let Some(md5) = &out.md5 else { continue };
                live.insert(md5.clone());
                if out.is_dir || self.cache.is_dir_object(md5) {
                    if let Ok(manifest) = self.cache.read_dir_manifest(md5) {
                        for entry in manifest {
                            live.insert(entry.md5);
                        }
                    }
                }
            }
        }

        let mut report = GcReport::default();
        let root = self.cache.root().to_path_buf();
        if !root.is_dir() {
            return Ok(report);
        }
        for shard in std::fs::read_dir(&root).map_err(|e| HuellaError::io(&root, e))? {
            let shard = shard.map_err(|e| HuellaError::io(&root, e))?;
            if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let prefix = shard.file_name().to_string_lossy().into_owned();
            for object in
                std::fs::read_dir(shard.path()).map_err(|e| HuellaError::io(shard.path(), e))?
            {
                let object = object.map_err(|e| HuellaError::io(shard.path(), e))?;
                let md5 = format!("{prefix}{}", object.file_name().to_string_lossy());
                if live.contains(&md5) {
                    continue;
                }
                let size = object.metadata().map(|m| m.len()).unwrap_or(0);
                report.freed += size;
                report.candidates.push(md5);
                if !dry {
                    std::fs::remove_file(object.path())
                        .map_err(|e| HuellaError::io(object.path(), e))?;
                    report.removed += 1;
                }
            }
        }
        report.candidates.sort();
        info!(
            "gc: {} object(s), {} byte(s){}",
            report.candidates.len(),
            report.freed,
            if dry { " (dry run)" } else { "" }
        );
        Ok(report)
    }

    /// Resolve a target to a cache md5. Accepts a literal 32-hex hash, a
    /// tracked path (optionally at a revision), or a file inside a
    /// tracked directory.
    pub fn resolve_md5(&self, target: &str, rev: Option<&str>) -> Result<String> {
        if target.len() == 32 && target.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Ok(target.to_string());
        }
        let data = match output_path_for(Path::new(target)) {
            Some(out) => out.to_string_lossy().into_owned(),
            None => target.to_string(),
        };
        let rel = self.rel(Path::new(&data))?;

        let record = match rev {
            Some(rev) => {
                let record_rel = format!("{rel}{}", crate::record::RECORD_SUFFIX);
                self.scm
                    .read_blob(rev, &record_rel)?
                    .map(|bytes| {
                        ArtifactRecord::parse(
                            &String::from_utf8_lossy(&bytes),
                            Path::new(&record_rel),
                        )
                    })
                    .transpose()?
            }
            None => ArtifactRecord::load_opt(&record_path_for(&self.root.join(&rel)))?,
        };
        if let Some(record) = record {
            return record
                .primary_out()
                .md5
                .clone()
                .with_context(|| format!("'{rel}' is a placeholder with no hash yet"));
        }

        // A file inside a tracked directory.
        if rev.is_none() {
            if let Some((ancestor_record, rest)) =
                find_tracked_ancestor(&self.root.join(&rel), &self.root)
            {
                let record = ArtifactRecord::load(&ancestor_record)?;
                if let Some(dir_md5) = &record.primary_out().md5 {
                    if let Some(entry) = self.cache.resolve_in_dir(dir_md5, &rest)? {
                        return Ok(entry.md5);
                    }
                }
            }
        }
        bail!("'{rel}' is not tracked{}", match rev {
            Some(rev) => format!(" at {rev}"),
            None => String::new(),
        })
    }

    /// Stream a cached object to `out`.
    pub fn cat(&self, target: &str, rev: Option<&str>, out: &mut dyn IoWrite) -> Result<()> {
        let md5 = self.resolve_md5(target, rev)?;
        let mut file = self.cache.open(&md5)?;
        std::io::copy(&mut file, out).context("streaming cache object")?;
        Ok(())
    }

    pub fn cache_path_of(&self, target: &str, rev: Option<&str>) -> Result<PathBuf> {
        Ok(self.cache.path_for(&self.resolve_md5(target, rev)?))
    }
}
