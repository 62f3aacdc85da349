//! Artifact record codec.
//!
//! An artifact record is a small YAML sidecar (`<output>.hua`) describing
//! one tracked output: its content hash and size, and optionally the
//! computation that produced it (command, source-control revision, and
//! the hashes of its inputs). Records with no `md5`/`size` are
//! placeholders awaiting their first run.
//!
//! Emission is deterministic: `outs` first, then `meta`; within an output
//! entry `md5`, `size`, `hash`, `is_dir`, `path` in that order, omitting
//! `md5`/`size` for placeholders and `is_dir` for plain files. Unknown
//! keys round-trip untouched so newer tools can extend records without
//! breaking older ones. No timestamps or machine-specific data are ever
//! written.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::HuellaError;

/// Sidecar suffix for artifact records.
pub const RECORD_SUFFIX: &str = ".hua";

/// The only supported hash algorithm label.
pub const HASH_ALGO: &str = "md5";

/// One tracked output of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    #[serde(default = "default_hash_algo")]
    pub hash: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_dir: bool,

    pub path: String,

    /// Unknown output attributes, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

impl OutputEntry {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            md5: None,
            size: None,
            hash: HASH_ALGO.to_string(),
            is_dir: false,
            path: path.into(),
            extra: serde_yaml::Mapping::new(),
        }
    }
}

fn default_hash_algo() -> String {
    HASH_ALGO.to_string()
}

/// How an artifact was (or will be) produced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Computation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,

    /// Source-control revision captured at the last successful run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_ref: Option<String>,

    /// Input path -> md5 recorded when the command last ran. Emitted as a
    /// sequence of `{path, md5}` entries in insertion order.
    #[serde(
        default,
        with = "dep_seq",
        skip_serializing_if = "IndexMap::is_empty"
    )]
    pub deps: IndexMap<String, String>,

    /// Free-form parameters, opaque to the core.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_yaml::Mapping>,

    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

/// The `meta` block. Only `computation` is interpreted; everything else
/// passes through.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computation: Option<Computation>,

    #[serde(flatten)]
    pub extra: serde_yaml::Mapping,
}

/// A parsed artifact record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub outs: Vec<OutputEntry>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<RecordMeta>,
}

mod dep_seq {
    use indexmap::IndexMap;
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize)]
    struct DepRef<'a> {
        path: &'a str,
        md5: &'a str,
    }

    #[derive(Deserialize)]
    struct DepOwned {
        path: String,
        md5: String,
    }

    pub fn serialize<S: Serializer>(
        deps: &IndexMap<String, String>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(deps.len()))?;
        for (path, md5) in deps {
            seq.serialize_element(&DepRef { path, md5 })?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<IndexMap<String, String>, D::Error> {
        let entries = Vec::<DepOwned>::deserialize(deserializer)?;
        let mut map = IndexMap::with_capacity(entries.len());
        for entry in entries {
            if map.insert(entry.path.clone(), entry.md5).is_some() {
                return Err(serde::de::Error::custom(format!(
                    "duplicate dep path '{}'",
                    entry.path
                )));
            }
        }
        Ok(map)
    }
}

impl ArtifactRecord {
    /// A record with a single output entry and no computation.
    pub fn for_output(out: OutputEntry) -> Self {
        Self {
            outs: vec![out],
            meta: None,
        }
    }

    /// Parse and validate record text. `origin` is only used in errors.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, HuellaError> {
        let record: ArtifactRecord =
            serde_yaml::from_str(text).map_err(|e| HuellaError::Parse {
                path: origin.to_path_buf(),
                reason: e.to_string(),
            })?;
        record.validate(origin)?;
        Ok(record)
    }

    /// Read and parse a record file.
    pub fn load(path: &Path) -> Result<Self, HuellaError> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HuellaError::NotFound { path: path.into() },
            _ => HuellaError::io(path, e),
        })?;
        Self::parse(&text, path)
    }

    /// Read and parse a record file, mapping "no such file" to `None`.
    pub fn load_opt(path: &Path) -> Result<Option<Self>, HuellaError> {
        match Self::load(path) {
            Ok(record) => Ok(Some(record)),
            Err(HuellaError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn validate(&self, origin: &Path) -> Result<(), HuellaError> {
        if self.outs.is_empty() {
            return Err(HuellaError::Parse {
                path: origin.to_path_buf(),
                reason: "record has no outputs".into(),
            });
        }
        for out in &self.outs {
            if out.hash != HASH_ALGO {
                return Err(HuellaError::Parse {
                    path: origin.to_path_buf(),
                    reason: format!("unknown hash algorithm '{}'", out.hash),
                });
            }
            if let Some(md5) = &out.md5 {
                if !is_md5_hex(md5) {
                    return Err(HuellaError::Parse {
                        path: origin.to_path_buf(),
                        reason: format!("'{md5}' is not a 32-hex md5"),
                    });
                }
            }
            if out.path.is_empty() {
                return Err(HuellaError::Parse {
                    path: origin.to_path_buf(),
                    reason: "output entry has an empty path".into(),
                });
            }
        }
        Ok(())
    }

    /// Serialize with stable key order and a single trailing newline.
    pub fn emit(&self) -> String {
        serde_yaml::to_string(self).expect("record serializes")
    }

    /// Write the record atomically: temp file in the same directory, then
    /// rename over the destination. Readers never observe torn content.
    pub fn write_atomic(&self, record_path: &Path) -> Result<(), HuellaError> {
        let parent = record_path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| HuellaError::io(parent, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| HuellaError::io(parent, e))?;
        use std::io::Write;
        tmp.write_all(self.emit().as_bytes())
            .map_err(|e| HuellaError::io(record_path, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| HuellaError::io(record_path, e))?;
        tmp.persist(record_path)
            .map_err(|e| HuellaError::io(record_path, e.error))?;
        Ok(())
    }

    /// First output entry (the common single-output case).
    pub fn primary_out(&self) -> &OutputEntry {
        &self.outs[0]
    }

    /// A record is a placeholder while any output lacks its hash.
    pub fn is_placeholder(&self) -> bool {
        self.outs.iter().any(|o| o.md5.is_none())
    }

    pub fn computation(&self) -> Option<&Computation> {
        self.meta.as_ref().and_then(|m| m.computation.as_ref())
    }

    pub fn computation_mut(&mut self) -> Option<&mut Computation> {
        self.meta.as_mut().and_then(|m| m.computation.as_mut())
    }

    pub fn cmd(&self) -> Option<&str> {
        self.computation().and_then(|c| c.cmd.as_deref())
    }
}

fn is_md5_hex(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Sidecar record path for an output (`data.csv` -> `data.csv.hua`).
pub fn record_path_for(output: &Path) -> PathBuf {
    let mut os = output.as_os_str().to_os_string();
    os.push(RECORD_SUFFIX);
    PathBuf::from(os)
}

/// Output path for a record file, if it carries the record suffix.
pub fn output_path_for(record: &Path) -> Option<PathBuf> {
    let s = record.to_string_lossy();
    s.strip_suffix(RECORD_SUFFIX).map(PathBuf::from)
}

/// Walk up from `path` (exclusive) to `root` (inclusive) looking for a
/// tracked directory that contains it. Returns the ancestor's record path
/// and the forward-slash relpath of `path` inside that directory.
pub fn find_tracked_ancestor(path: &Path, root: &Path) -> Option<(PathBuf, String)> {
    let mut current = path.parent()?;
    loop {
        if current.starts_with(root) && current != root {
            let record = record_path_for(current);
            if record.is_file() {
                let rel = path
                    .strip_prefix(current)
                    .ok()?
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                return Some((record, rel));
            }
        } else {
            return None;
        }
        current = current.parent()?;
    }
}
