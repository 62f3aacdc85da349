//! Content hashing for files and tracked directories.
//!
//! Files hash to the md5 of their bytes, streamed in 1 MiB blocks.
//! Directories hash to the md5 of their manifest: a JSON array of
//! `{relpath, md5, size}` entries sorted by relpath, with forward-slash
//! separators regardless of platform. The manifest bytes are exactly what
//! gets stored in the content cache, so the manifest's own md5 doubles as
//! the directory artifact's identity.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::error::HuellaError;
use crate::hash_cache::{file_signature, HashCache};

const BLOCK_SIZE: usize = 1024 * 1024;

/// One entry of a directory manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub relpath: String,
    pub md5: String,
    pub size: u64,
}

/// Result of hashing a path that may be a file or a directory.
#[derive(Debug, Clone)]
pub struct HashedPath {
    pub md5: String,
    pub size: u64,
    pub is_dir: bool,
    /// Present only for directories.
    pub manifest: Option<Vec<ManifestEntry>>,
}

/// Hex md5 of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Md5::digest(bytes))
}

/// Streaming md5 of a file, bypassing the mtime cache.
pub fn hash_file_uncached(path: &Path) -> Result<(String, u64), HuellaError> {
    let mut file = std::fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => HuellaError::NotFound { path: path.into() },
        _ => HuellaError::io(path, e),
    })?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut size: u64 = 0;
    loop {
        let n = file.read(&mut buf).map_err(|e| HuellaError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

/// Serialized manifest bytes: the exact content stored in the cache.
pub fn manifest_bytes(entries: &[ManifestEntry]) -> Vec<u8> {
    serde_json::to_vec(entries).expect("manifest entries serialize")
}

/// Content hasher with an optional persistent mtime cache.
#[derive(Clone, Debug)]
pub struct Hasher {
    cache: Option<Arc<HashCache>>,
}

impl Hasher {
    pub fn new(cache: Option<Arc<HashCache>>) -> Self {
        Self { cache }
    }

    /// Hash a single file, consulting the mtime cache first. A hit never
    /// opens the file; a changed mtime or size forces a fresh read.
    pub fn hash_file(&self, path: &Path) -> Result<(String, u64), HuellaError> {
        let Some(cache) = &self.cache else {
            return hash_file_uncached(path);
        };
        let sig = file_signature(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => HuellaError::NotFound { path: path.into() },
            _ => HuellaError::io(path, e),
        })?;
        let abs = path
            .canonicalize()
            .map_err(|e| HuellaError::io(path, e))?;
        if let Some(md5) = cache.get(&abs, sig.0, sig.1) {
            return Ok((md5, sig.1));
        }
        let (md5, size) = hash_file_uncached(path)?;
        let _ = cache.put(&abs, sig.0, sig.1, &md5);
        Ok((md5, size))
    }

    /// Build the manifest for a directory: every file below it, sorted by
    /// relpath, hashed through the mtime cache.
    pub fn build_dir_manifest(&self, dir: &Path) -> Result<Vec<ManifestEntry>, HuellaError> {
        if !dir.exists() {
            return Err(HuellaError::NotFound { path: dir.into() });
        }
        let mut entries = Vec::new();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| HuellaError::Io {
                path: dir.into(),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .expect("walkdir yields paths under its root");
            let relpath = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let (md5, size) = self.hash_file(entry.path())?;
            entries.push(ManifestEntry { relpath, md5, size });
        }
        entries.sort_by(|a, b| a.relpath.cmp(&b.relpath));
        Ok(entries)
    }

    /// Hash a file or directory. For directories the md5 is the manifest
    /// object's md5 and the size is the sum of entry sizes.
    pub fn hash_path(&self, path: &Path) -> Result<HashedPath, HuellaError> {
        if path.is_dir() {
            let manifest = self.build_dir_manifest(path)?;
            let bytes = manifest_bytes(&manifest);
            let size = manifest.iter().map(|e| e.size).sum();
            Ok(HashedPath {
                md5: hash_bytes(&bytes),
                size,
                is_dir: true,
                manifest: Some(manifest),
            })
        } else {
            let (md5, size) = self.hash_file(path)?;
            Ok(HashedPath {
                md5,
                size,
                is_dir: false,
                manifest: None,
            })
        }
    }
}
