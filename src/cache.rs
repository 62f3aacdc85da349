//! Content-addressed cache store.
//!
//! Objects live at `<root>/<md5[..2]>/<md5[2..]>`. Directory manifests
//! share the same layout; their content is the JSON array produced by
//! the hasher, so a directory artifact and its manifest object have the
//! same md5. Insertion is idempotent and atomic (write to a temp file in
//! the root, then rename), which makes concurrent identical writes safe.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::HuellaError;
use crate::hash::{hash_bytes, hash_file_uncached, ManifestEntry};

#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path of the object for a given md5.
    pub fn path_for(&self, md5: &str) -> PathBuf {
        self.root.join(&md5[..2]).join(&md5[2..])
    }

    pub fn has(&self, md5: &str) -> bool {
        self.path_for(md5).is_file()
    }

    /// Open an object for reading.
    pub fn open(&self, md5: &str) -> Result<File, HuellaError> {
        File::open(self.path_for(md5)).map_err(|_| HuellaError::CacheMissing {
            md5: md5.to_string(),
        })
    }

    /// Read an object fully into memory.
    pub fn read(&self, md5: &str) -> Result<Vec<u8>, HuellaError> {
        let mut buf = Vec::new();
        self.open(md5)?
            .read_to_end(&mut buf)
            .map_err(|e| HuellaError::io(self.path_for(md5), e))?;
        Ok(buf)
    }

    /// Insert raw bytes, returning their md5. A no-op when the object
    /// already exists.
    pub fn put_bytes(&self, bytes: &[u8]) -> Result<String, HuellaError> {
        let md5 = hash_bytes(bytes);
        let dest = self.path_for(&md5);
        if dest.is_file() {
            return Ok(md5);
        }
        self.write_atomic(&dest, |f| f.write_all(bytes))?;
        Ok(md5)
    }

    /// Insert a file's content, returning `(md5, size)`. The source is
    /// hashed first so the destination name is known before any write.
    pub fn put_file(&self, src: &Path) -> Result<(String, u64), HuellaError> {
        let (md5, size) = hash_file_uncached(src)?;
        let dest = self.path_for(&md5);
        if dest.is_file() {
            return Ok((md5, size));
        }
        let mut reader = File::open(src).map_err(|e| HuellaError::io(src, e))?;
        self.write_atomic(&dest, |f| std::io::copy(&mut reader, f).map(|_| ()))?;
        debug!("cached {} as {}", src.display(), md5);
        Ok((md5, size))
    }

    /// Decode the JSON manifest object for a tracked directory.
    pub fn read_dir_manifest(&self, md5: &str) -> Result<Vec<ManifestEntry>, HuellaError> {
        let bytes = self.read(md5)?;
        serde_json::from_slice(&bytes).map_err(|e| HuellaError::Parse {
            path: self.path_for(md5),
            reason: format!("invalid directory manifest: {e}"),
        })
    }

    /// Whether an object exists and decodes as a directory manifest.
    pub fn is_dir_object(&self, md5: &str) -> bool {
        match self.read(md5) {
            Ok(bytes) => serde_json::from_slice::<Vec<ManifestEntry>>(&bytes).is_ok(),
            Err(_) => false,
        }
    }

    /// Look up a path inside a tracked directory: given the directory's
    /// manifest md5 and a relpath, return that entry if present.
    pub fn resolve_in_dir(
        &self,
        dir_md5: &str,
        relpath: &str,
    ) -> Result<Option<ManifestEntry>, HuellaError> {
        let manifest = self.read_dir_manifest(dir_md5)?;
        Ok(manifest.into_iter().find(|e| e.relpath == relpath))
    }

    fn write_atomic(
        &self,
        dest: &Path,
        fill: impl FnOnce(&mut File) -> std::io::Result<()>,
    ) -> Result<(), HuellaError> {
        let parent = dest.parent().expect("cache object path has a parent");
        std::fs::create_dir_all(parent).map_err(|e| HuellaError::io(parent, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|e| HuellaError::io(&self.root, e))?;
        fill(tmp.as_file_mut()).map_err(|e| HuellaError::io(dest, e))?;
        tmp.persist(dest)
            .map_err(|e| HuellaError::io(dest, e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::manifest_bytes;

    fn store() -> (tempfile::TempDir, CacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::new(dir.path().join("cache"));
        (dir, store)
    }

    #[test]
    fn two_level_shard_layout() {
        let (_dir, store) = store();
        let path = store.path_for("d41d8cd98f00b204e9800998ecf8427e");
        assert!(path.ends_with("d4/1d8cd98f00b204e9800998ecf8427e"));
    }

    #[test]
    fn put_bytes_roundtrip() {
        let (_dir, store) = store();
        let md5 = store.put_bytes(b"payload").unwrap();
        assert!(store.has(&md5));
        assert_eq!(store.read(&md5).unwrap(), b"payload");
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = store();
        let a = store.put_bytes(b"same").unwrap();
        let b = store.put_bytes(b"same").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn put_file_matches_put_bytes() {
        let (dir, store) = store();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"content").unwrap();
        let (md5, size) = store.put_file(&src).unwrap();
        assert_eq!(size, 7);
        assert_eq!(md5, store.put_bytes(b"content").unwrap());
    }

    #[test]
    fn open_missing_is_cache_missing() {
        let (_dir, store) = store();
        let err = store.open("d41d8cd98f00b204e9800998ecf8427e").unwrap_err();
        assert!(matches!(err, HuellaError::CacheMissing { .. }));
    }

    #[test]
    fn manifest_roundtrip_and_lookup() {
        let (_dir, store) = store();
        let entries = vec![
            ManifestEntry {
                relpath: "a.csv".into(),
                md5: "0cc175b9c0f1b6a831c399e269772661".into(),
                size: 1,
            },
            ManifestEntry {
                relpath: "sub/b.csv".into(),
                md5: "92eb5ffee6ae2fec3ad71c777531578f".into(),
                size: 2,
            },
        ];
        let md5 = store.put_bytes(&manifest_bytes(&entries)).unwrap();
        assert!(store.is_dir_object(&md5));

        let decoded = store.read_dir_manifest(&md5).unwrap();
        assert_eq!(decoded, entries);

        let hit = store.resolve_in_dir(&md5, "sub/b.csv").unwrap();
        assert_eq!(hit.unwrap().size, 2);
        assert!(store.resolve_in_dir(&md5, "absent").unwrap().is_none());
    }

    #[test]
    fn plain_blob_is_not_a_dir_object() {
        let (_dir, store) = store();
        let md5 = store.put_bytes(b"just text").unwrap();
        assert!(!store.is_dir_object(&md5));
    }
}
