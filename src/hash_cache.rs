//! Persistent mtime/size-keyed hash cache.
//!
//! Hashing large artifacts on every freshness check is the dominant cost
//! of `status` and `run`. This cache memoizes file hashes keyed by
//! `(absolute path, mtime_ns, size)`: a hit returns the stored hash
//! without opening the file, and any change to mtime or size forces a
//! fresh read. The cache is a pure accelerator - dropping it never loses
//! information.
//!
//! Storage is a single SQLite database in the repository state directory,
//! opened in WAL mode so concurrent processes can read while one writes.
//! A schema-version bump clears the table instead of failing.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::UNIX_EPOCH;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::debug;

pub const DB_FILE: &str = "hashes.db";

const SCHEMA_VERSION: i32 = 1;

/// A stored entry whose file no longer hashes to the recorded value.
#[derive(Debug, Clone)]
pub struct VerifyMismatch {
    pub path: PathBuf,
    pub stored: String,
    pub actual: Option<String>,
}

/// SQLite-backed hash cache. Writes are serialized through a mutex;
/// cross-process safety comes from SQLite's WAL journal.
pub struct HashCache {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for HashCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashCache").finish_non_exhaustive()
    }
}

impl HashCache {
    /// Open (or create) the cache database at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("opening hash cache {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(30))?;

        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version != SCHEMA_VERSION {
            if version != 0 {
                debug!(
                    "hash cache schema {} != {}, clearing",
                    version, SCHEMA_VERSION
                );
            }
            conn.execute("DROP TABLE IF EXISTS file_hashes", [])?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_hashes (
                path     TEXT PRIMARY KEY,
                mtime_ns INTEGER NOT NULL,
                size     INTEGER NOT NULL,
                md5      TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the cache in memory (tests).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS file_hashes (
                path     TEXT PRIMARY KEY,
                mtime_ns INTEGER NOT NULL,
                size     INTEGER NOT NULL,
                md5      TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Look up the cached hash for a file signature. Returns `None` when
    /// the path is unknown or mtime/size no longer match.
    pub fn get(&self, abs_path: &Path, mtime_ns: i64, size: u64) -> Option<String> {
        let conn = self.conn.lock().expect("hash cache mutex poisoned");
        conn.query_row(
            "SELECT md5 FROM file_hashes WHERE path = ?1 AND mtime_ns = ?2 AND size = ?3",
            params![abs_path.to_string_lossy(), mtime_ns, size as i64],
            |row| row.get(0),
        )
        .ok()
    }

    /// Idempotent upsert of a file's hash under its current signature.
    pub fn put(&self, abs_path: &Path, mtime_ns: i64, size: u64, md5: &str) -> Result<()> {
        let conn = self.conn.lock().expect("hash cache mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO file_hashes (path, mtime_ns, size, md5)
             VALUES (?1, ?2, ?3, ?4)",
            params![abs_path.to_string_lossy(), mtime_ns, size as i64, md5],
        )?;
        Ok(())
    }

    /// Purge all entries. Returns the number of rows removed.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.conn.lock().expect("hash cache mutex poisoned");
        let n = conn.execute("DELETE FROM file_hashes", [])?;
        Ok(n)
    }

    /// Recompute the hash of every cached file and report mismatches.
    /// Entries for files that vanished are reported with `actual: None`.
    pub fn verify(&self) -> Result<Vec<VerifyMismatch>> {
        let rows: Vec<(String, String)> = {
            let conn = self.conn.lock().expect("hash cache mutex poisoned");
            let mut stmt = conn.prepare("SELECT path, md5 FROM file_hashes")?;
            let iter = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            iter.collect::<rusqlite::Result<_>>()?
        };

        let mut mismatches = Vec::new();
        for (path, stored) in rows {
            let path = PathBuf::from(path);
            match crate::hash::hash_file_uncached(&path) {
                Ok((actual, _)) => {
                    if actual != stored {
                        mismatches.push(VerifyMismatch {
                            path,
                            stored,
                            actual: Some(actual),
                        });
                    }
                }
                Err(_) => mismatches.push(VerifyMismatch {
                    path,
                    stored,
                    actual: None,
                }),
            }
        }
        Ok(mismatches)
    }
}

/// Current `(mtime_ns, size)` signature of a file.
pub fn file_signature(path: &Path) -> std::io::Result<(i64, u64)> {
    let meta = std::fs::metadata(path)?;
    let mtime_ns = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    Ok((mtime_ns, meta.len()))
}
