//! # berth-cache
//!
//! Persistent digest → blob-path index shared by every repository in a
//! berth storage root. The index is what makes cross-repository blob
//! deduplication possible: the first on-disk occurrence of a digest becomes
//! the canonical path, later occurrences are recorded as duplicates and
//! hard-linked to the canonical inode by the storage engine.
//!
//! The index is a lookup table, not an ownership relation. Entries are hints
//! that the engine re-validates with `stat` before trusting them, so a stale
//! entry (blob deleted behind the index's back) heals itself on the next
//! commit.
//!
//! Backed by LMDB via `heed`, stored under `<root>/cache.db/`.

pub mod mock;

use std::fs;
use std::path::Path;

use heed::types::{SerdeBincode, Str};
use heed::{Database, Env, EnvOpenOptions};
use thiserror::Error;
use tracing::debug;

/// Errors raised by cache drivers.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache database error: {0}")]
    Db(#[from] heed::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache operation failed: {0}")]
    Failed(String),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Contract between the storage engine and the dedup index.
///
/// Digests are passed in canonical `<alg>:<hex>` form; paths are blob paths,
/// relative to the storage root when [`BlobCache::uses_relative_paths`] is
/// true. Per digest the driver keeps an ordered set of paths whose head is
/// the canonical one.
pub trait BlobCache: Send + Sync {
    /// Driver name, for logs.
    fn name(&self) -> &'static str;

    /// Whether stored paths are relative to the storage root.
    fn uses_relative_paths(&self) -> bool;

    /// Record `path` as holding a blob with `digest`. The first path ever
    /// recorded for a digest becomes canonical; re-inserting a known path is
    /// a no-op.
    fn put_blob(&self, digest: &str, path: &str) -> CacheResult<()>;

    /// Canonical path for `digest`, or `None` when the digest is unknown.
    fn get_blob(&self, digest: &str) -> CacheResult<Option<String>>;

    /// Whether `path` is recorded for `digest`.
    fn has_blob(&self, digest: &str, path: &str) -> bool;

    /// Forget `path` for `digest`. Removing the canonical path promotes the
    /// next recorded duplicate; removing the last path drops the digest
    /// entirely.
    fn delete_blob(&self, digest: &str, path: &str) -> CacheResult<()>;
}

const MAP_SIZE: usize = 1024 * 1024 * 1024;
const MAX_READERS: u32 = 128;

/// LMDB-backed [`BlobCache`].
///
/// One named database maps each digest to the ordered list of blob paths
/// known to hold its content. Writes go through LMDB transactions, which
/// serializes concurrent `put_blob` calls from parallel uploads.
pub struct LmdbCache {
    env: Env,
    db: Database<Str, SerdeBincode<Vec<String>>>,
    relative_paths: bool,
}

impl LmdbCache {
    /// Open (or create) the cache under `<root_dir>/<name>.db/`.
    pub fn open(root_dir: &Path, name: &str, relative_paths: bool) -> CacheResult<Self> {
        let dir = root_dir.join(format!("{name}.db"));
        fs::create_dir_all(&dir)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_readers(MAX_READERS)
                .max_dbs(1)
                .open(&dir)?
        };

        let mut wtxn = env.write_txn()?;
        let db = env.create_database(&mut wtxn, Some("digests"))?;
        wtxn.commit()?;

        debug!(path = %dir.display(), "opened dedup cache");

        Ok(Self {
            env,
            db,
            relative_paths,
        })
    }
}

impl BlobCache for LmdbCache {
    fn name(&self) -> &'static str {
        "lmdb"
    }

    fn uses_relative_paths(&self) -> bool {
        self.relative_paths
    }

    fn put_blob(&self, digest: &str, path: &str) -> CacheResult<()> {
        if path.is_empty() {
            return Err(CacheError::Failed("empty blob path".into()));
        }

        let mut wtxn = self.env.write_txn()?;
        let mut paths = self.db.get(&wtxn, digest)?.unwrap_or_default();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
            self.db.put(&mut wtxn, digest, &paths)?;
        }
        wtxn.commit()?;

        Ok(())
    }

    fn get_blob(&self, digest: &str) -> CacheResult<Option<String>> {
        let rtxn = self.env.read_txn()?;
        let paths = self.db.get(&rtxn, digest)?;
        Ok(paths.and_then(|p| p.first().cloned()))
    }

    fn has_blob(&self, digest: &str, path: &str) -> bool {
        let Ok(rtxn) = self.env.read_txn() else {
            return false;
        };
        match self.db.get(&rtxn, digest) {
            Ok(Some(paths)) => paths.iter().any(|p| p == path),
            _ => false,
        }
    }

    fn delete_blob(&self, digest: &str, path: &str) -> CacheResult<()> {
        let mut wtxn = self.env.write_txn()?;
        let mut paths = self.db.get(&wtxn, digest)?.unwrap_or_default();
        paths.retain(|p| p != path);
        if paths.is_empty() {
            self.db.delete(&mut wtxn, digest)?;
        } else {
            self.db.put(&mut wtxn, digest, &paths)?;
        }
        wtxn.commit()?;

        Ok(())
    }
}
