//! Cross-repository blob deduplication.
//!
//! Any two blobs with the same digest share a single inode, backed by the
//! global digest → canonical-path index. Ordering discipline: on commit the
//! filesystem changes first and the index second, on rebuild the index
//! first and the filesystem second, so an orphaned index entry is always
//! detectable by `stat` and self-heals on the next commit.

use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{Error, Result};
use crate::scheduler::{CancelFlag, Scheduler, Task, TaskGenerator};
use crate::store::ImageStore;

fn same_inode(a: &Metadata, b: &Metadata) -> bool {
    a.dev() == b.dev() && a.ino() == b.ino()
}

/// Hard-link refusals that downgrade to a plain rename instead of failing
/// the commit.
fn link_refused(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::CrossesDevices
            | io::ErrorKind::Unsupported
            | io::ErrorKind::PermissionDenied
    )
}

impl ImageStore {
    /// Commit a fully-written scratch file as the blob at `dst`, applying
    /// the dedup policy.
    ///
    /// With dedup off (or no index configured) this is a plain rename. With
    /// dedup on: an unknown digest is renamed into place and recorded as
    /// canonical; a known digest is hard-linked to the canonical inode and
    /// the scratch file dropped. A canonical path that no longer stats is
    /// purged from the index and the commit degrades to the unknown-digest
    /// path. An index write failure aborts the commit — the caller's upload
    /// fails — because disk and index would otherwise disagree.
    pub fn dedupe_blob(&self, src: &Path, digest: &Digest, dst: &Path) -> Result<()> {
        let Some(cache) = self.cache().filter(|_| self.dedupe_enabled()) else {
            return self.commit_rename(src, dst);
        };

        let digest_key = digest.to_string();
        let Some(record) = cache.get_blob(&digest_key)? else {
            self.commit_rename(src, dst)?;
            cache.put_blob(&digest_key, &self.cache_blob_key(dst))?;
            debug!(digest = %digest, dst = %dst.display(), "recorded canonical blob");
            return Ok(());
        };

        let canonical = self.cache_blob_path(&record);
        let canonical_meta = match fs::metadata(&canonical) {
            Ok(meta) => meta,
            Err(err) => {
                // canonical blob swept or lost behind the index's back
                debug!(
                    digest = %digest,
                    canonical = %canonical.display(),
                    error = %err,
                    "canonical blob missing, repairing index entry"
                );
                if let Err(err) = cache.delete_blob(&digest_key, &record) {
                    warn!(digest = %digest, error = %err, "failed to drop stale index entry");
                }
                self.commit_rename(src, dst)?;
                cache.put_blob(&digest_key, &self.cache_blob_key(dst))?;
                return Ok(());
            }
        };

        let needs_link = match fs::metadata(dst) {
            Ok(dst_meta) => !same_inode(&dst_meta, &canonical_meta),
            Err(_) => true,
        };
        if needs_link {
            match fs::remove_file(dst) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            match fs::hard_link(&canonical, dst) {
                Ok(()) => {}
                Err(err) if link_refused(&err) => {
                    warn!(
                        digest = %digest,
                        error = %err,
                        "hard link refused, storing an independent copy"
                    );
                    // index entry stays pointed at the old canonical
                    return self.commit_rename(src, dst);
                }
                Err(err) => return Err(err.into()),
            }
        }

        match fs::remove_file(src) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        cache.put_blob(&digest_key, &self.cache_blob_key(dst))?;
        debug!(digest = %digest, dst = %dst.display(), "blob deduplicated");

        Ok(())
    }

    /// Rename `src` into place as a regular, world-readable blob.
    fn commit_rename(&self, src: &Path, dst: &Path) -> Result<()> {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(src, dst)?;

        let mut perms = fs::metadata(dst)?.permissions();
        perms.set_mode(0o644);
        fs::set_permissions(dst, perms)?;
        self.sync_parent(dst);

        Ok(())
    }

    /// Process one digest of a rebuild: make every on-disk occurrence in
    /// `duplicate_blobs` share the canonical inode (when `dedupe` is true)
    /// or restore independent per-repository copies (when false).
    ///
    /// Fails for this digest if any occurrence cannot be stat'ed; the
    /// caller moves on to other digests. Restartable at any point: all
    /// state is derived from disk and the index.
    pub fn run_dedupe_for_digest(
        &self,
        digest: &Digest,
        dedupe: bool,
        duplicate_blobs: &[PathBuf],
    ) -> Result<()> {
        if duplicate_blobs.is_empty() {
            return Ok(());
        }
        if !dedupe {
            return self.restore_independent_blobs(digest, duplicate_blobs);
        }

        let Some(cache) = self.cache() else {
            return Err(Error::Cache(berth_cache::CacheError::Failed(
                "dedup rebuild requires a configured index".into(),
            )));
        };
        let digest_key = digest.to_string();

        let mut occurrences = Vec::with_capacity(duplicate_blobs.len());
        for path in duplicate_blobs {
            let meta = fs::metadata(path).map_err(|err| {
                error!(
                    digest = %digest,
                    path = %path.display(),
                    error = %err,
                    "blob vanished during rebuild"
                );
                Error::Io(err)
            })?;
            occurrences.push((path.clone(), meta));
        }

        // prefer the canonical path the index already knows, when it is
        // still alive
        let mut canonical: Option<(PathBuf, Metadata)> = None;
        if let Some(record) = cache.get_blob(&digest_key)? {
            let path = self.cache_blob_path(&record);
            match fs::metadata(&path) {
                Ok(meta) => canonical = Some((path, meta)),
                Err(_) => {
                    if let Err(err) = cache.delete_blob(&digest_key, &record) {
                        warn!(digest = %digest, error = %err, "failed to drop stale index entry");
                    }
                }
            }
        }

        for (path, meta) in occurrences {
            match &canonical {
                None => {
                    cache.put_blob(&digest_key, &self.cache_blob_key(&path))?;
                    canonical = Some((path, meta));
                }
                Some((canonical_path, canonical_meta)) => {
                    if &path == canonical_path {
                        continue;
                    }
                    if !same_inode(&meta, canonical_meta) {
                        self.relink(canonical_path, &path)?;
                        debug!(
                            digest = %digest,
                            path = %path.display(),
                            "blob re-linked to canonical inode"
                        );
                    }
                    cache.put_blob(&digest_key, &self.cache_blob_key(&path))?;
                }
            }
        }

        Ok(())
    }

    /// Atomically replace `path` with a hard link to `canonical`: link into
    /// a temp name next to it, then rename over. No window where the blob
    /// is missing.
    fn relink(&self, canonical: &Path, path: &Path) -> Result<()> {
        let tmp = path.with_extension("relink.tmp");
        let _ = fs::remove_file(&tmp);
        fs::hard_link(canonical, &tmp)?;
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        self.sync_parent(path);
        Ok(())
    }

    /// Undo dedup for one digest: every occurrence that shares an inode is
    /// rewritten as its own copy.
    fn restore_independent_blobs(&self, digest: &Digest, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            let meta = fs::metadata(path)?;
            if meta.nlink() > 1 {
                let content = fs::read(path)?;
                self.write_file(path, &content)?;
                debug!(
                    digest = %digest,
                    path = %path.display(),
                    "blob restored to an independent copy"
                );
            }
        }
        Ok(())
    }

    /// Submit a full dedup-index rebuild to `scheduler`: one small,
    /// independently retryable task per digest found on disk. `interval`
    /// spaces the tasks out. Idempotent and restartable — cancelling and
    /// resubmitting converges to the same fixed point.
    pub fn run_dedupe_blobs(self: Arc<Self>, interval: Duration, scheduler: &Scheduler) {
        let dedupe = self.dedupe_enabled();
        scheduler.submit(Box::new(DedupeTaskGenerator {
            store: self,
            dedupe,
            interval,
            pending: None,
        }));
        info!(dedupe, "dedup rebuild submitted");
    }

    /// Every blob path on disk, grouped by digest, repositories and entries
    /// in lexicographic order so the first occurrence is stable across runs.
    fn collect_blob_occurrences(&self) -> Result<BTreeMap<String, Vec<PathBuf>>> {
        let mut occurrences: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();

        for repo in self.get_repositories()? {
            let blobs_dir = self.repo_dir(&repo).join("blobs");
            let Ok(algorithms) = fs::read_dir(&blobs_dir) else {
                continue;
            };
            let mut algorithms: Vec<_> = algorithms.filter_map(|e| e.ok()).collect();
            algorithms.sort_by_key(|e| e.file_name());

            for algorithm_entry in algorithms {
                let Ok(algorithm) = algorithm_entry
                    .file_name()
                    .to_string_lossy()
                    .parse::<DigestAlgorithm>()
                else {
                    continue;
                };
                let Ok(blobs) = fs::read_dir(algorithm_entry.path()) else {
                    continue;
                };
                let mut blobs: Vec<_> = blobs.filter_map(|e| e.ok()).collect();
                blobs.sort_by_key(|e| e.file_name());

                for blob_entry in blobs {
                    if !blob_entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                        continue;
                    }
                    let name = blob_entry.file_name();
                    let Ok(digest) = Digest::from_encoded(algorithm, &name.to_string_lossy())
                    else {
                        // temp files and strays are not blobs
                        continue;
                    };
                    occurrences
                        .entry(digest.to_string())
                        .or_default()
                        .push(blob_entry.path());
                }
            }
        }

        Ok(occurrences)
    }
}

struct DedupeTaskGenerator {
    store: Arc<ImageStore>,
    dedupe: bool,
    interval: Duration,
    pending: Option<Vec<(String, Vec<PathBuf>)>>,
}

impl TaskGenerator for DedupeTaskGenerator {
    fn next(&mut self, cancel: &CancelFlag) -> Option<Box<dyn Task>> {
        if cancel.is_cancelled() {
            return None;
        }

        if self.pending.is_none() {
            match self.store.collect_blob_occurrences() {
                Ok(occurrences) => {
                    let mut pending: Vec<_> = occurrences.into_iter().collect();
                    pending.reverse(); // pop() yields lexicographic order
                    self.pending = Some(pending);
                }
                Err(err) => {
                    error!(error = %err, "blob scan for dedup rebuild failed");
                    return None;
                }
            }
        }

        if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
            if cancel.is_cancelled() {
                return None;
            }
        }

        let (digest, paths) = self.pending.as_mut()?.pop()?;
        Some(Box::new(DedupeTask {
            store: Arc::clone(&self.store),
            digest,
            paths,
            dedupe: self.dedupe,
        }))
    }
}

struct DedupeTask {
    store: Arc<ImageStore>,
    digest: String,
    paths: Vec<PathBuf>,
    dedupe: bool,
}

impl Task for DedupeTask {
    fn run(&mut self) -> Result<()> {
        let digest: Digest = self.digest.parse()?;
        self.store
            .run_dedupe_for_digest(&digest, self.dedupe, &self.paths)
    }

    fn name(&self) -> String {
        format!("dedupe:{}", self.digest)
    }
}
