//! Engine state and shared filesystem plumbing.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use berth_cache::BlobCache;
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::manifest::Linter;
use crate::{Digest, BLOB_UPLOAD_DIR};

/// Local-filesystem image store.
///
/// One instance manages every repository under `root_dir`. The store is
/// re-entrant: concurrent calls from multiple request handlers are safe.
/// Mutations to a repository's `index.json` take that repo's exclusive
/// lock; reads take the shared side. No lock spans more than one
/// repository, and no global lock exists on the read path.
pub struct ImageStore {
    root_dir: PathBuf,
    gc: bool,
    gc_delay: Duration,
    dedupe: bool,
    commit: bool,
    linter: Option<Arc<dyn Linter>>,
    cache: Option<Arc<dyn BlobCache>>,
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl ImageStore {
    /// Open a store rooted at `root_dir`, creating the directory if needed.
    ///
    /// `gc` enables inline garbage collection after manifest mutations,
    /// `gc_delay` is the reclamation grace, `dedupe` enables cross-repo
    /// hard-link sharing (silently downgraded when the filesystem does not
    /// support hard links), and `commit` controls whether written files are
    /// fsynced before rename.
    pub fn new(
        root_dir: &Path,
        gc: bool,
        gc_delay: Duration,
        dedupe: bool,
        commit: bool,
        linter: Option<Arc<dyn Linter>>,
        cache: Option<Arc<dyn BlobCache>>,
    ) -> Result<Self> {
        fs::create_dir_all(root_dir)?;

        let mut dedupe = dedupe;
        if dedupe {
            if let Err(err) = validate_hard_link(root_dir) {
                warn!(
                    root = %root_dir.display(),
                    error = %err,
                    "filesystem does not support hard links, deduplication disabled"
                );
                dedupe = false;
            }
        }

        Ok(Self {
            root_dir: root_dir.to_path_buf(),
            gc,
            gc_delay,
            dedupe,
            commit,
            linter,
            cache,
            locks: DashMap::new(),
        })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn dedupe_enabled(&self) -> bool {
        self.dedupe
    }

    pub fn gc_delay(&self) -> Duration {
        self.gc_delay
    }

    pub(crate) fn gc_enabled(&self) -> bool {
        self.gc
    }

    pub(crate) fn cache(&self) -> Option<&Arc<dyn BlobCache>> {
        self.cache.as_ref()
    }

    pub(crate) fn linter(&self) -> Option<&Arc<dyn Linter>> {
        self.linter.as_ref()
    }

    /// Lock guarding this repository's `index.json` and layout mutations.
    /// Never hold two repo locks at once.
    pub(crate) fn repo_lock(&self, repo: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(repo.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub(crate) fn repo_dir(&self, repo: &str) -> PathBuf {
        self.root_dir.join(repo)
    }

    /// Absolute path of a blob inside a repository.
    pub fn blob_path(&self, repo: &str, digest: &Digest) -> PathBuf {
        self.repo_dir(repo)
            .join("blobs")
            .join(digest.algorithm().as_str())
            .join(digest.encoded())
    }

    /// Absolute path of an upload session's scratch file.
    pub fn blob_upload_path(&self, repo: &str, session: &str) -> PathBuf {
        self.repo_dir(repo).join(BLOB_UPLOAD_DIR).join(session)
    }

    pub(crate) fn new_session_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Key under which `path` is recorded in the dedup cache.
    pub(crate) fn cache_blob_key(&self, path: &Path) -> String {
        let relative = self
            .cache
            .as_ref()
            .map(|c| c.uses_relative_paths())
            .unwrap_or(true);
        if relative {
            path.strip_prefix(&self.root_dir)
                .unwrap_or(path)
                .to_string_lossy()
                .into_owned()
        } else {
            path.to_string_lossy().into_owned()
        }
    }

    /// Absolute path for a value read back from the dedup cache.
    pub(crate) fn cache_blob_path(&self, stored: &str) -> PathBuf {
        let path = Path::new(stored);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }

    /// Atomically write `data` to `path` via a unique temp file in the same
    /// directory. With durable commit enabled the file is fsynced before the
    /// rename and the parent directory after it.
    pub(crate) fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_name = format!("{}.{}.{}.tmp", file_name, std::process::id(), Uuid::new_v4());
        let tmp_path = path.with_file_name(&tmp_name);

        let mut file = File::create(&tmp_path)?;
        if let Err(err) = file.write_all(data) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        if self.commit {
            if let Err(err) = file.sync_all() {
                let _ = fs::remove_file(&tmp_path);
                return Err(err.into());
            }
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        self.sync_parent(path);

        Ok(())
    }

    /// Fsync the directory containing `path` so the rename itself is
    /// durable. Failure is logged and swallowed.
    pub(crate) fn sync_parent(&self, path: &Path) {
        if !self.commit {
            return;
        }
        if let Some(parent) = path.parent() {
            match File::open(parent) {
                Ok(dir) => {
                    if let Err(err) = dir.sync_all() {
                        warn!(dir = %parent.display(), error = %err, "directory fsync failed");
                    }
                }
                Err(err) => {
                    debug!(dir = %parent.display(), error = %err, "cannot open directory for fsync");
                }
            }
        }
    }

    /// Fsync an open file when durable commit is enabled.
    pub(crate) fn sync_file(&self, file: &File) -> std::io::Result<()> {
        if self.commit {
            file.sync_all()
        } else {
            Ok(())
        }
    }
}

/// Verify that the filesystem under `root_dir` supports hard links,
/// creating `root_dir` if it does not exist yet.
pub fn validate_hard_link(root_dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(root_dir)?;

    let probe = root_dir.join(".hardlink-probe");
    let dup = root_dir.join(".hardlink-probe.dup");
    fs::write(&probe, b"hard link probe")?;

    let result = fs::hard_link(&probe, &dup);
    let _ = fs::remove_file(&dup);
    let _ = fs::remove_file(&probe);

    result
}
