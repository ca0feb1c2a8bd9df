//! Per-repository mark-and-sweep garbage collection.
//!
//! Mark walks every descriptor in `index.json` down to its blobs; sweep
//! unlinks whatever is unmarked and older than the grace delay, stale
//! upload sessions included. GC holds only the repo's own lock — blobs
//! hard-linked into other repositories survive an unlink here by
//! construction, so no cross-repo coordination is needed.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use oci_spec::image::{ImageIndex, ImageManifest};
use tracing::{debug, error, warn};

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::manifest::ArtifactManifest;
use crate::store::ImageStore;
use crate::{
    BLOB_UPLOAD_DIR, MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST, MEDIA_TYPE_ORAS_ARTIFACT,
};

impl ImageStore {
    /// Garbage-collect one repository.
    ///
    /// Fails without sweeping when the repository is inconsistent (an
    /// unreadable `index.json`, or a descriptor whose manifest blob is
    /// missing or unparseable). A failed run leaves the repo untouched;
    /// the next attempt simply retries.
    pub fn run_gc_repo(&self, repo: &str) -> Result<()> {
        let result = {
            let lock = self.repo_lock(repo);
            let _guard = lock.write().unwrap_or_else(|e| e.into_inner());
            self.garbage_collect(repo)
        };

        if let Err(err) = &result {
            error!(
                repo = %self.repo_dir(repo).display(),
                error = %err,
                "error while running GC for repository"
            );
        }
        result
    }

    fn garbage_collect(&self, repo: &str) -> Result<()> {
        let index = self.load_index(repo).map_err(|err| Error::Gc {
            reason: format!("cannot load index.json: {err}"),
        })?;

        let mut referenced: HashSet<String> = HashSet::new();
        for desc in index.manifests() {
            self.mark_reachable(
                repo,
                desc.digest(),
                &desc.media_type().to_string(),
                &mut referenced,
            )?;
        }

        self.sweep_uploads(repo);
        self.sweep_blobs(repo, &referenced);

        debug!(repo, marked = referenced.len(), "garbage collection finished");
        Ok(())
    }

    /// Add `digest_str` and everything reachable from it to the marked set.
    fn mark_reachable(
        &self,
        repo: &str,
        digest_str: &str,
        media_type: &str,
        referenced: &mut HashSet<String>,
    ) -> Result<()> {
        if !referenced.insert(digest_str.to_string()) {
            // duplicate descriptors sharing a digest are fine; mark once
            return Ok(());
        }

        let digest: Digest = digest_str.parse().map_err(|_| Error::Gc {
            reason: format!("malformed digest in index.json: {digest_str}"),
        })?;

        match media_type {
            MEDIA_TYPE_IMAGE_MANIFEST => {
                let body = self.read_manifest_blob(repo, &digest)?;
                let manifest: ImageManifest =
                    serde_json::from_slice(&body).map_err(|err| Error::Gc {
                        reason: format!("unparseable manifest {digest_str}: {err}"),
                    })?;
                referenced.insert(manifest.config().digest().clone());
                for layer in manifest.layers() {
                    referenced.insert(layer.digest().clone());
                }
            }
            MEDIA_TYPE_IMAGE_INDEX => {
                let body = self.read_manifest_blob(repo, &digest)?;
                let index: ImageIndex =
                    serde_json::from_slice(&body).map_err(|err| Error::Gc {
                        reason: format!("unparseable index {digest_str}: {err}"),
                    })?;
                for member in index.manifests() {
                    self.mark_reachable(
                        repo,
                        member.digest(),
                        &member.media_type().to_string(),
                        referenced,
                    )?;
                }
            }
            MEDIA_TYPE_ORAS_ARTIFACT => {
                let body = self.read_manifest_blob(repo, &digest)?;
                let artifact: ArtifactManifest =
                    serde_json::from_slice(&body).map_err(|err| Error::Gc {
                        reason: format!("unparseable artifact manifest {digest_str}: {err}"),
                    })?;
                for blob in artifact.blobs {
                    referenced.insert(blob.digest);
                }
            }
            // unknown descriptor types keep only their own blob alive
            _ => {}
        }

        Ok(())
    }

    fn read_manifest_blob(&self, repo: &str, digest: &Digest) -> Result<Vec<u8>> {
        fs::read(self.blob_path(repo, digest)).map_err(|err| Error::Gc {
            reason: format!("missing manifest blob {digest}: {err}"),
        })
    }

    /// Remove upload sessions older than the grace delay. Best effort.
    fn sweep_uploads(&self, repo: &str) {
        let uploads_dir = self.repo_dir(repo).join(BLOB_UPLOAD_DIR);
        let Ok(entries) = fs::read_dir(&uploads_dir) else {
            return;
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !is_older_than(&path, self.gc_delay()) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => debug!(repo, session = %path.display(), "stale upload session removed"),
                Err(err) => warn!(repo, session = %path.display(), error = %err, "failed to remove stale upload"),
            }
        }
    }

    /// Unlink unmarked blobs older than the grace delay, dropping their
    /// dedup index entries first. Best effort per blob.
    fn sweep_blobs(&self, repo: &str, referenced: &HashSet<String>) {
        let blobs_dir = self.repo_dir(repo).join("blobs");
        let Ok(algorithms) = fs::read_dir(&blobs_dir) else {
            return;
        };

        for algorithm_entry in algorithms.filter_map(|e| e.ok()) {
            let algorithm = algorithm_entry.file_name().to_string_lossy().into_owned();
            let Ok(blobs) = fs::read_dir(algorithm_entry.path()) else {
                continue;
            };

            for blob_entry in blobs.filter_map(|e| e.ok()) {
                let digest_str = format!(
                    "{algorithm}:{}",
                    blob_entry.file_name().to_string_lossy()
                );
                if referenced.contains(&digest_str) {
                    continue;
                }
                let path = blob_entry.path();
                if !is_older_than(&path, self.gc_delay()) {
                    continue;
                }

                if let Some(cache) = self.cache() {
                    let key = self.cache_blob_key(&path);
                    if cache.has_blob(&digest_str, &key) {
                        if let Err(err) = cache.delete_blob(&digest_str, &key) {
                            warn!(repo, digest = %digest_str, error = %err, "failed to drop index entry for swept blob");
                        }
                    }
                }

                match fs::remove_file(&path) {
                    Ok(()) => debug!(repo, digest = %digest_str, "unreferenced blob swept"),
                    Err(err) => warn!(repo, digest = %digest_str, error = %err, "failed to sweep blob"),
                }
            }
        }
    }
}

fn is_older_than(path: &Path, grace: std::time::Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|mtime| mtime.elapsed().ok())
        .map(|age| age > grace)
        .unwrap_or(false)
}
