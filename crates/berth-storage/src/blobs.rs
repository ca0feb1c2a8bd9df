//! Blob ingress and egress: resumable upload sessions plus
//! content-addressed reads, writes and deletes.
//!
//! Uploads are append-only scratch files under `.uploads/`; a finished
//! upload is digest-verified and committed to `blobs/<alg>/<hex>` through
//! the dedup engine. Sessions are single-writer by client contract; the
//! engine rejects out-of-order chunks.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::OpenOptionsExt;

use tracing::{debug, warn};

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::store::ImageStore;

impl ImageStore {
    /// Start a resumable upload session, returning its opaque id.
    pub fn new_blob_upload(&self, repo: &str) -> Result<String> {
        self.init_repo(repo)?;

        let session = self.new_session_id();
        let path = self.blob_upload_path(repo, &session);
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)?;

        Ok(session)
    }

    /// Current size of an upload session's scratch file.
    pub fn get_blob_upload(&self, repo: &str, session: &str) -> Result<u64> {
        let path = self.blob_upload_path(repo, session);
        let meta = fs::metadata(&path).map_err(|_| Error::UploadNotFound {
            session: session.to_string(),
        })?;
        Ok(meta.len())
    }

    /// Append one chunk at offset `from`. Chunks must be contiguous:
    /// `from` has to equal the current scratch size. `to` is the declared
    /// end offset from the protocol layer; the engine trusts the stream and
    /// only reports what actually arrived.
    pub fn put_blob_chunk(
        &self,
        repo: &str,
        session: &str,
        from: u64,
        to: u64,
        mut reader: impl Read,
    ) -> Result<u64> {
        let path = self.blob_upload_path(repo, session);
        let meta = fs::metadata(&path).map_err(|_| Error::UploadNotFound {
            session: session.to_string(),
        })?;

        if from != meta.len() {
            debug!(
                repo,
                session,
                from,
                size = meta.len(),
                "rejecting out-of-order chunk"
            );
            return Err(Error::BadUploadRange {
                session: session.to_string(),
            });
        }

        let mut file = OpenOptions::new().append(true).open(&path)?;
        let written = io::copy(&mut reader, &mut file)?;
        self.sync_file(&file)?;

        if written != to.saturating_sub(from) {
            debug!(repo, session, from, to, written, "chunk length differs from declared range");
        }

        Ok(written)
    }

    /// Append whatever bytes `reader` yields, without range bookkeeping.
    pub fn put_blob_chunk_streamed(
        &self,
        repo: &str,
        session: &str,
        mut reader: impl Read,
    ) -> Result<u64> {
        let path = self.blob_upload_path(repo, session);
        fs::metadata(&path).map_err(|_| Error::UploadNotFound {
            session: session.to_string(),
        })?;

        let mut file = OpenOptions::new().append(true).open(&path)?;
        let written = io::copy(&mut reader, &mut file)?;
        self.sync_file(&file)?;

        Ok(written)
    }

    /// Consume an upload session: append any trailing bytes, verify the
    /// scratch content against `digest`, and commit it as a blob through
    /// the dedup engine. A digest mismatch drops the session.
    pub fn finish_blob_upload(
        &self,
        repo: &str,
        session: &str,
        mut reader: impl Read,
        digest: &Digest,
    ) -> Result<()> {
        let path = self.blob_upload_path(repo, session);
        fs::metadata(&path).map_err(|_| Error::UploadNotFound {
            session: session.to_string(),
        })?;

        {
            let mut file = OpenOptions::new().append(true).open(&path)?;
            io::copy(&mut reader, &mut file)?;
            self.sync_file(&file)?;
        }

        let mut scratch = File::open(&path)?;
        let actual = Digest::from_reader(digest.algorithm(), &mut scratch)?;
        drop(scratch);
        if actual != *digest {
            if let Err(err) = fs::remove_file(&path) {
                warn!(repo, session, error = %err, "failed to drop mismatched upload");
            }
            return Err(Error::BadBlobDigest {
                digest: digest.to_string(),
            });
        }

        let blob_path = self.blob_path(repo, digest);
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.dedupe_blob(&path, digest, &blob_path)?;

        debug!(repo, session, digest = %digest, "upload committed");
        Ok(())
    }

    /// One-shot upload: stream `reader` into a fresh session and finish it.
    /// Returns the session id and the number of bytes ingested.
    pub fn full_blob_upload(
        &self,
        repo: &str,
        mut reader: impl Read,
        digest: &Digest,
    ) -> Result<(String, u64)> {
        let session = self.new_blob_upload(repo)?;
        let path = self.blob_upload_path(repo, &session);

        let size = {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            let size = io::copy(&mut reader, &mut file)?;
            self.sync_file(&file)?;
            size
        };

        let mut scratch = File::open(&path)?;
        let actual = Digest::from_reader(digest.algorithm(), &mut scratch)?;
        drop(scratch);
        if actual != *digest {
            if let Err(err) = fs::remove_file(&path) {
                warn!(repo, session, error = %err, "failed to drop mismatched upload");
            }
            return Err(Error::BadBlobDigest {
                digest: digest.to_string(),
            });
        }

        let blob_path = self.blob_path(repo, digest);
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.dedupe_blob(&path, digest, &blob_path)?;

        Ok((session, size))
    }

    /// Drop an upload session without committing it.
    pub fn delete_blob_upload(&self, repo: &str, session: &str) -> Result<()> {
        let path = self.blob_upload_path(repo, session);
        fs::remove_file(&path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::UploadNotFound {
                    session: session.to_string(),
                }
            } else {
                err.into()
            }
        })
    }

    /// Whether `digest` is available in `repo`, and at what size.
    ///
    /// A local miss consults the dedup index; on a hit the canonical copy is
    /// materialized into this repository via hard link and reported present.
    /// Stale index entries (canonical file gone) are dropped and treated as
    /// a miss.
    pub fn check_blob(&self, repo: &str, digest: &Digest) -> Result<(bool, u64)> {
        let blob_path = self.blob_path(repo, digest);

        {
            let lock = self.repo_lock(repo);
            let _guard = lock.read().unwrap_or_else(|e| e.into_inner());
            if let Ok(meta) = fs::metadata(&blob_path) {
                return Ok((true, meta.len()));
            }
        }

        if !self.dedupe_enabled() {
            return Err(Error::BlobNotFound {
                digest: digest.to_string(),
            });
        }
        let Some(cache) = self.cache() else {
            return Err(Error::BlobNotFound {
                digest: digest.to_string(),
            });
        };

        let lock = self.repo_lock(repo);
        let _guard = lock.write().unwrap_or_else(|e| e.into_inner());

        // somebody may have materialized it while we upgraded the lock
        if let Ok(meta) = fs::metadata(&blob_path) {
            return Ok((true, meta.len()));
        }

        let digest_key = digest.to_string();
        let Some(record) = cache.get_blob(&digest_key)? else {
            return Err(Error::BlobNotFound {
                digest: digest_key,
            });
        };

        let canonical = self.cache_blob_path(&record);
        let meta = match fs::metadata(&canonical) {
            Ok(meta) => meta,
            Err(err) => {
                debug!(digest = %digest, record = %record, error = %err, "dropping stale dedup entry");
                if let Err(err) = cache.delete_blob(&digest_key, &record) {
                    warn!(digest = %digest, error = %err, "failed to drop stale dedup entry");
                }
                return Err(Error::BlobNotFound { digest: digest_key });
            }
        };

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::hard_link(&canonical, &blob_path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err.into()),
        }
        cache.put_blob(&digest_key, &self.cache_blob_key(&blob_path))?;

        debug!(repo, digest = %digest, "blob materialized from dedup index");
        Ok((true, meta.len()))
    }

    /// Open a blob for reading. `_media_type` is the content negotiation
    /// hint from the protocol layer; the engine serves bytes regardless.
    pub fn get_blob(
        &self,
        repo: &str,
        digest: &Digest,
        _media_type: &str,
    ) -> Result<(Box<dyn Read + Send>, u64)> {
        let lock = self.repo_lock(repo);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());

        let path = self.blob_path(repo, digest);
        let meta = fs::metadata(&path).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })?;
        let file = File::open(&path)?;

        Ok((Box::new(file), meta.len()))
    }

    /// Open a bounded reader over `[from, min(to, size-1)]`, inclusive.
    /// `to < 0` means "through the end of the blob". Returns the reader,
    /// the chunk length and the total blob size.
    pub fn get_blob_partial(
        &self,
        repo: &str,
        digest: &Digest,
        _media_type: &str,
        from: i64,
        to: i64,
    ) -> Result<(Box<dyn Read + Send>, u64, u64)> {
        let lock = self.repo_lock(repo);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());

        let path = self.blob_path(repo, digest);
        let meta = fs::metadata(&path).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })?;
        let size = meta.len() as i64;

        let to = if to < 0 || to >= size { size - 1 } else { to };
        if from < 0 || from >= size || to < from {
            return Err(Error::BadRange);
        }

        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(from as u64))?;
        let chunk = (to - from + 1) as u64;

        Ok((Box::new(file.take(chunk)), chunk, meta.len()))
    }

    /// Convenience full read of a blob.
    pub fn get_blob_content(&self, repo: &str, digest: &Digest) -> Result<Vec<u8>> {
        let lock = self.repo_lock(repo);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());

        fs::read(self.blob_path(repo, digest)).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::BlobNotFound {
                    digest: digest.to_string(),
                }
            } else {
                err.into()
            }
        })
    }

    /// Unlink a blob from this repository. The dedup index entry for this
    /// path is removed first; if the path was canonical the index promotes
    /// the next hard link, so shared content in other repositories stays
    /// reachable.
    pub fn delete_blob(&self, repo: &str, digest: &Digest) -> Result<()> {
        let lock = self.repo_lock(repo);
        let _guard = lock.write().unwrap_or_else(|e| e.into_inner());

        let path = self.blob_path(repo, digest);
        if fs::metadata(&path).is_err() {
            return Err(Error::BlobNotFound {
                digest: digest.to_string(),
            });
        }

        if let Some(cache) = self.cache() {
            let key = self.cache_blob_key(&path);
            let digest_key = digest.to_string();
            if cache.has_blob(&digest_key, &key) {
                cache.delete_blob(&digest_key, &key)?;
            }
        }

        fs::remove_file(&path)?;
        debug!(repo, digest = %digest, "blob deleted");

        Ok(())
    }
}
