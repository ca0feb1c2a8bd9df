//! Error surface of the storage engine.
//!
//! I/O errors are surfaced verbatim; inconsistencies the engine detects are
//! converted to the kinds below. Nothing in this crate panics on user input.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("repository not found: {name}")]
    RepoNotFound { name: String },

    #[error("invalid repository name: {name}")]
    InvalidRepoName { name: String },

    #[error("unsupported OCI layout version in repository {name}")]
    RepoBadVersion { name: String },

    #[error("manifest not found: {reference}")]
    ManifestNotFound { reference: String },

    #[error("bad manifest: {reason}")]
    BadManifest { reason: String },

    #[error("manifest is referenced by multiple descriptors: {digest}")]
    ManifestConflict { digest: String },

    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    #[error("blob digest mismatch: {digest}")]
    BadBlobDigest { digest: String },

    #[error("blob upload session not found: {session}")]
    UploadNotFound { session: String },

    #[error("non-contiguous chunk for upload session {session}")]
    BadUploadRange { session: String },

    #[error("requested byte range is not satisfiable")]
    BadRange,

    #[error("manifest annotation lint failed")]
    LintAnnotations,

    #[error("garbage collection aborted: {reason}")]
    Gc { reason: String },

    #[error("dedup cache error: {0}")]
    Cache(#[from] berth_cache::CacheError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for corrupt on-disk JSON surfaced as an I/O error.
    pub(crate) fn corrupt(what: &str, err: impl std::fmt::Display) -> Self {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{what}: {err}"),
        ))
    }
}
