//! # berth-storage
//!
//! Content-addressable image storage engine implementing the OCI
//! Distribution and Image layouts on top of an ordinary POSIX filesystem.
//!
//! Each repository is a directory holding an OCI image layout: an
//! `oci-layout` marker, an `index.json` of manifest descriptors, a
//! content-addressed `blobs/<algorithm>/<hex>` tree, and a `.uploads/`
//! scratch area for resumable uploads. Identical blobs are shared across
//! repositories through hard links, tracked by a global digest → path index
//! ([`berth_cache::BlobCache`]). Unreachable content is reclaimed by a
//! per-repository mark-and-sweep garbage collector with a grace delay.
//!
//! The engine exposes an in-process API only; HTTP routing, authentication
//! and the wire protocol belong to the layers above. It is safe for
//! concurrent use: mutations to a repository's `index.json` are serialized
//! by a per-repo lock, blob writes are atomic (temp file + rename), and the
//! dedup index serializes its own updates.

mod blobs;
mod dedupe;
mod digest;
mod error;
mod gc;
mod layout;
mod manifest;
mod scheduler;
mod store;

pub use digest::{Digest, DigestAlgorithm};
pub use error::{Error, Result};
pub use manifest::{ArtifactDescriptor, ArtifactManifest, Linter};
pub use scheduler::{CancelFlag, Scheduler, Task, TaskGenerator};
pub use store::{validate_hard_link, ImageStore};

use std::time::Duration;

/// Scratch directory for in-flight uploads inside every repository.
pub const BLOB_UPLOAD_DIR: &str = ".uploads";

/// OCI layout marker file name.
pub const OCI_LAYOUT_FILE: &str = "oci-layout";

/// Per-repository manifest index file name.
pub const INDEX_JSON: &str = "index.json";

/// The only OCI image layout version the engine reads or writes.
pub const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

/// `schemaVersion` stamped on freshly-initialized `index.json` files.
pub const SCHEMA_VERSION: u32 = 2;

/// Grace before unreferenced blobs and stale upload sessions may be swept.
pub const DEFAULT_GC_DELAY: Duration = Duration::from_secs(3600);

/// Annotation carrying the human-readable tag on a descriptor.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// OCI image manifest media type.
pub const MEDIA_TYPE_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index media type.
pub const MEDIA_TYPE_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Legacy ORAS artifact manifest media type.
pub const MEDIA_TYPE_ORAS_ARTIFACT: &str = "application/vnd.cncf.oras.artifact.manifest.v1+json";
