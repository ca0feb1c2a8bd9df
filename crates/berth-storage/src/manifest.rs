//! Manifest and index management.
//!
//! Manifests are stored as ordinary digest-addressed blobs; the
//! repository's `index.json` holds one descriptor per reference. Index
//! mutations happen under the repo's exclusive lock and are written back
//! atomically, so readers always observe a complete index.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;

use oci_spec::image::{
    Descriptor, DescriptorBuilder, ImageIndex, ImageIndexBuilder, ImageManifest, MediaType,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::digest::{Digest, DigestAlgorithm};
use crate::error::{Error, Result};
use crate::store::ImageStore;
use crate::{
    ANNOTATION_REF_NAME, INDEX_JSON, MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST,
    MEDIA_TYPE_ORAS_ARTIFACT,
};

/// Hook for policy checks on incoming image manifests (required
/// annotations and the like). Returning `Ok(false)` rejects the push with
/// [`Error::LintAnnotations`].
pub trait Linter: Send + Sync {
    fn lint(&self, repo: &str, digest: &Digest, manifest: &ImageManifest) -> Result<bool>;
}

/// Legacy ORAS artifact manifest
/// (`application/vnd.cncf.oras.artifact.manifest.v1+json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactManifest {
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub artifact_type: String,
    #[serde(default)]
    pub blobs: Vec<ArtifactDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<ArtifactDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Descriptor shape used by the ORAS artifact spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactDescriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// Minimal view of a stored manifest for referrer scans. Probing the raw
/// JSON keeps the scan tolerant of fields newer than the parser.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestProbe {
    #[serde(default)]
    artifact_type: Option<String>,
    #[serde(default)]
    subject: Option<ProbeDescriptor>,
    #[serde(default)]
    config: Option<ProbeDescriptor>,
    #[serde(default)]
    annotations: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProbeDescriptor {
    digest: String,
    #[serde(default)]
    media_type: Option<String>,
}

fn descriptor_tag(desc: &Descriptor) -> Option<&str> {
    desc.annotations()
        .as_ref()
        .and_then(|a| a.get(ANNOTATION_REF_NAME))
        .map(String::as_str)
}

/// Clone `index` with its manifest list swapped out, keeping the other
/// top-level fields.
fn with_manifests(index: &ImageIndex, manifests: Vec<Descriptor>) -> Result<ImageIndex> {
    let mut builder = ImageIndexBuilder::default()
        .schema_version(index.schema_version())
        .manifests(manifests);
    if let Some(media_type) = index.media_type() {
        builder = builder.media_type(media_type.clone());
    }
    if let Some(annotations) = index.annotations() {
        builder = builder.annotations(annotations.clone());
    }
    builder
        .build()
        .map_err(|e| Error::corrupt("rebuilding index.json", e))
}

impl ImageStore {
    /// Parse `index.json`. The caller is expected to hold the repo lock.
    pub(crate) fn load_index(&self, repo: &str) -> Result<ImageIndex> {
        let dir = self.repo_dir(repo);
        if !dir.is_dir() {
            return Err(Error::RepoNotFound {
                name: repo.to_string(),
            });
        }
        let buf = fs::read(dir.join(INDEX_JSON))?;
        serde_json::from_slice(&buf).map_err(|e| Error::corrupt("parsing index.json", e))
    }

    fn write_index(&self, repo: &str, index: &ImageIndex) -> Result<()> {
        let buf = serde_json::to_vec(index)
            .map_err(|e| Error::corrupt("serializing index.json", e))?;
        self.write_file(&self.repo_dir(repo).join(INDEX_JSON), &buf)
    }

    /// Store a manifest under a tag or digest reference.
    ///
    /// The body is validated against its declared media type and every blob
    /// it references (config and layers for image manifests, members for
    /// indices, blobs for ORAS artifacts) must already be present in the
    /// repository or resolvable through the dedup index. Returns the
    /// manifest digest and the digest of its `subject`, empty when there is
    /// none.
    pub fn put_image_manifest(
        &self,
        repo: &str,
        reference: &str,
        media_type: &str,
        body: &[u8],
    ) -> Result<(Digest, String)> {
        if !matches!(
            media_type,
            MEDIA_TYPE_IMAGE_MANIFEST | MEDIA_TYPE_IMAGE_INDEX | MEDIA_TYPE_ORAS_ARTIFACT
        ) {
            return Err(Error::BadManifest {
                reason: format!("unsupported media type: {media_type}"),
            });
        }

        self.init_repo(repo)?;

        let digest = Digest::compute(DigestAlgorithm::Sha256, body);
        let reference_digest = reference.parse::<Digest>().ok();
        if let Some(reference_digest) = &reference_digest {
            if *reference_digest != digest {
                return Err(Error::BadManifest {
                    reason: format!(
                        "reference digest {reference_digest} does not match body digest {digest}"
                    ),
                });
            }
        }

        let subject_digest = self.validate_manifest(repo, &digest, media_type, body)?;

        // the manifest itself is a blob
        let blob_path = self.blob_path(repo, &digest);
        let blob_existed = blob_path.exists();
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.write_file(&blob_path, body)?;

        let updated = {
            let lock = self.repo_lock(repo);
            let _guard = lock.write().unwrap_or_else(|e| e.into_inner());
            self.update_index_for_put(
                repo,
                reference,
                reference_digest.is_some(),
                media_type,
                body.len() as i64,
                &digest,
            )
        };
        if let Err(err) = updated {
            if !blob_existed {
                if let Err(rm) = fs::remove_file(&blob_path) {
                    warn!(repo, digest = %digest, error = %rm, "failed to clean up manifest blob");
                }
            }
            return Err(err);
        }

        if self.gc_enabled() {
            self.run_gc_repo(repo)?;
        }

        debug!(repo, reference, digest = %digest, "manifest stored");
        Ok((digest, subject_digest))
    }

    /// Media-type-specific body validation. Returns the subject digest,
    /// empty when the manifest has none.
    fn validate_manifest(
        &self,
        repo: &str,
        digest: &Digest,
        media_type: &str,
        body: &[u8],
    ) -> Result<String> {
        let mut subject_digest = String::new();

        match media_type {
            MEDIA_TYPE_IMAGE_MANIFEST => {
                let manifest: ImageManifest =
                    serde_json::from_slice(body).map_err(|e| Error::BadManifest {
                        reason: format!("invalid image manifest: {e}"),
                    })?;

                self.require_blob(repo, manifest.config().digest())?;
                for layer in manifest.layers() {
                    self.require_blob(repo, layer.digest())?;
                }
                if let Some(subject) = manifest.subject() {
                    subject_digest = subject.digest().clone();
                }

                if let Some(linter) = self.linter() {
                    if !linter.lint(repo, digest, &manifest)? {
                        return Err(Error::LintAnnotations);
                    }
                }
            }
            MEDIA_TYPE_IMAGE_INDEX => {
                let index: ImageIndex =
                    serde_json::from_slice(body).map_err(|e| Error::BadManifest {
                        reason: format!("invalid image index: {e}"),
                    })?;

                for member in index.manifests() {
                    self.require_blob(repo, member.digest())?;
                }
                // subject probed from the raw JSON, independent of parser
                // vintage
                if let Ok(probe) = serde_json::from_slice::<ManifestProbe>(body) {
                    if let Some(subject) = probe.subject {
                        subject_digest = subject.digest;
                    }
                }
            }
            MEDIA_TYPE_ORAS_ARTIFACT => {
                let artifact: ArtifactManifest =
                    serde_json::from_slice(body).map_err(|e| Error::BadManifest {
                        reason: format!("invalid artifact manifest: {e}"),
                    })?;

                for blob in &artifact.blobs {
                    self.require_blob(repo, &blob.digest)?;
                }
                if let Some(subject) = &artifact.subject {
                    subject_digest = subject.digest.clone();
                }
            }
            _ => unreachable!("media type vetted by caller"),
        }

        Ok(subject_digest)
    }

    /// Referenced blob presence check; resolvable-via-dedup counts as
    /// present because `check_blob` materializes the hard link.
    fn require_blob(&self, repo: &str, digest_str: &str) -> Result<()> {
        let digest: Digest = digest_str.parse()?;
        match self.check_blob(repo, &digest) {
            Ok(_) => Ok(()),
            Err(Error::BlobNotFound { .. }) => Err(Error::BlobNotFound {
                digest: digest_str.to_string(),
            }),
            Err(err) => Err(err),
        }
    }

    fn update_index_for_put(
        &self,
        repo: &str,
        reference: &str,
        reference_is_digest: bool,
        media_type: &str,
        size: i64,
        digest: &Digest,
    ) -> Result<()> {
        let index = self.load_index(repo)?;
        let mut manifests = index.manifests().clone();
        let digest_str = digest.to_string();

        if reference_is_digest {
            if let Some(position) = manifests.iter().position(|d| d.digest() == &digest_str) {
                // idempotent re-push: refresh media type and size, keep
                // whatever annotations the entry carries
                let mut builder = DescriptorBuilder::default()
                    .media_type(MediaType::from(media_type))
                    .digest(digest_str.clone())
                    .size(size);
                if let Some(annotations) = manifests[position].annotations() {
                    builder = builder.annotations(annotations.clone());
                }
                manifests[position] = builder
                    .build()
                    .map_err(|e| Error::corrupt("building descriptor", e))?;
            } else {
                let desc = DescriptorBuilder::default()
                    .media_type(MediaType::from(media_type))
                    .digest(digest_str.clone())
                    .size(size)
                    .build()
                    .map_err(|e| Error::corrupt("building descriptor", e))?;
                manifests.push(desc);
            }
        } else {
            // tag reference: the tag moves to the new manifest; the old
            // entry disappears even if its digest remains referenced by
            // other descriptors
            manifests.retain(|d| descriptor_tag(d) != Some(reference));

            let mut annotations = HashMap::new();
            annotations.insert(ANNOTATION_REF_NAME.to_string(), reference.to_string());
            let desc = DescriptorBuilder::default()
                .media_type(MediaType::from(media_type))
                .digest(digest_str)
                .size(size)
                .annotations(annotations)
                .build()
                .map_err(|e| Error::corrupt("building descriptor", e))?;
            manifests.push(desc);
        }

        let index = with_manifests(&index, manifests)?;
        self.write_index(repo, &index)
    }

    /// Fetch a manifest by tag or digest. Returns the stored bytes, the
    /// manifest digest and its media type.
    pub fn get_image_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<(Vec<u8>, Digest, String)> {
        let lock = self.repo_lock(repo);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());

        let index = self.load_index(repo)?;
        let desc = find_descriptor(&index, reference).ok_or_else(|| Error::ManifestNotFound {
            reference: reference.to_string(),
        })?;

        let digest: Digest = desc.digest().parse()?;
        let buf = fs::read(self.blob_path(repo, &digest)).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                Error::ManifestNotFound {
                    reference: reference.to_string(),
                }
            } else {
                Error::Io(err)
            }
        })?;

        Ok((buf, digest, desc.media_type().to_string()))
    }

    /// Remove a manifest reference from `index.json`.
    ///
    /// With `detect_collision` the call refuses to pick among multiple
    /// descriptors sharing the target digest and fails with
    /// `ManifestConflict`; without it the first match goes. The manifest
    /// blob stays behind as a normal dedup-tracked blob for GC to judge.
    pub fn delete_image_manifest(
        &self,
        repo: &str,
        reference: &str,
        detect_collision: bool,
    ) -> Result<()> {
        {
            let lock = self.repo_lock(repo);
            let _guard = lock.write().unwrap_or_else(|e| e.into_inner());

            let index = self.load_index(repo)?;
            let mut manifests = index.manifests().clone();

            let reference_digest = reference.parse::<Digest>().ok().map(|d| d.to_string());
            let position = manifests
                .iter()
                .position(|d| match &reference_digest {
                    Some(digest) => d.digest() == digest,
                    None => descriptor_tag(d) == Some(reference),
                })
                .ok_or_else(|| Error::ManifestNotFound {
                    reference: reference.to_string(),
                })?;

            let digest_str = manifests[position].digest().clone();
            if detect_collision {
                let shared = manifests.iter().filter(|d| d.digest() == &digest_str).count();
                if shared > 1 {
                    return Err(Error::ManifestConflict { digest: digest_str });
                }
            }

            manifests.remove(position);
            let index = with_manifests(&index, manifests)?;
            self.write_index(repo, &index)?;
        }

        if self.gc_enabled() {
            self.run_gc_repo(repo)?;
        }

        debug!(repo, reference, "manifest deleted");
        Ok(())
    }

    /// Every tag in the repository, in index order.
    pub fn get_image_tags(&self, repo: &str) -> Result<Vec<String>> {
        let lock = self.repo_lock(repo);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());

        let index = self.load_index(repo)?;
        Ok(index
            .manifests()
            .iter()
            .filter_map(|d| descriptor_tag(d).map(str::to_string))
            .collect())
    }

    /// Raw `index.json` bytes.
    pub fn get_index_content(&self, repo: &str) -> Result<Vec<u8>> {
        let lock = self.repo_lock(repo);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());

        let dir = self.repo_dir(repo);
        if !dir.is_dir() {
            return Err(Error::RepoNotFound {
                name: repo.to_string(),
            });
        }
        Ok(fs::read(dir.join(INDEX_JSON))?)
    }

    /// OCI referrers: an image index listing every stored manifest whose
    /// `subject` names `digest`, optionally filtered by artifact type. An
    /// unknown digest simply yields an empty index.
    pub fn get_referrers(
        &self,
        repo: &str,
        digest: &Digest,
        artifact_types: &[String],
    ) -> Result<ImageIndex> {
        let lock = self.repo_lock(repo);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());

        let index = self.load_index(repo)?;
        let subject_key = digest.to_string();
        let mut referrers: Vec<Descriptor> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for desc in index.manifests() {
            let media_type = desc.media_type().to_string();
            if media_type != MEDIA_TYPE_IMAGE_MANIFEST && media_type != MEDIA_TYPE_IMAGE_INDEX {
                continue;
            }
            if seen.contains(desc.digest()) {
                continue;
            }

            let Ok(manifest_digest) = desc.digest().parse::<Digest>() else {
                continue;
            };
            let Ok(body) = fs::read(self.blob_path(repo, &manifest_digest)) else {
                // unreadable manifests cannot subject-reference anything
                continue;
            };
            let Ok(probe) = serde_json::from_slice::<ManifestProbe>(&body) else {
                continue;
            };
            let Some(subject) = probe.subject else {
                continue;
            };
            if subject.digest != subject_key {
                continue;
            }

            let artifact_type = probe
                .artifact_type
                .or_else(|| probe.config.and_then(|c| c.media_type));
            if !artifact_types.is_empty() {
                match &artifact_type {
                    Some(at) if artifact_types.contains(at) => {}
                    _ => continue,
                }
            }

            let mut builder = DescriptorBuilder::default()
                .media_type(desc.media_type().clone())
                .digest(desc.digest().clone())
                .size(desc.size());
            if let Some(at) = &artifact_type {
                builder = builder.artifact_type(MediaType::from(at.as_str()));
            }
            if let Some(annotations) = probe.annotations {
                builder = builder.annotations(annotations);
            }
            referrers.push(
                builder
                    .build()
                    .map_err(|e| Error::corrupt("building referrer descriptor", e))?,
            );
            seen.insert(desc.digest().clone());
        }

        ImageIndexBuilder::default()
            .schema_version(crate::SCHEMA_VERSION)
            .media_type(MediaType::ImageIndex)
            .manifests(referrers)
            .build()
            .map_err(|e| Error::corrupt("building referrers index", e))
    }

    /// Same scan for the legacy ORAS artifact format. Unlike the OCI
    /// variant this fails with `ManifestNotFound` when nothing references
    /// `digest`.
    pub fn get_oras_referrers(
        &self,
        repo: &str,
        digest: &Digest,
        artifact_type: &str,
    ) -> Result<Vec<ArtifactDescriptor>> {
        let lock = self.repo_lock(repo);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());

        let index = self.load_index(repo)?;
        let subject_key = digest.to_string();
        let mut referrers = Vec::new();

        for desc in index.manifests() {
            if desc.media_type().to_string() != MEDIA_TYPE_ORAS_ARTIFACT {
                continue;
            }
            let Ok(manifest_digest) = desc.digest().parse::<Digest>() else {
                continue;
            };
            let Ok(body) = fs::read(self.blob_path(repo, &manifest_digest)) else {
                continue;
            };
            let Ok(artifact) = serde_json::from_slice::<ArtifactManifest>(&body) else {
                continue;
            };
            let Some(subject) = &artifact.subject else {
                continue;
            };
            if subject.digest != subject_key {
                continue;
            }
            if !artifact_type.is_empty() && artifact.artifact_type != artifact_type {
                continue;
            }

            referrers.push(ArtifactDescriptor {
                media_type: MEDIA_TYPE_ORAS_ARTIFACT.to_string(),
                digest: desc.digest().clone(),
                size: desc.size(),
                artifact_type: Some(artifact.artifact_type.clone()),
                annotations: artifact.annotations.clone(),
            });
        }

        if referrers.is_empty() {
            return Err(Error::ManifestNotFound {
                reference: subject_key,
            });
        }
        Ok(referrers)
    }
}

fn find_descriptor<'a>(index: &'a ImageIndex, reference: &str) -> Option<&'a Descriptor> {
    if let Ok(digest) = reference.parse::<Digest>() {
        let digest_str = digest.to_string();
        index.manifests().iter().find(|d| d.digest() == &digest_str)
    } else {
        index
            .manifests()
            .iter()
            .find(|d| descriptor_tag(d) == Some(reference))
    }
}
