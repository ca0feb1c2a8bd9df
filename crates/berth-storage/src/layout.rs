//! Repository layout management: creation, validation and enumeration of
//! per-repository OCI image layouts.

use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::store::ImageStore;
use crate::{BLOB_UPLOAD_DIR, IMAGE_LAYOUT_VERSION, INDEX_JSON, OCI_LAYOUT_FILE, SCHEMA_VERSION};

/// OCI distribution-spec repository name grammar.
static REPO_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*$")
        .expect("repository name regex is valid")
});

/// `oci-layout` marker contents.
#[derive(Debug, Serialize, Deserialize)]
struct ImageLayout {
    #[serde(rename = "imageLayoutVersion")]
    version: String,
}

pub(crate) fn valid_repo_name(name: &str) -> bool {
    REPO_NAME_RE.is_match(name)
}

impl ImageStore {
    /// Create the on-disk layout for `name`. Idempotent: existing pieces are
    /// left untouched, missing ones are created.
    pub fn init_repo(&self, name: &str) -> Result<()> {
        if !valid_repo_name(name) {
            return Err(Error::InvalidRepoName {
                name: name.to_string(),
            });
        }

        let lock = self.repo_lock(name);
        let _guard = lock.write().unwrap_or_else(|e| e.into_inner());

        let dir = self.repo_dir(name);
        fs::create_dir_all(dir.join("blobs").join("sha256"))?;
        fs::create_dir_all(dir.join(BLOB_UPLOAD_DIR))?;

        let layout_path = dir.join(OCI_LAYOUT_FILE);
        if !layout_path.exists() {
            let layout = ImageLayout {
                version: IMAGE_LAYOUT_VERSION.to_string(),
            };
            let buf = serde_json::to_vec(&layout)
                .map_err(|e| Error::corrupt("serializing oci-layout", e))?;
            self.write_file(&layout_path, &buf)?;
        }

        let index_path = dir.join(INDEX_JSON);
        if !index_path.exists() {
            let index = serde_json::json!({
                "schemaVersion": SCHEMA_VERSION,
                "manifests": [],
            });
            let buf = serde_json::to_vec(&index)
                .map_err(|e| Error::corrupt("serializing index.json", e))?;
            self.write_file(&index_path, &buf)?;
        }

        self.sync_parent(&dir);
        debug!(repo = name, "repository initialized");

        Ok(())
    }

    /// Check that `name` holds a complete, well-formed OCI layout.
    ///
    /// Returns `Ok(false)` when a required piece is missing or has the wrong
    /// file type, `RepoNotFound` when the directory itself is absent or
    /// unreadable, and `RepoBadVersion` for a parseable layout marker with
    /// an unsupported version.
    pub fn validate_repo(&self, name: &str) -> Result<bool> {
        if name == "." || name == ".." || !valid_repo_name(name) {
            return Err(Error::InvalidRepoName {
                name: name.to_string(),
            });
        }

        let dir = self.repo_dir(name);
        let entries = fs::read_dir(&dir).map_err(|_| Error::RepoNotFound {
            name: name.to_string(),
        })?;

        let mut has_blobs = false;
        let mut has_uploads = false;
        let mut has_index = false;
        let mut has_layout = false;
        for entry in entries {
            let entry = entry.map_err(|_| Error::RepoNotFound {
                name: name.to_string(),
            })?;
            let file_name = entry.file_name();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            match file_name.to_string_lossy().as_ref() {
                "blobs" => has_blobs = is_dir,
                BLOB_UPLOAD_DIR => has_uploads = is_dir,
                INDEX_JSON => has_index = !is_dir,
                OCI_LAYOUT_FILE => has_layout = !is_dir,
                _ => {}
            }
        }

        if !(has_blobs && has_uploads && has_index && has_layout) {
            return Ok(false);
        }

        let buf = fs::read(dir.join(OCI_LAYOUT_FILE))?;
        let layout: ImageLayout = serde_json::from_slice(&buf)
            .map_err(|e| Error::corrupt("parsing oci-layout", e))?;
        if layout.version != IMAGE_LAYOUT_VERSION {
            return Err(Error::RepoBadVersion {
                name: name.to_string(),
            });
        }

        Ok(true)
    }

    /// Walk the storage root and return every subpath holding a valid
    /// layout. The root itself is never reported, invalid names are skipped
    /// silently, and nested repositories come back as `/`-joined paths.
    pub fn get_repositories(&self) -> Result<Vec<String>> {
        let mut repos = Vec::new();

        for entry in WalkDir::new(self.root_dir())
            .min_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_dir() {
                continue;
            }

            let Ok(rel) = entry.path().strip_prefix(self.root_dir()) else {
                continue;
            };
            let name = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if !valid_repo_name(&name) {
                continue;
            }
            if matches!(self.validate_repo(&name), Ok(true)) {
                repos.push(name);
            }
        }

        Ok(repos)
    }

    /// Resumable lexicographic cursor over valid repositories. Passing an
    /// empty `last_repo` yields the first repository; `Ok(None)` signals the
    /// end of the stream.
    pub fn get_next_repository(&self, last_repo: &str) -> Result<Option<String>> {
        let repos = self.get_repositories()?;

        if last_repo.is_empty() {
            return Ok(repos.into_iter().next());
        }

        let mut iter = repos.into_iter();
        for repo in iter.by_ref() {
            if repo == last_repo {
                break;
            }
        }
        Ok(iter.next())
    }
}

/// Seed a bare directory with the four layout pieces, bypassing the engine.
/// Test helper shared by the layout suites.
#[cfg(test)]
pub(crate) fn scaffold_layout(dir: &Path) {
    fs::create_dir_all(dir.join("blobs")).unwrap();
    fs::create_dir_all(dir.join(BLOB_UPLOAD_DIR)).unwrap();
    fs::write(dir.join(INDEX_JSON), b"{\"schemaVersion\":2,\"manifests\":[]}").unwrap();
    fs::write(dir.join(OCI_LAYOUT_FILE), b"{\"imageLayoutVersion\":\"1.0.0\"}").unwrap();
}
