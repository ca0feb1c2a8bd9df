//! Scriptable in-memory [`BlobCache`](crate::BlobCache) for tests.
//!
//! Each operation can be overridden with a closure so tests can synthesize
//! cache failures on specific digests or paths (the engine must abort an
//! upload when the index cannot record a deduped blob). Operations without
//! an override fall back to a plain in-memory map, so the mock doubles as a
//! functional cache.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{BlobCache, CacheResult};

type PutFn = dyn Fn(&str, &str) -> CacheResult<()> + Send + Sync;
type GetFn = dyn Fn(&str) -> CacheResult<Option<String>> + Send + Sync;
type HasFn = dyn Fn(&str, &str) -> bool + Send + Sync;
type DeleteFn = dyn Fn(&str, &str) -> CacheResult<()> + Send + Sync;

#[derive(Default)]
pub struct MockCache {
    put_blob_fn: Option<Box<PutFn>>,
    get_blob_fn: Option<Box<GetFn>>,
    has_blob_fn: Option<Box<HasFn>>,
    delete_blob_fn: Option<Box<DeleteFn>>,
    entries: Mutex<HashMap<String, Vec<String>>>,
}

impl MockCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_put_blob<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &str) -> CacheResult<()> + Send + Sync + 'static,
    {
        self.put_blob_fn = Some(Box::new(hook));
        self
    }

    pub fn with_get_blob<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) -> CacheResult<Option<String>> + Send + Sync + 'static,
    {
        self.get_blob_fn = Some(Box::new(hook));
        self
    }

    pub fn with_has_blob<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.has_blob_fn = Some(Box::new(hook));
        self
    }

    pub fn with_delete_blob<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &str) -> CacheResult<()> + Send + Sync + 'static,
    {
        self.delete_blob_fn = Some(Box::new(hook));
        self
    }
}

impl BlobCache for MockCache {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn uses_relative_paths(&self) -> bool {
        true
    }

    fn put_blob(&self, digest: &str, path: &str) -> CacheResult<()> {
        if let Some(hook) = &self.put_blob_fn {
            return hook(digest, path);
        }
        let mut entries = self.entries.lock().unwrap();
        let paths = entries.entry(digest.to_string()).or_default();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_string());
        }
        Ok(())
    }

    fn get_blob(&self, digest: &str) -> CacheResult<Option<String>> {
        if let Some(hook) = &self.get_blob_fn {
            return hook(digest);
        }
        let entries = self.entries.lock().unwrap();
        Ok(entries.get(digest).and_then(|p| p.first().cloned()))
    }

    fn has_blob(&self, digest: &str, path: &str) -> bool {
        if let Some(hook) = &self.has_blob_fn {
            return hook(digest, path);
        }
        let entries = self.entries.lock().unwrap();
        entries
            .get(digest)
            .map(|paths| paths.iter().any(|p| p == path))
            .unwrap_or(false)
    }

    fn delete_blob(&self, digest: &str, path: &str) -> CacheResult<()> {
        if let Some(hook) = &self.delete_blob_fn {
            return hook(digest, path);
        }
        let mut entries = self.entries.lock().unwrap();
        if let Some(paths) = entries.get_mut(digest) {
            paths.retain(|p| p != path);
            if paths.is_empty() {
                entries.remove(digest);
            }
        }
        Ok(())
    }
}
