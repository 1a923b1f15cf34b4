//! Disk-backed response caching.
//!
//! `DiskCache` is a content-addressed blob store keyed by the SHA-1 of the
//! request URL. It is strictly best-effort: corruption, missing files and
//! write failures all degrade to cache misses and are never surfaced.
//! `CachedWebservice` composes it with the network layer so callers get an
//! instant stale value followed by a fresh one.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tracing::debug;

use crate::api::{Method, Resource, Webservice, WebserviceError};

/// Byte-blob store on persistent storage. Only GET resources are cached;
/// entries are invalidated by overwrite only.
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn location<T>(&self, resource: &Resource<T>) -> PathBuf {
        self.dir.join(resource.cache_key())
    }

    /// Cached parse of a prior response. `None` for non-GET resources, on a
    /// missing entry, or when the cached bytes no longer parse.
    pub fn load<T>(&self, resource: &Resource<T>) -> Option<T> {
        if !matches!(resource.method(), Method::Get) {
            return None;
        }
        let data = fs::read(self.location(resource)).ok()?;
        resource.parse(&data)
    }

    /// Overwrites the entry for this resource. No-op for non-GET resources;
    /// write failures are swallowed.
    pub fn save<T>(&self, data: &[u8], resource: &Resource<T>) {
        if !matches!(resource.method(), Method::Get) {
            return;
        }
        if let Err(err) = fs::create_dir_all(&self.dir) {
            debug!(dir = %self.dir.display(), error = %err, "cache dir unavailable");
            return;
        }
        let path = self.location(resource);
        if let Err(err) = fs::write(&path, data) {
            debug!(path = %path.display(), error = %err, "cache write failed");
        }
    }
}

/// Serves a cached value immediately while a network refresh runs.
///
/// `load` yields at most two results and callers must tolerate both: an
/// optional `Ok` from the cache, then the network outcome. A network error
/// is forwarded even after a cached success; the cache-miss path never
/// produces an error of its own.
#[derive(Clone)]
pub struct CachedWebservice {
    webservice: Webservice,
    cache: Arc<DiskCache>,
}

impl CachedWebservice {
    pub fn new(webservice: Webservice, cache: DiskCache) -> Self {
        Self {
            webservice,
            cache: Arc::new(cache),
        }
    }

    pub fn load<T>(
        &self,
        resource: Resource<T>,
        skip_cache: bool,
    ) -> BoxStream<'static, Result<T, WebserviceError>>
    where
        T: Send + 'static,
    {
        // The cache read happens here, before any network I/O is initiated.
        let cached = if skip_cache {
            None
        } else {
            self.cache.load(&resource)
        };
        if cached.is_some() {
            debug!(url = %resource.url(), "serving cached value ahead of refresh");
        }

        let webservice = self.webservice.clone();
        let cache = Arc::clone(&self.cache);
        let refresh = async move {
            let raw = Resource::bytes(resource.url().clone(), resource.method().clone());
            match webservice.load(&raw).await {
                Ok(data) => {
                    cache.save(&data, &raw);
                    resource
                        .parse(&data)
                        .ok_or_else(|| WebserviceError::Other("unparseable response".into()))
                }
                Err(err) => Err(err),
            }
        };

        stream::iter(cached.map(Ok)).chain(stream::once(refresh)).boxed()
    }
}
