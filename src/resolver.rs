//! Blob resolution: custom handlers first, the HTTP fetcher as default.
//!
//! A [`Resolver`] maps a blob descriptor to a fetcher — either one supplied
//! by a registered [`Handler`] or the default [`HttpFetcher`] — and wraps it
//! in a [`Blob`] carrying the blob size, a validity interval, and ranged
//! reads backed by an external [`BlobCache`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::config::BlobConfig;
use crate::errors::{FetchError, Result};
use crate::fetcher::{BlobDescriptor, HttpFetcher, PartStream};
use crate::hosts::RegistryHost;
use crate::reference::ImageReference;
use crate::region::{super_region, Region, RegionSet};

/// A caller-supplied source of blob contents, addressed by offset and size.
///
/// Custom fetchers let a snapshotter serve blob data from somewhere other
/// than the registry (a local store, a sibling node, ...).
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Reads `size` bytes starting at `offset`.
    async fn fetch(&self, offset: u64, size: u64) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Verifies the source is still reachable.
    async fn check(&self) -> Result<()>;

    /// Stable cache identifier for the given range.
    fn gen_id(&self, offset: u64, size: u64) -> String;
}

/// Decides whether a custom [`Fetcher`] serves a descriptor.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Returns the fetcher and blob size when this handler covers `desc`.
    async fn handle(&self, desc: &BlobDescriptor) -> Result<(Arc<dyn Fetcher>, u64)>;
}

/// The external blob cache contract: concurrent get/put keyed by a string,
/// idempotent writes.
#[async_trait]
pub trait BlobCache: Send + Sync {
    /// The cached bytes for `key`, if present.
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Stores `data` under `key`. Duplicate writes may happen under
    /// concurrency and must be harmless.
    async fn put(&self, key: &str, data: Bytes);
}

/// A cache that never hits, for callers without one.
pub struct NoopCache;

#[async_trait]
impl BlobCache for NoopCache {
    async fn get(&self, _key: &str) -> Option<Bytes> {
        None
    }

    async fn put(&self, _key: &str, _data: Bytes) {}
}

/// Either the default HTTP fetcher or a handler-provided one, behind the
/// region-oriented shape the [`Blob`] works with.
pub(crate) enum RegionFetcher {
    Http(HttpFetcher),
    Remote(Arc<dyn Fetcher>),
}

impl RegionFetcher {
    pub(crate) async fn fetch(&self, regions: &[Region], allow_retry: bool) -> Result<PartStream> {
        match self {
            RegionFetcher::Http(f) => f.fetch(regions, allow_retry).await,
            RegionFetcher::Remote(f) => {
                // Custom fetchers take one contiguous range; squash the
                // request the same way single-range mode does.
                let mut set = RegionSet::new();
                for region in regions {
                    set.add(*region);
                }
                if set.is_empty() {
                    return Err(FetchError::NoRegion);
                }
                let region = super_region(set.regions());
                let reader = f.fetch(region.begin, region.size()).await?;
                Ok(PartStream::single(region, reader))
            }
        }
    }

    pub(crate) async fn check(&self) -> Result<()> {
        match self {
            RegionFetcher::Http(f) => f.check().await,
            RegionFetcher::Remote(f) => f.check().await,
        }
    }

    pub(crate) fn gen_id(&self, region: Region) -> String {
        match self {
            RegionFetcher::Http(f) => f.gen_id(region),
            RegionFetcher::Remote(f) => f.gen_id(region.begin, region.size()),
        }
    }
}

/// Maps blob descriptors to fetchers.
pub struct Resolver {
    blob_config: BlobConfig,
    handlers: Vec<(String, Arc<dyn Handler>)>,
}

impl Resolver {
    /// Creates a resolver with no custom handlers.
    pub fn new(blob_config: BlobConfig) -> Self {
        Resolver {
            blob_config,
            handlers: Vec::new(),
        }
    }

    /// Registers a custom handler. Handlers are consulted in registration
    /// order; the first to accept a descriptor wins.
    pub fn register_handler(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.push((name.into(), handler));
    }

    /// Resolves `desc` to a [`Blob`].
    ///
    /// Custom handlers are tried first; if none accepts, the default HTTP
    /// fetcher is constructed against `hosts`. A descriptor with size `0`
    /// triggers size discovery against the chosen host.
    pub async fn resolve(
        &self,
        hosts: &[RegistryHost],
        reference: &ImageReference,
        desc: &BlobDescriptor,
        cache: Arc<dyn BlobCache>,
    ) -> Result<Blob> {
        let mut handler_errors = Vec::new();
        for (name, handler) in &self.handlers {
            match handler.handle(desc).await {
                Ok((fetcher, size)) => {
                    debug!(handler = %name, reference = %reference, digest = %desc.digest,
                        "blob contents provided by a handler");
                    return Ok(Blob::new(
                        RegionFetcher::Remote(fetcher),
                        size,
                        self.blob_config.valid_interval(),
                        cache,
                    ));
                }
                Err(err) => handler_errors.push(format!("{name}: {err}")),
            }
        }
        if !handler_errors.is_empty() {
            debug!(reference = %reference, digest = %desc.digest,
                errors = %handler_errors.join("; "), "falling back to the default fetcher");
        }

        let fetcher = match HttpFetcher::new(hosts, reference, desc, &self.blob_config).await {
            Ok(fetcher) => fetcher,
            Err(err) if handler_errors.is_empty() => return Err(err),
            Err(err) => {
                return Err(FetchError::NoHandler(format!(
                    "{}; default fetcher: {err}",
                    handler_errors.join("; ")
                )))
            }
        };
        let size = if desc.size == 0 {
            debug!(reference = %reference, digest = %desc.digest,
                "descriptor carries no size, asking the remote");
            fetcher.discover_size().await?
        } else {
            desc.size
        };
        if self.blob_config.force_single_range_mode {
            fetcher.enable_single_range_mode();
        }
        Ok(Blob::new(
            RegionFetcher::Http(fetcher),
            size,
            self.blob_config.valid_interval(),
            cache,
        ))
    }
}

/// A resolved blob: ranged reads over a fetcher plus the external cache.
pub struct Blob {
    fetcher: RegionFetcher,
    size: u64,
    valid_interval: Duration,
    last_checked: Mutex<Instant>,
    cache: Arc<dyn BlobCache>,
}

impl std::fmt::Debug for Blob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blob")
            .field("size", &self.size)
            .field("valid_interval", &self.valid_interval)
            .finish_non_exhaustive()
    }
}

impl Blob {
    fn new(
        fetcher: RegionFetcher,
        size: u64,
        valid_interval: Duration,
        cache: Arc<dyn BlobCache>,
    ) -> Self {
        Blob {
            fetcher,
            size,
            valid_interval,
            last_checked: Mutex::new(Instant::now()),
            cache,
        }
    }

    /// The blob size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Whether the validity interval has elapsed since the last successful
    /// check (or resolution).
    pub fn needs_revalidation(&self) -> bool {
        self.last_checked.lock().elapsed() > self.valid_interval
    }

    /// Probes the fetcher and, on success, restarts the validity interval.
    pub async fn check(&self) -> Result<()> {
        self.fetcher.check().await?;
        *self.last_checked.lock() = Instant::now();
        Ok(())
    }

    /// Fetches the given regions directly, bypassing the cache.
    pub async fn fetch(&self, regions: &[Region]) -> Result<PartStream> {
        self.fetcher.fetch(regions, true).await
    }

    /// The cache key for `region`.
    pub fn gen_id(&self, region: Region) -> String {
        self.fetcher.gen_id(region)
    }

    /// Reads `length` bytes at `offset`, consulting the cache first.
    ///
    /// Reads past the end of the blob are truncated. Sibling parts returned
    /// by a multi-part response are cached under their own keys.
    pub async fn read_at(&self, offset: u64, length: u64) -> Result<Bytes> {
        if offset >= self.size || length == 0 {
            return Ok(Bytes::new());
        }
        let length = length.min(self.size - offset);
        let region = Region::new(offset, offset + length - 1);

        let key = self.fetcher.gen_id(region);
        if let Some(data) = self.cache.get(&key).await {
            return Ok(data);
        }

        if self.needs_revalidation() {
            self.check().await?;
        }

        let mut parts = self.fetcher.fetch(&[region], true).await?;
        let mut wanted = None;
        while let Some(part) = parts.next().await? {
            let part_region = part.region;
            let data = part.bytes().await?;
            if part_region == region {
                self.cache.put(&key, data.clone()).await;
                wanted = Some(data);
            } else if part_region.begin <= region.begin && region.end <= part_region.end {
                let from = (region.begin - part_region.begin) as usize;
                let to = from + region.size() as usize;
                let slice = data.slice(from..to);
                self.cache.put(&key, slice.clone()).await;
                wanted = Some(slice);
            } else {
                self.cache.put(&self.fetcher.gen_id(part_region), data).await;
            }
        }
        wanted.ok_or_else(|| FetchError::UncoveredRegion {
            region: region.to_string(),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MemoryCache {
        entries: Mutex<HashMap<String, Bytes>>,
    }

    impl MemoryCache {
        fn new() -> Self {
            MemoryCache {
                entries: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl BlobCache for MemoryCache {
        async fn get(&self, key: &str) -> Option<Bytes> {
            self.entries.lock().get(key).cloned()
        }

        async fn put(&self, key: &str, data: Bytes) {
            self.entries.lock().insert(key.to_string(), data);
        }
    }

    /// Serves a fixed byte string, counting fetches.
    struct StaticFetcher {
        data: Bytes,
        fetches: AtomicUsize,
    }

    impl StaticFetcher {
        fn new(data: &'static [u8]) -> Arc<Self> {
            Arc::new(StaticFetcher {
                data: Bytes::from_static(data),
                fetches: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(
            &self,
            offset: u64,
            size: u64,
        ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let data = self.data.slice(offset as usize..(offset + size) as usize);
            Ok(Box::new(std::io::Cursor::new(data.to_vec())))
        }

        async fn check(&self) -> Result<()> {
            Ok(())
        }

        fn gen_id(&self, offset: u64, size: u64) -> String {
            format!("static-{offset}-{size}")
        }
    }

    struct StaticHandler {
        fetcher: Arc<StaticFetcher>,
    }

    #[async_trait]
    impl Handler for StaticHandler {
        async fn handle(&self, _desc: &BlobDescriptor) -> Result<(Arc<dyn Fetcher>, u64)> {
            Ok((self.fetcher.clone(), self.fetcher.data.len() as u64))
        }
    }

    struct RejectingHandler;

    #[async_trait]
    impl Handler for RejectingHandler {
        async fn handle(&self, desc: &BlobDescriptor) -> Result<(Arc<dyn Fetcher>, u64)> {
            Err(FetchError::NoHandler(desc.digest.clone()))
        }
    }

    fn descriptor() -> BlobDescriptor {
        BlobDescriptor {
            digest: "sha256:0000000000000000000000000000000000000000000000000000000000000000"
                .into(),
            size: 26,
        }
    }

    #[tokio::test]
    async fn handler_wins_over_default_fetcher() {
        let fetcher = StaticFetcher::new(b"abcdefghijklmnopqrstuvwxyz");
        let mut resolver = Resolver::new(BlobConfig::default());
        resolver.register_handler("static", Arc::new(StaticHandler { fetcher }));

        let reference: ImageReference = "ghcr.io/org/app:v1".parse().unwrap();
        let blob = resolver
            .resolve(&[], &reference, &descriptor(), Arc::new(NoopCache))
            .await
            .expect("handler provides the blob");
        assert_eq!(blob.size(), 26);
        assert_eq!(blob.read_at(0, 3).await.unwrap().as_ref(), b"abc");
    }

    #[tokio::test]
    async fn rejecting_handlers_fall_through_in_order() {
        let fetcher = StaticFetcher::new(b"abcdefghijklmnopqrstuvwxyz");
        let mut resolver = Resolver::new(BlobConfig::default());
        resolver.register_handler("first", Arc::new(RejectingHandler));
        resolver.register_handler("second", Arc::new(StaticHandler { fetcher }));

        let reference: ImageReference = "ghcr.io/org/app:v1".parse().unwrap();
        let blob = resolver
            .resolve(&[], &reference, &descriptor(), Arc::new(NoopCache))
            .await
            .expect("second handler provides the blob");
        assert_eq!(blob.read_at(23, 3).await.unwrap().as_ref(), b"xyz");
    }

    #[tokio::test]
    async fn all_handlers_err_and_no_hosts_fails() {
        let mut resolver = Resolver::new(BlobConfig::default());
        resolver.register_handler("only", Arc::new(RejectingHandler));
        let reference: ImageReference = "ghcr.io/org/app:v1".parse().unwrap();
        let err = resolver
            .resolve(&[], &reference, &descriptor(), Arc::new(NoopCache))
            .await
            .expect_err("nothing can provide the blob");
        assert!(matches!(err, FetchError::NoHandler(_)));
        assert!(err.to_string().contains("only"));
    }

    #[tokio::test]
    async fn read_at_hits_the_cache_on_the_second_read() {
        let fetcher = StaticFetcher::new(b"abcdefghijklmnopqrstuvwxyz");
        let counted = fetcher.clone();
        let mut resolver = Resolver::new(BlobConfig::default());
        resolver.register_handler("static", Arc::new(StaticHandler { fetcher }));

        let reference: ImageReference = "ghcr.io/org/app:v1".parse().unwrap();
        let blob = resolver
            .resolve(&[], &reference, &descriptor(), Arc::new(MemoryCache::new()))
            .await
            .unwrap();

        assert_eq!(blob.read_at(4, 4).await.unwrap().as_ref(), b"efgh");
        assert_eq!(blob.read_at(4, 4).await.unwrap().as_ref(), b"efgh");
        assert_eq!(counted.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_at_truncates_past_the_end() {
        let fetcher = StaticFetcher::new(b"abcdefghijklmnopqrstuvwxyz");
        let mut resolver = Resolver::new(BlobConfig::default());
        resolver.register_handler("static", Arc::new(StaticHandler { fetcher }));
        let reference: ImageReference = "ghcr.io/org/app:v1".parse().unwrap();
        let blob = resolver
            .resolve(&[], &reference, &descriptor(), Arc::new(NoopCache))
            .await
            .unwrap();

        assert_eq!(blob.read_at(24, 100).await.unwrap().as_ref(), b"yz");
        assert!(blob.read_at(26, 1).await.unwrap().is_empty());
        assert!(blob.read_at(0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gen_id_is_stable() {
        let fetcher = StaticFetcher::new(b"abcdefghijklmnopqrstuvwxyz");
        let mut resolver = Resolver::new(BlobConfig::default());
        resolver.register_handler("static", Arc::new(StaticHandler { fetcher }));
        let reference: ImageReference = "ghcr.io/org/app:v1".parse().unwrap();
        let blob = resolver
            .resolve(&[], &reference, &descriptor(), Arc::new(NoopCache))
            .await
            .unwrap();
        let region = Region::new(0, 9);
        assert_eq!(blob.gen_id(region), blob.gen_id(region));
    }
}
