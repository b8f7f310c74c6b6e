//! Per-blob ranged fetching.
//!
//! An [`HttpFetcher`] serves byte regions of one blob. At construction it
//! resolves the registry-facing blob URL to the redirected backend URL
//! (S3, GCS, ...) with a 1-byte ranged GET; fetches then go straight to the
//! backend, falling back to a URL refresh when its signature expires and to
//! single-range mode when it rejects multi-range requests.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use reqwest::header::{
    HeaderValue, ACCEPT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use reqwest::{Method, Request, StatusCode, Url};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::auth::AuthClient;
use crate::config::BlobConfig;
use crate::errors::{FetchError, Result};
use crate::hosts::RegistryHost;
use crate::redact;
use crate::reference::ImageReference;
use crate::regexp::{must_compile, CONTENT_RANGE_REGEXP};
use crate::region::{super_region, Region, RegionSet};
use crate::scope::ScopeSet;

lazy_static! {
    static ref CONTENT_RANGE_RE: regex::Regex = must_compile(CONTENT_RANGE_REGEXP);
}

/// The blob a fetcher is created for.
#[derive(Debug, Clone)]
pub struct BlobDescriptor {
    /// Content digest, `sha256:<hex>`.
    pub digest: String,
    /// Blob size in bytes; `0` means unknown and triggers size discovery.
    pub size: u64,
}

struct BlobUrls {
    real: Url,
    safe: String,
}

/// Fetches byte regions of a single blob.
///
/// Safe for concurrent `fetch` calls: the redirected URL and the sticky
/// single-range flag sit behind independent fine-grained locks, snapshotted
/// before any network I/O.
pub struct HttpFetcher {
    client: Arc<AuthClient>,
    scope: ScopeSet,
    base_blob_url: Url,
    urls: Mutex<BlobUrls>,
    digest: String,
    single_range: AtomicBool,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("base_blob_url", &self.base_blob_url)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

enum Attempt {
    Parts(PartStream),
    /// 401/403: the auth transport already answered any token challenge, so
    /// what is left is a stale pre-signed URL.
    Denied(StatusCode),
    /// 400: the backend rejected the request shape (GCS does this for
    /// multi-range).
    Rejected(StatusCode),
}

impl HttpFetcher {
    /// Builds a fetcher for `desc`, trying `hosts` in order.
    ///
    /// The first host whose redirect probe succeeds wins; if every host
    /// fails the per-host causes are joined into the returned error.
    pub async fn new(
        hosts: &[RegistryHost],
        reference: &ImageReference,
        desc: &BlobDescriptor,
        blob_config: &BlobConfig,
    ) -> Result<HttpFetcher> {
        if desc.digest.is_empty() {
            return Err(FetchError::MissingDigest);
        }
        let scope = ScopeSet::repository_pull(reference.repository());

        let mut causes = Vec::new();
        for host in hosts {
            if host.host.is_empty() || host.host.contains('/') {
                causes.push(
                    FetchError::InvalidHost {
                        host: host.host.clone(),
                    }
                    .to_string(),
                );
                continue;
            }

            // Blob requests get their own deadlines and retry budget on a
            // client sharing the host's connection pool.
            let retry = host
                .client
                .retry_client()
                .with_retry_settings(
                    blob_config.max_retries,
                    std::time::Duration::from_millis(blob_config.min_wait_msec),
                    std::time::Duration::from_millis(blob_config.max_wait_msec),
                )
                .with_request_timeout(blob_config.fetch_timeout());
            let client = Arc::new(host.client.clone_with_client(Arc::new(retry)));

            let base = format!(
                "{}://{}{}/{}/blobs/{}",
                host.scheme.as_str(),
                host.host,
                host.path,
                reference.repository(),
                desc.digest,
            );
            let base_blob_url = match Url::parse(&base) {
                Ok(url) => url,
                Err(err) => {
                    causes.push(format!("host {:?}: bad blob URL: {err}", host.host));
                    continue;
                }
            };

            match redirect(&client, &base_blob_url, &scope).await {
                Ok(real) => {
                    let safe = redact::safe_url(&real);
                    debug!(host = %host.host, url = %safe, "resolved blob backend URL");
                    return Ok(HttpFetcher {
                        client,
                        scope,
                        base_blob_url,
                        urls: Mutex::new(BlobUrls { real, safe }),
                        digest: desc.digest.clone(),
                        single_range: AtomicBool::new(false),
                    });
                }
                Err(err) => {
                    causes.push(
                        FetchError::FailedToRedirect {
                            host: host.host.clone(),
                            reason: err.to_string(),
                        }
                        .to_string(),
                    );
                    continue;
                }
            }
        }

        Err(FetchError::UnableToCreateFetcher {
            causes: causes.join("; "),
        })
    }

    /// Fetches `regions`, coalesced into a minimal covering set.
    ///
    /// `allow_retry` grants one internal retry, spent either on a URL
    /// refresh (401/403) or on the multi-range to single-range fallback
    /// (400). Worst case the call issues two ranged requests.
    pub async fn fetch(&self, regions: &[Region], allow_retry: bool) -> Result<PartStream> {
        if regions.is_empty() {
            return Err(FetchError::NoRegion);
        }
        let mut retry = allow_retry;
        loop {
            let single_range = self.is_single_range_mode();
            match self.fetch_once(regions, single_range).await? {
                Attempt::Parts(parts) => return Ok(parts),
                Attempt::Denied(status) if retry => {
                    retry = false;
                    info!(status = status.as_u16(), "refreshing blob URL and retrying");
                    self.refresh_url().await.map_err(|err| {
                        FetchError::FailedToRefreshUrl {
                            status: status.as_u16(),
                            reason: err.to_string(),
                        }
                    })?;
                }
                Attempt::Rejected(status) if retry && !single_range => {
                    retry = false;
                    info!(
                        status = status.as_u16(),
                        "server rejected multi-range request, switching to single range mode"
                    );
                    self.enable_single_range_mode();
                }
                Attempt::Denied(status) | Attempt::Rejected(status) => {
                    return Err(FetchError::UnexpectedStatusCode {
                        status: status.as_u16(),
                        operation: "fetch",
                    });
                }
            }
        }
    }

    async fn fetch_once(&self, regions: &[Region], single_range: bool) -> Result<Attempt> {
        // Squash the requested regions; header sizes are limited and servers
        // reject oversized Range headers.
        let mut set = RegionSet::new();
        for region in regions {
            set.add(*region);
        }
        let mut requests = set.into_regions();
        if single_range {
            requests = vec![super_region(&requests)];
        }

        let mut req = Request::new(Method::GET, self.snapshot_url());
        let ranges = requests
            .iter()
            .map(|r| format!("{}-{}", r.begin, r.end))
            .collect::<Vec<_>>()
            .join(",");
        req.headers_mut().insert(
            RANGE,
            HeaderValue::from_str(&format!("bytes={ranges}"))
                .map_err(|e| FetchError::RequestFailed(e.to_string()))?,
        );
        req.headers_mut()
            .insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));

        let start = Instant::now();
        let resp = self.client.execute(req, &self.scope).await?;
        let status = resp.status();
        debug!(
            digest = %self.digest,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "registry get"
        );

        match status {
            // The whole blob in one part.
            StatusCode::OK => {
                let length = parse_content_length(resp.headers())?;
                let resp = into_live(resp)?;
                if length == 0 {
                    return Ok(Attempt::Parts(PartStream::empty()));
                }
                Ok(Attempt::Parts(PartStream::single(
                    Region::new(0, length - 1),
                    body_reader(resp),
                )))
            }
            StatusCode::PARTIAL_CONTENT => {
                let content_type = resp
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                if content_type
                    .split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .starts_with("multipart/")
                {
                    let boundary = parse_boundary(&content_type).ok_or_else(|| {
                        FetchError::CannotParseContentType(content_type.clone())
                    })?;
                    let resp = into_live(resp)?;
                    return Ok(Attempt::Parts(PartStream::multipart(
                        body_reader(resp),
                        boundary,
                    )));
                }
                let range = resp
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let (region, _) = parse_content_range(&range)?;
                let resp = into_live(resp)?;
                Ok(Attempt::Parts(PartStream::single(region, body_reader(resp))))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                resp.drain().await;
                Ok(Attempt::Denied(status))
            }
            StatusCode::BAD_REQUEST => {
                resp.drain().await;
                Ok(Attempt::Rejected(status))
            }
            _ => {
                resp.drain().await;
                Err(FetchError::UnexpectedStatusCode {
                    status: status.as_u16(),
                    operation: "fetch",
                })
            }
        }
    }

    /// Liveness probe: a 1-byte ranged GET. A 403 gets one URL refresh
    /// before the probe is considered failed.
    pub async fn check(&self) -> Result<()> {
        let mut req = Request::new(Method::GET, self.snapshot_url());
        req.headers_mut()
            .insert(RANGE, HeaderValue::from_static("bytes=0-1"));
        let resp = self.client.execute(req, &self.scope).await?;
        let status = resp.status();
        resp.drain().await;
        match status {
            StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(()),
            StatusCode::FORBIDDEN => {
                self.refresh_url()
                    .await
                    .map_err(|err| FetchError::FailedToRefreshUrl {
                        status: status.as_u16(),
                        reason: err.to_string(),
                    })
            }
            _ => Err(FetchError::UnexpectedStatusCode {
                status: status.as_u16(),
                operation: "check",
            }),
        }
    }

    /// Stable cache identifier for `region`.
    ///
    /// Derived from the registry-facing URL, never the redirected one: the
    /// backend URL changes with every re-signing while the identity of the
    /// bytes does not.
    pub fn gen_id(&self, region: Region) -> String {
        let sum = Sha256::digest(format!(
            "{}-{}-{}",
            self.base_blob_url, region.begin, region.end
        ));
        format!("{sum:x}")
    }

    /// Re-runs the redirect probe against the registry-facing URL and swaps
    /// in the freshly signed backend URL.
    pub async fn refresh_url(&self) -> Result<()> {
        let real = redirect(&self.client, &self.base_blob_url, &self.scope).await?;
        let safe = redact::safe_url(&real);
        debug!(url = %safe, "refreshed blob backend URL");
        let mut urls = self.urls.lock();
        urls.real = real;
        urls.safe = safe;
        Ok(())
    }

    /// Discovers the blob size when the descriptor did not carry one.
    ///
    /// HEAD first; some backends reject HEAD entirely, so fall back to a
    /// 1-byte GET and read the total out of `Content-Range`.
    pub async fn discover_size(&self) -> Result<u64> {
        let req = Request::new(Method::HEAD, self.snapshot_url());
        let resp = self.client.execute(req, &self.scope).await?;
        let head_status = resp.status();
        if head_status == StatusCode::OK {
            let length = parse_content_length(resp.headers())?;
            resp.drain().await;
            return Ok(length);
        }
        resp.drain().await;

        let mut req = Request::new(Method::GET, self.snapshot_url());
        req.headers_mut()
            .insert(RANGE, HeaderValue::from_static("bytes=0-1"));
        let resp = self.client.execute(req, &self.scope).await?;
        let get_status = resp.status();
        match get_status {
            StatusCode::OK => {
                let length = parse_content_length(resp.headers())?;
                resp.drain().await;
                Ok(length)
            }
            StatusCode::PARTIAL_CONTENT => {
                let range = resp
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                resp.drain().await;
                let (_, total) = parse_content_range(&range)?;
                Ok(total)
            }
            _ => {
                resp.drain().await;
                Err(FetchError::FailedToRetrieveSize {
                    head_status: head_status.as_u16(),
                    get_status: get_status.as_u16(),
                })
            }
        }
    }

    /// Sticks the fetcher to single-range requests.
    pub fn enable_single_range_mode(&self) {
        self.single_range.store(true, Ordering::Relaxed);
    }

    /// Whether fetches are coalesced to a single range.
    pub fn is_single_range_mode(&self) -> bool {
        self.single_range.load(Ordering::Relaxed)
    }

    /// The redacted backend URL, for diagnostics.
    pub fn safe_blob_url(&self) -> String {
        self.urls.lock().safe.clone()
    }

    fn snapshot_url(&self) -> Url {
        self.urls.lock().real.clone()
    }
}

/// Resolves a blob URL to its redirected backend URL.
///
/// Uses a 1-byte ranged GET rather than HEAD: gcr.io and ghcr.io answer HEAD
/// with 200 and no Location header. The client follows up to 10 redirects;
/// the terminal request URL is the backend URL.
async fn redirect(client: &AuthClient, blob_url: &Url, scope: &ScopeSet) -> Result<Url> {
    let mut req = Request::new(Method::GET, blob_url.clone());
    req.headers_mut()
        .insert(RANGE, HeaderValue::from_static("bytes=0-1"));
    let resp = client.execute(req, scope).await?;
    let status = resp.status();
    if !status.is_success() {
        resp.drain().await;
        return Err(FetchError::UnexpectedStatusCode {
            status: status.as_u16(),
            operation: "redirect",
        });
    }
    let real = resp.url().clone();
    resp.drain().await;
    Ok(real)
}

fn into_live(resp: crate::auth::RegistryResponse) -> Result<reqwest::Response> {
    resp.into_response()
        .ok_or_else(|| FetchError::RequestFailed("response body already consumed".into()))
}

fn parse_content_length(headers: &reqwest::header::HeaderMap) -> Result<u64> {
    let raw = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    raw.parse::<u64>()
        .map_err(|_| FetchError::CannotParseContentLength(raw.to_string()))
}

fn parse_content_range(header: &str) -> Result<(Region, u64)> {
    let caps = CONTENT_RANGE_RE
        .captures(header)
        .ok_or_else(|| FetchError::CannotParseContentRange(header.to_string()))?;
    let begin = caps[1]
        .parse::<u64>()
        .map_err(|_| FetchError::CannotParseContentRange(header.to_string()))?;
    let end = caps[2]
        .parse::<u64>()
        .map_err(|_| FetchError::CannotParseContentRange(header.to_string()))?;
    let total = caps[3]
        .parse::<u64>()
        .map_err(|_| FetchError::CannotParseContentRange(header.to_string()))?;
    Ok((Region::new(begin, end), total))
}

fn parse_boundary(content_type: &str) -> Option<String> {
    for param in content_type.split(';').skip(1) {
        if let Some((key, value)) = param.split_once('=') {
            if key.trim().eq_ignore_ascii_case("boundary") {
                return Some(value.trim().trim_matches('"').to_string());
            }
        }
    }
    None
}

type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

fn body_reader(resp: reqwest::Response) -> BodyReader {
    let stream: BoxStream<'static, std::io::Result<Bytes>> = resp
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        .boxed();
    Box::new(StreamReader::new(stream))
}

/// One region of a fetch result.
///
/// Implements [`AsyncRead`] over the part's payload.
pub struct Part {
    /// The byte region this part covers.
    pub region: Region,
    reader: PartReader,
}

enum PartReader {
    Stream(BodyReader),
    Chunk(std::io::Cursor<Bytes>),
}

impl Part {
    /// Reads the whole payload.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)
            .await
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;
        Ok(Bytes::from(buf))
    }
}

impl AsyncRead for Part {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.reader {
            PartReader::Stream(r) => Pin::new(r).poll_read(cx, buf),
            PartReader::Chunk(c) => Pin::new(c).poll_read(cx, buf),
        }
    }
}

/// Iterator over the parts of a ranged response.
///
/// A 200 yields the whole blob as one part; a single-range 206 yields one
/// part; a `multipart/*` 206 yields one part per MIME part, each framed by
/// its own `Content-Range`.
pub struct PartStream {
    inner: PartStreamKind,
}

impl std::fmt::Debug for PartStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartStream").finish_non_exhaustive()
    }
}

enum PartStreamKind {
    Single {
        region: Region,
        reader: Option<BodyReader>,
    },
    Multipart(MultipartReader),
}

impl PartStream {
    pub(crate) fn single(region: Region, reader: BodyReader) -> Self {
        PartStream {
            inner: PartStreamKind::Single {
                region,
                reader: Some(reader),
            },
        }
    }

    pub(crate) fn empty() -> Self {
        PartStream {
            inner: PartStreamKind::Single {
                region: Region::new(0, 0),
                reader: None,
            },
        }
    }

    pub(crate) fn multipart(reader: BodyReader, boundary: String) -> Self {
        PartStream {
            inner: PartStreamKind::Multipart(MultipartReader {
                reader: BufReader::new(reader),
                boundary,
                started: false,
                done: false,
            }),
        }
    }

    /// The next part, or `None` when the response is exhausted.
    ///
    /// Multipart payloads are framed by the part's declared size, so each
    /// part must be consumed (or dropped) before the next call.
    pub async fn next(&mut self) -> Result<Option<Part>> {
        match &mut self.inner {
            PartStreamKind::Single { region, reader } => Ok(reader.take().map(|r| Part {
                region: *region,
                reader: PartReader::Stream(r),
            })),
            PartStreamKind::Multipart(m) => m.next_part().await,
        }
    }
}

struct MultipartReader {
    reader: BufReader<BodyReader>,
    boundary: String,
    started: bool,
    done: bool,
}

impl MultipartReader {
    async fn next_part(&mut self) -> Result<Option<Part>> {
        if self.done {
            return Ok(None);
        }
        let delimiter = format!("--{}", self.boundary);
        let terminator = format!("--{}--", self.boundary);

        if !self.started {
            // Skip any preamble up to the first boundary line.
            loop {
                let line = self.read_line().await?;
                if line == delimiter {
                    break;
                }
                if line == terminator {
                    self.done = true;
                    return Ok(None);
                }
            }
            self.started = true;
        }

        // Part headers, terminated by an empty line.
        let mut content_range = None;
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-range") {
                    content_range = Some(value.trim().to_string());
                }
            }
        }
        let content_range = content_range
            .ok_or_else(|| FetchError::MalformedMultipart("part carries no Content-Range".into()))?;
        let (region, _) = parse_content_range(&content_range)?;

        // The payload length is the declared region size.
        let mut payload = vec![0u8; region.size() as usize];
        self.reader.read_exact(&mut payload).await.map_err(|e| {
            FetchError::MalformedMultipart(format!("truncated part payload: {e}"))
        })?;

        // The payload is followed by CRLF and the next delimiter.
        let blank = self.read_line().await?;
        if !blank.is_empty() {
            return Err(FetchError::MalformedMultipart(
                "missing CRLF after part payload".into(),
            ));
        }
        let line = self.read_line().await?;
        if line == terminator {
            self.done = true;
        } else if line != delimiter {
            return Err(FetchError::MalformedMultipart(format!(
                "unexpected boundary line {line:?}"
            )));
        }

        Ok(Some(Part {
            region,
            reader: PartReader::Chunk(std::io::Cursor::new(Bytes::from(payload))),
        }))
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| FetchError::MalformedMultipart(e.to_string()))?;
        if n == 0 {
            return Err(FetchError::MalformedMultipart(
                "unexpected end of multipart body".into(),
            ));
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        String::from_utf8(buf)
            .map_err(|_| FetchError::MalformedMultipart("non-UTF-8 header line".into()))
    }
}
