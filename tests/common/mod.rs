//! Shared stub-registry plumbing for the integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use oci_rangefetch::{
    hosts::global_headers, AuthClient, AuthPolicy, BearerAuthHandler, CredentialChain,
    HostCapabilities, RegistryHost, RetryClient, RetryConfig, Scheme,
};

/// An axum server on an ephemeral localhost port, aborted on drop.
pub struct StubServer {
    handle: JoinHandle<()>,
    pub addr: String,
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort()
    }
}

impl StubServer {
    /// Binds a port, then builds the router with the server's own address
    /// (so handlers can emit absolute redirect URLs).
    pub async fn start(build: impl FnOnce(&str) -> Router) -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .unwrap();
        let addr = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let app = build(&addr);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        StubServer { handle, addr }
    }
}

/// A retry config with short waits, to keep tests fast.
pub fn fast_retry_config(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        min_wait_msec: 10,
        max_wait_msec: 100,
        ..Default::default()
    }
}

/// The full client stack over a fresh connection pool.
pub fn auth_client(config: &RetryConfig, credentials: CredentialChain) -> Arc<AuthClient> {
    let retry = Arc::new(RetryClient::new(config).unwrap());
    let handler = Arc::new(BearerAuthHandler::new(Arc::clone(&retry), credentials));
    Arc::new(
        AuthClient::new(retry, handler)
            .with_policy(AuthPolicy::RegistryAware)
            .with_headers(global_headers()),
    )
}

/// A plaintext registry host entry for a stub server.
pub fn http_host(addr: &str, client: Arc<AuthClient>) -> RegistryHost {
    RegistryHost {
        client,
        host: addr.to_string(),
        scheme: Scheme::Http,
        path: "/v2".to_string(),
        capabilities: HostCapabilities::PULL | HostCapabilities::RESOLVE,
    }
}

/// Deterministic blob content: byte `i` is the ASCII digit `i % 10`, so the
/// slice `10..=19` reads `0123456789`.
pub fn blob_content(size: usize) -> Vec<u8> {
    (0..size).map(|i| b'0' + (i % 10) as u8).collect()
}

pub const TEST_DIGEST: &str =
    "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

/// Parses `bytes=a-b,c-d` into offset pairs.
pub fn parse_ranges(header: &str) -> Vec<(usize, usize)> {
    header
        .trim_start_matches("bytes=")
        .split(',')
        .map(|range| {
            let (begin, end) = range.split_once('-').unwrap();
            (begin.parse().unwrap(), end.parse().unwrap())
        })
        .collect()
}

/// Builds a `multipart/byteranges` body over `content` for `ranges`.
pub fn multipart_body(content: &[u8], ranges: &[(usize, usize)], boundary: &str) -> Vec<u8> {
    let mut body = Vec::new();
    for (begin, end) in ranges {
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Type: application/octet-stream\r\nContent-Range: bytes {begin}-{end}/{}\r\n\r\n",
                content.len()
            )
            .as_bytes(),
        );
        body.extend_from_slice(&content[*begin..=*end]);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    body
}
