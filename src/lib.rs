//! A client-side HTTP access layer for OCI/Docker v2 container registries,
//! built for lazy blob access: ranged reads of layer blobs over redirected
//! backend URLs, challenge-response authentication with in-process token
//! caching, mirror fallback, and retry with jittered backoff.
//!
//! The stack has three cooperating transports. [`retry::RetryClient`] wraps
//! the shared `reqwest` client with bounded, jittered retries and redacts
//! query values from every URL its errors carry. [`auth::AuthClient`]
//! composes over it, answering `WWW-Authenticate` challenges through an
//! [`auth::AuthHandler`] and re-sending a challenged request exactly once;
//! its registry-aware policy also recognises token expiry disguised as
//! ECR's 403 and S3's 400. [`fetcher::HttpFetcher`] sits on top, serving
//! byte regions of one blob with multipart responses, URL re-signing on
//! expiry, and a sticky single-range fallback for backends that reject
//! multi-range requests.
//!
//! ```no_run
//! use std::sync::Arc;
//! use oci_rangefetch::{
//!     BlobConfig, BlobDescriptor, CredentialChain, HostResolver, ImageReference, NoopCache,
//!     RegistryConfig, Resolver, RetryConfig,
//! };
//!
//! # async fn run() -> oci_rangefetch::Result<()> {
//! let hosts = HostResolver::new(
//!     RetryConfig::default(),
//!     RegistryConfig::default(),
//!     CredentialChain::new(),
//! )?;
//! let reference: ImageReference = "ghcr.io/org/app:v1".parse()?;
//! let desc = BlobDescriptor {
//!     digest: "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".into(),
//!     size: 0,
//! };
//! let resolver = Resolver::new(BlobConfig::default());
//! let candidates = hosts.resolve(&reference).await;
//! let blob = resolver
//!     .resolve(&candidates, &reference, &desc, Arc::new(NoopCache))
//!     .await?;
//! let bytes = blob.read_at(0, 4096).await?;
//! # let _ = bytes;
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

pub mod auth;
pub mod bearer;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod fetcher;
pub mod hosts;
mod redact;
mod reference;
mod regexp;
pub mod region;
pub mod resolver;
pub mod retry;
mod scope;
mod token_cache;

#[doc(inline)]
pub use auth::{AuthClient, AuthDecision, AuthHandler, AuthPolicy, RegistryResponse};
#[doc(inline)]
pub use bearer::BearerAuthHandler;
#[doc(inline)]
pub use config::{BlobConfig, MirrorConfig, RegistryConfig, RetryConfig};
#[doc(inline)]
pub use credentials::{CredentialChain, CredentialFn, Credentials};
#[doc(inline)]
pub use errors::{FetchError, Result};
#[doc(inline)]
pub use fetcher::{BlobDescriptor, HttpFetcher, Part, PartStream};
#[doc(inline)]
pub use hosts::{HostCapabilities, HostResolver, RegistryHost, Scheme};
#[doc(inline)]
pub use redact::REDACTED;
#[doc(inline)]
pub use reference::ImageReference;
#[doc(inline)]
pub use region::{Region, RegionSet};
#[doc(inline)]
pub use resolver::{Blob, BlobCache, Fetcher, Handler, NoopCache, Resolver};
#[doc(inline)]
pub use retry::RetryClient;
#[doc(inline)]
pub use scope::ScopeSet;
