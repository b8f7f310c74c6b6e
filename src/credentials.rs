//! Credential providers for registry hosts.
//!
//! Providers are opaque callbacks owned by the embedding application (Docker
//! config files, cloud credential helpers, keychains). This module defines
//! only the contract and the chaining rule: providers are asked in order, the
//! first non-empty pair wins, and a failing provider aborts the chain.

use std::sync::Arc;

use crate::errors::{FetchError, Result};
use crate::reference::ImageReference;

/// A username/secret pair for a registry.
#[derive(Clone)]
pub struct Credentials {
    /// Account name, or a registry-specific sentinel such as `<token>`.
    pub username: String,
    /// Password, identity token or other secret.
    pub secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Boxed error returned by a provider callback.
pub type ProviderError = Box<dyn std::error::Error + Send + Sync>;

/// A provider keyed by registry host. `Ok(None)` means "I have nothing, try
/// the next provider".
pub type CredentialFn =
    Arc<dyn Fn(&str) -> std::result::Result<Option<Credentials>, ProviderError> + Send + Sync>;

/// A provider keyed by the full image reference, for callers that scope
/// credentials per image rather than per host.
pub type ReferenceCredentialFn = Arc<
    dyn Fn(&ImageReference) -> std::result::Result<Option<Credentials>, ProviderError>
        + Send
        + Sync,
>;

/// Adapts a reference-keyed provider into a host-keyed one bound to `reference`.
pub fn bind_reference(provider: ReferenceCredentialFn, reference: ImageReference) -> CredentialFn {
    Arc::new(move |host: &str| {
        if host == reference.resolve_registry() || host == reference.registry() {
            provider(&reference)
        } else {
            Ok(None)
        }
    })
}

/// An ordered chain of credential providers.
#[derive(Clone, Default)]
pub struct CredentialChain {
    providers: Vec<CredentialFn>,
}

impl CredentialChain {
    /// Creates an empty chain (anonymous access).
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a provider to the chain.
    pub fn push(&mut self, provider: CredentialFn) {
        self.providers.push(provider);
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, provider: CredentialFn) -> Self {
        self.push(provider);
        self
    }

    /// Asks each provider in order for credentials for `host`.
    ///
    /// The first provider returning a non-empty pair wins. A provider error
    /// aborts the chain. An exhausted chain yields `Ok(None)` (anonymous).
    pub fn get(&self, host: &str) -> Result<Option<Credentials>> {
        for provider in &self.providers {
            match provider(host) {
                Ok(Some(creds)) if !(creds.username.is_empty() && creds.secret.is_empty()) => {
                    return Ok(Some(creds));
                }
                Ok(_) => continue,
                Err(err) => {
                    return Err(FetchError::CredentialProvider {
                        host: host.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for CredentialChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialChain")
            .field("providers", &self.providers.len())
            .finish()
    }
}
