//! Image references (`registry/repository[:tag][@digest]`).

use std::fmt;
use std::str::FromStr;

use lazy_static::lazy_static;

use crate::errors::FetchError;
use crate::regexp::{must_compile, REFERENCE_REGEXP};

/// Hostname callers write for Docker Hub.
const DOCKER_HUB_ALIAS: &str = "docker.io";
/// Hostname Docker Hub actually serves the v2 API from. Callers never see
/// this mapping; it is applied at host-resolution time.
const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";
/// Implied repository namespace for bare Docker Hub names like `ubuntu`.
const DOCKER_HUB_LIBRARY: &str = "library";

lazy_static! {
    static ref REFERENCE_RE: regex::Regex = must_compile(REFERENCE_REGEXP);
}

/// A parsed image reference.
///
/// ```
/// use oci_rangefetch::ImageReference;
///
/// let r: ImageReference = "ghcr.io/org/app:v1".parse().unwrap();
/// assert_eq!(r.registry(), "ghcr.io");
/// assert_eq!(r.repository(), "org/app");
/// assert_eq!(r.tag(), Some("v1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// The registry hostname (and optional port) as written by the caller.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag, if one was given.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The digest, if one was given.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// The registry to actually connect to, with the Docker Hub alias
    /// rewritten to its real API host.
    pub fn resolve_registry(&self) -> &str {
        if self.registry == DOCKER_HUB_ALIAS {
            DOCKER_HUB_REGISTRY
        } else {
            &self.registry
        }
    }
}

impl FromStr for ImageReference {
    type Err = FetchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = REFERENCE_RE
            .captures(s)
            .ok_or_else(|| FetchError::InvalidReference(s.to_string()))?;
        let name = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        if name.is_empty() {
            return Err(FetchError::InvalidReference(s.to_string()));
        }
        let tag = captures.get(2).map(|m| m.as_str().to_string());
        let digest = captures.get(3).map(|m| m.as_str().to_string());

        // The grammar does not distinguish a registry from the first path
        // component; a component counts as a registry when it looks like a
        // hostname (dots or a port) or is literally "localhost".
        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => {
                let repository = if name.contains('/') {
                    name.to_string()
                } else {
                    format!("{DOCKER_HUB_LIBRARY}/{name}")
                };
                (DOCKER_HUB_ALIAS.to_string(), repository)
            }
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
