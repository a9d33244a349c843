use crate::error::ReferenceError;
use sha2::{Digest, Sha256};
use std::fmt;

/// Docker Hub registry name used for references without a registry host
pub const DEFAULT_REGISTRY_NAME: &str = "docker.io";

const DEFAULT_TAG: &str = "latest";

/// Hostnames that all mean Docker Hub
const DOCKER_HUB_ALIASES: &[&str] = &["index.docker.io", "registry-1.docker.io", "registry.hub.docker.com"];

/// Longest readable prefix kept in a resource name (the hash suffix keeps names unique)
const RESOURCE_NAME_PREFIX_LEN: usize = 100;

/// Length of the hex hash suffix appended to resource names
const RESOURCE_NAME_HASH_LEN: usize = 12;

/// Used when nothing of the image name survives sanitising
const FALLBACK_RESOURCE_PREFIX: &str = "image";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reference {
    Tag(String),
    Digest(String),
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => write!(f, "{}", tag),
            Reference::Digest(digest) => write!(f, "{}", digest),
        }
    }
}

/// A fully qualified image reference: registry host, repository path and tag or digest.
///
/// The `Display` form is the canonical string stored in `spec.sourceImage`,
/// e.g. `docker.io/library/nginx:latest` or `quay.io/org/app@sha256:...`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub reference: Reference,
}

impl ImageReference {
    /// Parse an image reference as it appears in a pod spec.
    pub fn parse(image: &str) -> Result<Self, ReferenceError> {
        Self::parse_with_proxy_hosts(image, &[])
    }

    /// Parse an image reference, first stripping any leading proxy addresses.
    ///
    /// Images rewritten by the admission webhook look like
    /// `localhost:8082/docker.io/library/nginx:1.25`. Rewriting may have happened
    /// more than once, so every leading proxy segment is removed.
    pub fn parse_with_proxy_hosts(
        image: &str,
        proxy_hosts: &[String],
    ) -> Result<Self, ReferenceError> {
        let image = image.trim();
        if image.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let mut rest = strip_proxy_hosts(image, proxy_hosts);
        if rest.is_empty() {
            return Err(ReferenceError::Invalid(
                image.to_string(),
                "nothing left after removing proxy address",
            ));
        }

        let digest = match rest.split_once('@') {
            Some((name, digest)) => {
                rest = name;
                Some(digest)
            }
            None => None,
        };

        let last_slash = rest.rfind('/');
        let (name, tag) = match rest.rfind(':') {
            Some(idx) if last_slash.is_none_or(|slash| idx > slash) => {
                (&rest[..idx], Some(&rest[idx + 1..]))
            }
            _ => (rest, None),
        };

        let (registry, repository) = split_registry(name);
        if repository.is_empty() || repository.ends_with('/') || repository.contains("//") {
            return Err(ReferenceError::Invalid(
                image.to_string(),
                "empty repository path",
            ));
        }
        if registry.starts_with('.') || registry.contains('\\') {
            return Err(ReferenceError::Invalid(image.to_string(), "invalid registry host"));
        }
        if repository
            .split('/')
            .any(|segment| segment == "." || segment == ".." || segment.contains('\\'))
        {
            return Err(ReferenceError::Invalid(
                image.to_string(),
                "invalid repository path segment",
            ));
        }

        let reference = match (digest, tag) {
            (Some(digest), _) => {
                validate_digest(digest)
                    .map_err(|reason| ReferenceError::Invalid(image.to_string(), reason))?;
                Reference::Digest(digest.to_string())
            }
            (None, Some("")) => {
                return Err(ReferenceError::Invalid(image.to_string(), "empty tag"));
            }
            (None, Some(tag)) => Reference::Tag(tag.to_string()),
            (None, None) => Reference::Tag(DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            registry,
            repository,
            reference,
        })
    }

    /// Build a reference from the pieces of a registry API path
    /// (`/v2/<name>/manifests/<reference>`).
    pub fn from_api_path(
        name: &str,
        reference: &str,
        proxy_hosts: &[String],
    ) -> Result<Self, ReferenceError> {
        if reference.contains(':') {
            Self::parse_with_proxy_hosts(&format!("{}@{}", name, reference), proxy_hosts)
        } else {
            Self::parse_with_proxy_hosts(&format!("{}:{}", name, reference), proxy_hosts)
        }
    }

    pub fn is_digest(&self) -> bool {
        matches!(self.reference, Reference::Digest(_))
    }

    /// `registry/repository` without tag or digest
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Deterministic DNS-1123 name for the CachedImage record of this image.
    pub fn resource_name(&self) -> String {
        let canonical = self.to_string();
        let hash = format!("{:x}", Sha256::digest(canonical.as_bytes()));

        let sanitized: String = canonical
            .chars()
            .map(|c| match c {
                'a'..='z' | '0'..='9' | '.' | '-' => c,
                'A'..='Z' => c.to_ascii_lowercase(),
                _ => '-',
            })
            .take(RESOURCE_NAME_PREFIX_LEN)
            .collect();
        // Every dot-separated label must start and end alphanumeric
        let prefix = sanitized
            .split('.')
            .map(|label| label.trim_matches('-'))
            .filter(|label| !label.is_empty())
            .collect::<Vec<_>>()
            .join(".");
        let prefix = if prefix.is_empty() { FALLBACK_RESOURCE_PREFIX } else { prefix.as_str() };

        format!("{}-{}", prefix, &hash[..RESOURCE_NAME_HASH_LEN])
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reference {
            Reference::Tag(tag) => write!(f, "{}/{}:{}", self.registry, self.repository, tag),
            Reference::Digest(digest) => {
                write!(f, "{}/{}@{}", self.registry, self.repository, digest)
            }
        }
    }
}

impl std::str::FromStr for ImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn strip_proxy_hosts<'a>(image: &'a str, proxy_hosts: &[String]) -> &'a str {
    let mut rest = image;
    loop {
        let stripped = proxy_hosts.iter().find_map(|host| {
            rest.strip_prefix(host.as_str())
                .and_then(|after| after.strip_prefix('/'))
        });
        match stripped {
            Some(after) => rest = after,
            None => return rest,
        }
    }
}

/// Split `name` into registry host and repository path.
fn split_registry(name: &str) -> (String, String) {
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_ascii_lowercase(), rest.to_string())
        }
        _ => (DEFAULT_REGISTRY_NAME.to_string(), name.to_string()),
    };

    let registry = if DOCKER_HUB_ALIASES.contains(&registry.as_str()) {
        DEFAULT_REGISTRY_NAME.to_string()
    } else {
        registry
    };

    // Docker Hub official images live under library/
    if registry == DEFAULT_REGISTRY_NAME && !repository.contains('/') && !repository.is_empty() {
        return (registry, format!("library/{}", repository));
    }
    (registry, repository)
}

fn validate_digest(digest: &str) -> Result<(), &'static str> {
    let (algorithm, hex) = digest.split_once(':').ok_or("digest without algorithm")?;
    if algorithm.is_empty() || hex.is_empty() {
        return Err("malformed digest");
    }
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("digest is not hexadecimal");
    }
    Ok(())
}
